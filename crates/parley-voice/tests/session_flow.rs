//! End-to-end session flow over the manager's channel transport: a full
//! listening turn, a synthesis turn cut off by barge-in, and the follow-up
//! turn after the interruption.

use parley_voice::{
    codec, EngineConfig, PlaceholderBackend, SessionManager, WireMessage,
};
use std::sync::Arc;
use std::time::Duration;

fn text_frame(json: &str) -> WireMessage {
    WireMessage::Text(json.to_string())
}

fn audio_frame(bytes: usize) -> WireMessage {
    WireMessage::Binary(codec::encode_frame(
        codec::FRAME_KIND_CLIENT_AUDIO,
        &vec![0u8; bytes],
    ))
}

/// Wait for the next text frame matching `needle`, discarding everything
/// before it.
async fn await_text(
    out_rx: &mut tokio::sync::mpsc::UnboundedReceiver<WireMessage>,
    needle: &str,
) -> String {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, out_rx.recv()).await {
            Ok(Some(WireMessage::Text(t))) if t.contains(needle) => return t,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("session closed while waiting for `{needle}`"),
            Err(_) => panic!("timed out waiting for `{needle}`"),
        }
    }
}

#[tokio::test]
async fn listening_turn_yields_final_transcription() {
    let manager = SessionManager::new(
        EngineConfig::default(),
        Arc::new(PlaceholderBackend::with_transcript("what's the weather")),
        None,
    );
    let mut conn = manager.connect(None);
    await_text(&mut conn.out_rx, "ready").await;

    conn.in_tx
        .send(text_frame(
            r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#,
        ))
        .unwrap();
    for _ in 0..3 {
        conn.in_tx.send(audio_frame(4096)).unwrap();
    }
    conn.in_tx
        .send(text_frame(r#"{"type":"audio_end"}"#))
        .unwrap();

    let transcription = await_text(&mut conn.out_rx, "transcription").await;
    assert!(transcription.contains("what's the weather"));
    assert!(transcription.contains(r#""is_final":true"#));
}

#[tokio::test]
async fn barge_in_stops_audio_and_next_turn_completes() {
    // Long, slow synthesis so the barge-in lands mid-stream.
    let manager = SessionManager::new(
        EngineConfig::default(),
        Arc::new(PlaceholderBackend {
            transcript: Some("never mind".to_string()),
            chunk_count: 500,
            chunk_bytes: 4096,
            chunk_delay: Duration::from_millis(10),
            ..PlaceholderBackend::default()
        }),
        None,
    );
    let mut conn = manager.connect(None);
    await_text(&mut conn.out_rx, "ready").await;

    conn.in_tx
        .send(text_frame(
            r#"{"type":"synthesize","text":"a very long explanation"}"#,
        ))
        .unwrap();
    await_text(&mut conn.out_rx, "audio_start").await;

    // Let some audio flow, then barge in.
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.in_tx
        .send(text_frame(
            r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#,
        ))
        .unwrap();

    // Drain whatever was in flight, then verify the stream has actually
    // stopped: after a quiet window no further binary frames arrive.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while conn.out_rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late_audio = 0;
    while let Ok(msg) = conn.out_rx.try_recv() {
        if matches!(msg, WireMessage::Binary(_)) {
            late_audio += 1;
        }
    }
    assert_eq!(late_audio, 0, "synthesis audio continued after barge-in");

    // The interrupting turn completes normally.
    conn.in_tx.send(audio_frame(2048)).unwrap();
    conn.in_tx
        .send(text_frame(r#"{"type":"audio_end"}"#))
        .unwrap();
    let transcription = await_text(&mut conn.out_rx, "transcription").await;
    assert!(transcription.contains("never mind"));
}

#[tokio::test]
async fn oversized_chunk_reports_error_and_session_survives() {
    let config = EngineConfig::default();
    let max = config.max_chunk_bytes;
    let manager = SessionManager::new(
        config,
        Arc::new(PlaceholderBackend::with_transcript("still here")),
        None,
    );
    let mut conn = manager.connect(None);
    await_text(&mut conn.out_rx, "ready").await;

    conn.in_tx
        .send(text_frame(
            r#"{"type":"audio_start","sample_rate":16000,"channels":1}"#,
        ))
        .unwrap();
    conn.in_tx.send(audio_frame(max + 1)).unwrap();
    let error = await_text(&mut conn.out_rx, "error").await;
    assert!(error.contains("chunk_too_large"));

    // The rejected chunk was not buffered; the turn still completes.
    conn.in_tx.send(audio_frame(1024)).unwrap();
    conn.in_tx
        .send(text_frame(r#"{"type":"audio_end"}"#))
        .unwrap();
    let transcription = await_text(&mut conn.out_rx, "transcription").await;
    assert!(transcription.contains("still here"));
}
