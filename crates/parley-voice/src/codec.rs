//! Audio transport codec
//!
//! Pure functions for the binary side of the wire protocol: audio chunk
//! framing, WAV container assembly for STT submission, and PCM duration
//! math. No state lives here.
//!
//! Binary frame layout (little-endian):
//! `magic "PVWS" (4) | version (1) | kind (1) | reserved (2) | payload`.

use crate::error::{VoiceError, VoiceResult};

pub const FRAME_MAGIC: &[u8; 4] = b"PVWS";
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 8;

pub const FRAME_KIND_CLIENT_AUDIO: u8 = 1;
pub const FRAME_KIND_SERVER_AUDIO: u8 = 2;

const WAV_HEADER_LEN: u32 = 44;

/// Frame raw audio bytes as a server→client binary message.
pub fn encode_audio_message(payload: &[u8]) -> Vec<u8> {
    encode_frame(FRAME_KIND_SERVER_AUDIO, payload)
}

/// Extract the audio payload from a client→server binary message.
pub fn decode_audio_message(frame: &[u8]) -> VoiceResult<&[u8]> {
    let (kind, payload) = decode_frame(frame)?;
    if kind != FRAME_KIND_CLIENT_AUDIO {
        return Err(VoiceError::Frame(format!(
            "unexpected frame kind {kind} from client"
        )));
    }
    Ok(payload)
}

/// Frame arbitrary audio bytes with the given kind.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(FRAME_MAGIC);
    out.push(FRAME_VERSION);
    out.push(kind);
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(payload);
    out
}

/// Split a binary frame into its kind and payload, validating the header.
pub fn decode_frame(frame: &[u8]) -> VoiceResult<(u8, &[u8])> {
    if frame.len() < FRAME_HEADER_LEN || &frame[..4] != FRAME_MAGIC {
        return Err(VoiceError::Frame(
            "missing audio frame header".to_string(),
        ));
    }
    let version = frame[4];
    if version != FRAME_VERSION {
        return Err(VoiceError::Frame(format!(
            "unsupported frame version {version}"
        )));
    }
    Ok((frame[5], &frame[FRAME_HEADER_LEN..]))
}

/// Assemble a 16-bit PCM WAV container around raw sample bytes.
///
/// The STT backend rejects malformed containers, so the header arithmetic is
/// exact: `file_size = 36 + data_size`, `byte_rate = sample_rate * channels *
/// bits / 8`, `block_align = channels * bits / 8`.
pub fn build_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_size = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut buf = Vec::with_capacity(WAV_HEADER_LEN as usize + pcm.len());
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // fmt subchunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&bits_per_sample.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    buf.extend_from_slice(pcm);
    buf
}

/// Playback duration of raw 16-bit PCM, in seconds.
pub fn pcm_duration_seconds(byte_len: usize, sample_rate: u32, channels: u16) -> f64 {
    if sample_rate == 0 || channels == 0 {
        return 0.0;
    }
    byte_len as f64 / (sample_rate as f64 * channels as f64 * 2.0)
}
