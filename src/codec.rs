//! Audio frame codec
//!
//! Converts between floating point samples and the 16-bit little-endian linear
//! PCM the Gemini Live API speaks in both directions. Outbound audio is mono
//! 16 kHz, inbound audio is mono 24 kHz and arrives base64 encoded.

use base64::engine::general_purpose;
use base64::Engine;

/// Sample rate of microphone audio sent to the service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized speech returned by the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Error decoding an inbound audio payload
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),

    #[error("empty audio payload")]
    Empty,
}

/// One block of encoded outbound microphone audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Index of the capture window this frame was produced from.
    pub seq: u64,
    /// PCM16 LE mono samples at [`INPUT_SAMPLE_RATE`].
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.sample_count() as f64 / INPUT_SAMPLE_RATE as f64
    }

    /// Base64 form used in `realtimeInput` messages.
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.pcm)
    }
}

/// One block of decoded inbound audio ready for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Encode float samples as PCM16 LE. Values outside [-1.0, 1.0] are clamped.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    out
}

fn sample_to_i16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Decode PCM16 LE bytes into a buffer at the given sample rate.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect();

    Ok(AudioBuffer::new(samples, sample_rate))
}

/// Decode a base64 PCM16 payload as delivered in `inlineData.data`.
pub fn decode_base64_pcm16(data: &str, sample_rate: u32) -> Result<AudioBuffer, CodecError> {
    let bytes = general_purpose::STANDARD.decode(data)?;
    decode_pcm16(&bytes, sample_rate)
}
