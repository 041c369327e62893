//! Audio codec adapter between the telephony stream and the realtime backend.
//!
//! Phone audio arrives as base64 G.711 frames at 8kHz. When the backend is
//! configured with the same encoding, frames pass through untouched. Otherwise
//! they are expanded to 16-bit PCM, resampled and re-encoded.
//!
//! The adapter also turns buffered raw frames into a playable WAV file once a
//! call has ended.

use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while transcoding audio.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid base64 audio payload: {0}")]
    InvalidPayload(String),

    #[error("WAV encoding failed: {0}")]
    Wav(String),
}

impl From<hound::Error> for CodecError {
    fn from(err: hound::Error) -> Self {
        CodecError::Wav(err.to_string())
    }
}

/// Audio encodings understood by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// G.711 u-law, 8kHz (telephony default)
    #[default]
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    /// G.711 a-law, 8kHz
    #[serde(rename = "g711_alaw")]
    G711Alaw,
    /// PCM 16-bit signed little-endian, 24kHz
    #[serde(rename = "pcm16")]
    Pcm16,
}

impl AudioEncoding {
    /// Wire name used by the realtime backend.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::G711Ulaw => "g711_ulaw",
            Self::G711Alaw => "g711_alaw",
            Self::Pcm16 => "pcm16",
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::G711Ulaw | Self::G711Alaw => 8000,
            Self::Pcm16 => 24000,
        }
    }

    /// Parse from a configuration value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "g711_ulaw" | "ulaw" | "mulaw" | "pcmu" => Some(Self::G711Ulaw),
            "g711_alaw" | "alaw" | "pcma" => Some(Self::G711Alaw),
            "pcm16" | "pcm" | "linear16" => Some(Self::Pcm16),
            _ => None,
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Converts audio frames between the telephony and backend encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodecAdapter {
    telephony: AudioEncoding,
    backend: AudioEncoding,
}

impl Default for AudioCodecAdapter {
    fn default() -> Self {
        Self::new(AudioEncoding::G711Ulaw, AudioEncoding::G711Ulaw)
    }
}

impl AudioCodecAdapter {
    pub fn new(telephony: AudioEncoding, backend: AudioEncoding) -> Self {
        Self { telephony, backend }
    }

    pub fn telephony_encoding(&self) -> AudioEncoding {
        self.telephony
    }

    #[inline]
    pub fn is_passthrough(&self) -> bool {
        self.telephony == self.backend
    }

    /// Convert a caller frame into the backend encoding.
    pub fn to_backend<'a>(&self, payload: &'a str) -> Result<Cow<'a, str>, CodecError> {
        if self.is_passthrough() {
            return Ok(Cow::Borrowed(payload));
        }
        transcode(payload, self.telephony, self.backend).map(Cow::Owned)
    }

    /// Convert a backend audio delta into the telephony encoding.
    pub fn to_telephony<'a>(&self, payload: &'a str) -> Result<Cow<'a, str>, CodecError> {
        if self.is_passthrough() {
            return Ok(Cow::Borrowed(payload));
        }
        transcode(payload, self.backend, self.telephony).map(Cow::Owned)
    }
}

fn transcode(payload: &str, from: AudioEncoding, to: AudioEncoding) -> Result<String, CodecError> {
    let raw = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| CodecError::InvalidPayload(e.to_string()))?;
    let samples = decode_samples(&raw, from);
    let samples = resample(&samples, from.sample_rate(), to.sample_rate());
    Ok(BASE64_STANDARD.encode(encode_samples(&samples, to)))
}

/// Concatenate buffered base64 frames into raw audio bytes.
///
/// Frames that fail to decode are skipped so one corrupt frame does not cost
/// the whole recording.
pub fn frames_to_raw<S: AsRef<str>>(frames: &[S]) -> Vec<u8> {
    let mut raw = Vec::new();
    let mut skipped = 0usize;

    for frame in frames {
        match BASE64_STANDARD.decode(frame.as_ref()) {
            Ok(bytes) => raw.extend_from_slice(&bytes),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!("Skipped {} undecodable audio frame(s)", skipped);
    }

    raw
}

/// Render raw audio bytes as a 16-bit mono PCM WAV file.
pub fn raw_to_wav(raw: &[u8], encoding: AudioEncoding) -> Result<Vec<u8>, CodecError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: encoding.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + raw.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in decode_samples(raw, encoding) {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

// =============================================================================
// Sample conversion
// =============================================================================

fn decode_samples(raw: &[u8], encoding: AudioEncoding) -> Vec<i16> {
    match encoding {
        AudioEncoding::G711Ulaw => raw.iter().map(|&b| ulaw_to_linear(b)).collect(),
        AudioEncoding::G711Alaw => raw.iter().map(|&b| alaw_to_linear(b)).collect(),
        AudioEncoding::Pcm16 => raw
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    }
}

fn encode_samples(samples: &[i16], encoding: AudioEncoding) -> Vec<u8> {
    match encoding {
        AudioEncoding::G711Ulaw => samples.iter().map(|&s| linear_to_ulaw(s)).collect(),
        AudioEncoding::G711Alaw => samples.iter().map(|&s| linear_to_alaw(s)).collect(),
        AudioEncoding::Pcm16 => samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
    }
}

/// Linear-interpolation resampler.
fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let output_len = ((samples.len() as f64) / ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos as usize;
        let frac = src_pos - src_idx as f64;

        let sample = match (samples.get(src_idx), samples.get(src_idx + 1)) {
            (Some(&a), Some(&b)) => a as f64 * (1.0 - frac) + b as f64 * frac,
            (Some(&a), None) => a as f64,
            _ => 0.0,
        };

        output.push(sample.round() as i16);
    }

    output
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Expand one G.711 u-law byte.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let exponent = (u >> 4) & 0x07;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Compress one 16-bit sample to G.711 u-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign = if s < 0 {
        s = -s;
        0x80
    } else {
        0x00
    };
    s = s.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && s & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((s >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Expand one G.711 a-law byte.
pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let exponent = (a >> 4) & 0x07;
    let mantissa = (a & 0x0F) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    // a-law sets the sign bit for positive samples
    if a & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Compress one 16-bit sample to G.711 a-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign: u8 = if s >= 0 {
        0x80
    } else {
        s = -s - 1;
        0x00
    };

    let (exponent, mantissa) = if s < 256 {
        (0u8, ((s >> 4) & 0x0F) as u8)
    } else {
        let mut exponent = 1u8;
        while exponent < 7 && s >= (256 << exponent) {
            exponent += 1;
        }
        (exponent, ((s >> (exponent + 3)) & 0x0F) as u8)
    };

    (sign | (exponent << 4) | mantissa) ^ 0x55
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_parse_and_rates() {
        assert_eq!(AudioEncoding::parse("G711_ULAW"), Some(AudioEncoding::G711Ulaw));
        assert_eq!(AudioEncoding::parse("mulaw"), Some(AudioEncoding::G711Ulaw));
        assert_eq!(AudioEncoding::parse("pcm16"), Some(AudioEncoding::Pcm16));
        assert_eq!(AudioEncoding::parse("opus"), None);
        assert_eq!(AudioEncoding::G711Alaw.sample_rate(), 8000);
        assert_eq!(AudioEncoding::Pcm16.sample_rate(), 24000);
        assert_eq!(AudioEncoding::G711Ulaw.to_string(), "g711_ulaw");
    }

    #[test]
    fn test_passthrough_borrows_payload() {
        let adapter = AudioCodecAdapter::default();
        assert!(adapter.is_passthrough());

        let out = adapter.to_backend("AAAA").unwrap();
        assert!(matches!(out, Cow::Borrowed("AAAA")));

        // Pass-through does not validate the payload
        assert_eq!(adapter.to_telephony("not base64!").unwrap(), "not base64!");
    }

    #[test]
    fn test_ulaw_silence_and_extremes() {
        assert_eq!(ulaw_to_linear(0xFF), 0);
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0x80), 32124);
        assert_eq!(ulaw_to_linear(0x00), -32124);
        assert_eq!(linear_to_ulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_ulaw(i16::MIN), 0x00);
    }

    #[test]
    fn test_ulaw_is_stable_after_one_pass() {
        for byte in 0u8..=255 {
            // 0x7F is negative zero and normalizes to 0xFF
            if byte == 0x7F {
                continue;
            }
            assert_eq!(linear_to_ulaw(ulaw_to_linear(byte)), byte, "byte {:#04x}", byte);
        }
    }

    #[test]
    fn test_alaw_is_stable_after_one_pass() {
        for byte in 0u8..=255 {
            assert_eq!(linear_to_alaw(alaw_to_linear(byte)), byte, "byte {:#04x}", byte);
        }
    }

    #[test]
    fn test_ulaw_to_pcm16_upsamples() {
        let adapter = AudioCodecAdapter::new(AudioEncoding::G711Ulaw, AudioEncoding::Pcm16);
        let frame = BASE64_STANDARD.encode([0xFFu8; 160]);

        let converted = adapter.to_backend(&frame).unwrap();
        let raw = BASE64_STANDARD.decode(converted.as_ref()).unwrap();

        // 160 samples at 8kHz -> 480 samples at 24kHz, 2 bytes each
        assert_eq!(raw.len(), 960);
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pcm16_to_ulaw_downsamples() {
        let adapter = AudioCodecAdapter::new(AudioEncoding::G711Ulaw, AudioEncoding::Pcm16);
        let pcm: Vec<u8> = std::iter::repeat_n(1000i16, 480)
            .flat_map(|s| s.to_le_bytes())
            .collect();

        let encoded = BASE64_STANDARD.encode(&pcm);
        let converted = adapter.to_telephony(&encoded).unwrap();
        let raw = BASE64_STANDARD.decode(converted.as_ref()).unwrap();

        assert_eq!(raw.len(), 160);
        assert!(raw.iter().all(|&b| b == linear_to_ulaw(1000)));
    }

    #[test]
    fn test_transcode_rejects_bad_base64() {
        let adapter = AudioCodecAdapter::new(AudioEncoding::G711Ulaw, AudioEncoding::G711Alaw);
        assert!(matches!(
            adapter.to_backend("%%%"),
            Err(CodecError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_frames_to_raw_skips_bad_frames() {
        let frames = vec![
            BASE64_STANDARD.encode([1u8, 2]),
            "***".to_string(),
            BASE64_STANDARD.encode([3u8]),
        ];
        assert_eq!(frames_to_raw(&frames), vec![1, 2, 3]);
        assert!(frames_to_raw::<String>(&[]).is_empty());
    }

    #[test]
    fn test_raw_to_wav_header() {
        let wav = raw_to_wav(&[0xFF; 800], AudioEncoding::G711Ulaw).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 800 u-law bytes become 800 16-bit samples
        assert_eq!(wav.len(), 44 + 1600);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
    }

    #[test]
    fn test_resample_identity_and_empty() {
        assert_eq!(resample(&[1, 2, 3], 8000, 8000), vec![1, 2, 3]);
        assert!(resample(&[], 8000, 24000).is_empty());
        assert_eq!(resample(&[0, 300], 8000, 24000), vec![0, 100, 200, 300, 300, 300]);
    }
}
