//! Codec encoders
//!
//! Every codec sits behind [`AudioEncoder`]: interleaved f32 PCM in,
//! container-framed bytes out. Bitstream production is delegated to the
//! codec libraries.

pub mod framing;
#[cfg(feature = "mp3")]
pub mod mp3;
pub mod opus;

pub use framing::{FrameAccumulator, FrameCodec, FramedEncoder};
#[cfg(feature = "mp3")]
pub use mp3::LameEncoder;
pub use opus::OpusFrameCodec;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BITRATE_KBPS, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::CodecError;

/// Supported codec families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Mp3,
    Vorbis,
    Opus,
    Flac,
    Aac,
}

impl CodecKind {
    /// MIME type announced to the relay
    pub fn content_type(&self) -> &'static str {
        match self {
            CodecKind::Mp3 => "audio/mpeg",
            CodecKind::Vorbis => "application/ogg",
            CodecKind::Opus => "audio/ogg",
            CodecKind::Flac => "audio/flac",
            CodecKind::Aac => "audio/aac",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CodecKind::Mp3 => "MP3",
            CodecKind::Vorbis => "Vorbis",
            CodecKind::Opus => "Opus",
            CodecKind::Flac => "FLAC",
            CodecKind::Aac => "AAC",
        };
        f.write_str(name)
    }
}

/// Rate control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeMode {
    Cbr,
    Vbr,
    Abr,
}

/// Stereo coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    Joint,
    Stereo,
    Mono,
}

/// Codec parameters of a slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSettings {
    pub kind: CodecKind,
    pub bitrate_kbps: u32,
    /// Codec-specific quality, 0 (best) to 9 (fastest) for MP3
    pub quality: u8,
    pub sample_rate: u32,
    pub channels: u16,
    pub encode_mode: EncodeMode,
    pub channel_mode: ChannelMode,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            kind: CodecKind::Mp3,
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            quality: 2,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            encode_mode: EncodeMode::Cbr,
            channel_mode: ChannelMode::Joint,
        }
    }
}

/// Uniform encoder interface
pub trait AudioEncoder: Send {
    /// Encode `frames` interleaved frames; may return no bytes while buffering
    fn encode(&mut self, pcm: &[f32], frames: usize) -> Result<Bytes, CodecError>;

    /// Drain whatever the codec still holds
    fn flush(&mut self) -> Result<Bytes, CodecError> {
        Ok(Bytes::new())
    }

    /// Begin a new bitstream for a fresh listener connection. Containers
    /// with stream headers (Ogg) emit them again on the next encode.
    fn reset_stream(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn kind(&self) -> CodecKind;

    fn content_type(&self) -> &'static str {
        self.kind().content_type()
    }
}

/// Builds encoders for slots
pub trait EncoderFactory: Send + Sync {
    fn create(&self, settings: &CodecSettings) -> Result<Box<dyn AudioEncoder>, CodecError>;
}

/// Encoders backed by the libraries linked into this crate
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEncoderFactory;

impl EncoderFactory for DefaultEncoderFactory {
    fn create(&self, settings: &CodecSettings) -> Result<Box<dyn AudioEncoder>, CodecError> {
        if settings.channels == 0 || settings.channels > 2 {
            return Err(CodecError::EncoderInit(format!(
                "Unsupported channel count: {}",
                settings.channels
            )));
        }
        match settings.kind {
            #[cfg(feature = "mp3")]
            CodecKind::Mp3 => Ok(Box::new(LameEncoder::new(settings)?)),
            CodecKind::Opus => Ok(Box::new(FramedEncoder::new(OpusFrameCodec::new(settings)?))),
            other => Err(CodecError::Unsupported(other)),
        }
    }
}

/// Convert float samples to 16-bit PCM
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(CodecKind::Mp3.content_type(), "audio/mpeg");
        assert_eq!(CodecKind::Opus.content_type(), "audio/ogg");
        assert_eq!(CodecKind::Aac.content_type(), "audio/aac");
    }

    #[test]
    fn test_factory_rejects_missing_backends() {
        let factory = DefaultEncoderFactory;
        for kind in [CodecKind::Vorbis, CodecKind::Flac, CodecKind::Aac] {
            let settings = CodecSettings {
                kind,
                ..Default::default()
            };
            assert!(matches!(factory.create(&settings), Err(CodecError::Unsupported(k)) if k == kind));
        }
    }

    #[test]
    fn test_factory_rejects_surround() {
        let settings = CodecSettings {
            channels: 6,
            ..Default::default()
        };
        assert!(matches!(
            DefaultEncoderFactory.create(&settings),
            Err(CodecError::EncoderInit(_))
        ));
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }
}
