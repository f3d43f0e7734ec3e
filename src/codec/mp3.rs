//! MP3 encoder backed by LAME

use bytes::Bytes;
use mp3lame_encoder::{Bitrate, Builder, Encoder, FlushNoGap, InterleavedPcm, Mode, MonoPcm, Quality};

use crate::codec::{f32_to_i16, AudioEncoder, ChannelMode, CodecKind, CodecSettings};
use crate::error::CodecError;

/// LAME MP3 encoder emitting raw MPEG frames
pub struct LameEncoder {
    encoder: Encoder,
    channels: u16,
    /// Conversion buffer (reused to avoid allocations)
    pcm16: Vec<i16>,
    frames_encoded: u64,
    bytes_produced: u64,
}

/// Closest LAME bitrate not above the requested one
fn lame_bitrate(kbps: u32) -> Bitrate {
    match kbps {
        0..=15 => Bitrate::Kbps8,
        16..=23 => Bitrate::Kbps16,
        24..=31 => Bitrate::Kbps24,
        32..=39 => Bitrate::Kbps32,
        40..=47 => Bitrate::Kbps40,
        48..=63 => Bitrate::Kbps48,
        64..=79 => Bitrate::Kbps64,
        80..=95 => Bitrate::Kbps80,
        96..=111 => Bitrate::Kbps96,
        112..=127 => Bitrate::Kbps112,
        128..=159 => Bitrate::Kbps128,
        160..=191 => Bitrate::Kbps160,
        192..=223 => Bitrate::Kbps192,
        224..=255 => Bitrate::Kbps224,
        256..=319 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    }
}

fn lame_quality(quality: u8) -> Quality {
    match quality {
        0 => Quality::Best,
        1 => Quality::SecondBest,
        2 => Quality::NearBest,
        3 => Quality::VeryNice,
        4 => Quality::Nice,
        5 => Quality::Good,
        6 => Quality::Decent,
        7 => Quality::Ok,
        8 => Quality::SecondWorst,
        _ => Quality::Worst,
    }
}

impl LameEncoder {
    pub fn new(settings: &CodecSettings) -> Result<Self, CodecError> {
        let init = |what: &str, e: &dyn std::fmt::Debug| {
            CodecError::EncoderInit(format!("Failed to set {}: {:?}", what, e))
        };

        let mut builder = Builder::new()
            .ok_or_else(|| CodecError::EncoderInit("LAME allocation failed".to_string()))?;
        builder
            .set_num_channels(settings.channels as u8)
            .map_err(|e| init("channels", &e))?;
        builder
            .set_sample_rate(settings.sample_rate)
            .map_err(|e| init("sample rate", &e))?;
        builder
            .set_brate(lame_bitrate(settings.bitrate_kbps))
            .map_err(|e| init("bitrate", &e))?;
        builder
            .set_quality(lame_quality(settings.quality))
            .map_err(|e| init("quality", &e))?;

        let mode = match (settings.channels, settings.channel_mode) {
            (1, _) | (_, ChannelMode::Mono) => Mode::Mono,
            (_, ChannelMode::Stereo) => Mode::Stereo,
            (_, ChannelMode::Joint) => Mode::JointStereo,
        };
        builder.set_mode(mode).map_err(|e| init("mode", &e))?;

        let encoder = builder
            .build()
            .map_err(|e| CodecError::EncoderInit(format!("{:?}", e)))?;

        Ok(Self {
            encoder,
            channels: settings.channels,
            pcm16: Vec::new(),
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn bytes_produced(&self) -> u64 {
        self.bytes_produced
    }
}

impl AudioEncoder for LameEncoder {
    fn encode(&mut self, pcm: &[f32], frames: usize) -> Result<Bytes, CodecError> {
        let samples = (frames * self.channels as usize).min(pcm.len());
        self.pcm16.clear();
        self.pcm16.extend(pcm[..samples].iter().map(|s| f32_to_i16(*s)));

        let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(frames));
        let written = if self.channels == 1 {
            self.encoder.encode(MonoPcm(&self.pcm16), out.spare_capacity_mut())
        } else {
            self.encoder.encode(InterleavedPcm(&self.pcm16), out.spare_capacity_mut())
        }
        .map_err(|e| CodecError::EncodingFailed(format!("{:?}", e)))?;
        // SAFETY: LAME initialised exactly `written` bytes of the spare capacity
        unsafe { out.set_len(written) };

        self.frames_encoded += frames as u64;
        self.bytes_produced += written as u64;
        Ok(Bytes::from(out))
    }

    fn flush(&mut self) -> Result<Bytes, CodecError> {
        let mut out = Vec::with_capacity(7200);
        let written = self
            .encoder
            .flush::<FlushNoGap>(out.spare_capacity_mut())
            .map_err(|e| CodecError::EncodingFailed(format!("{:?}", e)))?;
        // SAFETY: as above, LAME reports how many bytes it wrote
        unsafe { out.set_len(written) };
        Ok(Bytes::from(out))
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Mp3
    }
}
