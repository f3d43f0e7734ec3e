//! Ogg/Opus encoder
//!
//! libopus produces raw packets; they are wrapped into Ogg pages here so the
//! relay can hand them straight to listeners.

use bytes::Bytes;
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Bitrate, Channels, Encoder};

use crate::codec::framing::FrameCodec;
use crate::codec::{CodecKind, CodecSettings, EncodeMode};
use crate::error::CodecError;

/// Opus always runs its granule clock at 48 kHz
const GRANULE_RATE: u64 = 48_000;

/// Max size of one Opus packet
const MAX_PACKET_SIZE: usize = 4000;

/// libopus encoder delay at 48 kHz for the audio application
const OPUS_PRE_SKIP: u16 = 312;

/// Opus frame codec emitting Ogg pages
pub struct OpusFrameCodec {
    encoder: Encoder,
    writer: PacketWriter<'static, Vec<u8>>,
    serial: u32,
    sample_rate: u32,
    channels: u16,
    /// Samples per channel per frame (20 ms)
    frame_size: usize,
    pre_skip: u16,
    granule: u64,
    headers_written: bool,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
}

impl OpusFrameCodec {
    pub fn new(settings: &CodecSettings) -> Result<Self, CodecError> {
        let channels = match settings.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };
        if ![8000, 12000, 16000, 24000, 48000].contains(&settings.sample_rate) {
            return Err(CodecError::EncoderInit(format!(
                "Opus cannot encode at {} Hz",
                settings.sample_rate
            )));
        }

        let mut encoder = Encoder::new(settings.sample_rate, channels, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(settings.bitrate_kbps as i32 * 1000))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        let vbr = settings.encode_mode != EncodeMode::Cbr;
        encoder
            .set_vbr(vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        if settings.encode_mode == EncodeMode::Abr {
            encoder
                .set_vbr_constraint(true)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set CVBR: {}", e)))?;
        }

        Ok(Self {
            encoder,
            writer: PacketWriter::new(Vec::new()),
            serial: rand::random(),
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            frame_size: settings.sample_rate as usize / 50,
            pre_skip: OPUS_PRE_SKIP,
            granule: OPUS_PRE_SKIP as u64,
            headers_written: false,
            encode_buffer: vec![0u8; MAX_PACKET_SIZE],
            frames_encoded: 0,
        })
    }

    fn id_header(&self) -> Vec<u8> {
        let mut head = Vec::with_capacity(19);
        head.extend_from_slice(b"OpusHead");
        head.push(1);
        head.push(self.channels as u8);
        head.extend_from_slice(&self.pre_skip.to_le_bytes());
        head.extend_from_slice(&self.sample_rate.to_le_bytes());
        head.extend_from_slice(&0i16.to_le_bytes());
        head.push(0);
        head
    }

    fn comment_header() -> Vec<u8> {
        let vendor = concat!("relaycast ", env!("CARGO_PKG_VERSION"));
        let mut tags = Vec::with_capacity(16 + vendor.len());
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
        tags.extend_from_slice(vendor.as_bytes());
        tags.extend_from_slice(&0u32.to_le_bytes());
        tags
    }

    fn write_headers(&mut self) -> Result<(), CodecError> {
        let head = self.id_header();
        self.writer
            .write_packet(head, self.serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        self.writer
            .write_packet(Self::comment_header(), self.serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        self.headers_written = true;
        Ok(())
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    fn take_pages(&mut self) -> Bytes {
        Bytes::from(std::mem::take(self.writer.inner_mut()))
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

impl FrameCodec for OpusFrameCodec {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Opus
    }

    fn encode_frame(&mut self, frame: &[f32]) -> Result<Bytes, CodecError> {
        let expected_len = self.frame_size * self.channels as usize;
        if frame.len() != expected_len {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }
        if !self.headers_written {
            self.write_headers()?;
        }

        let size = self
            .encoder
            .encode_float(frame, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.granule += self.frame_size as u64 * GRANULE_RATE / self.sample_rate as u64;
        self.frames_encoded += 1;

        // One packet per page keeps latency at a single frame
        self.writer
            .write_packet(
                self.encode_buffer[..size].to_vec(),
                self.serial,
                PacketWriteEndInfo::EndPage,
                self.granule,
            )
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        Ok(self.take_pages())
    }

    /// New logical stream: fresh serial, granule back at pre-skip, headers again
    fn reset_stream(&mut self) -> Result<(), CodecError> {
        self.encoder
            .reset_state()
            .map_err(|e| CodecError::EncodingFailed(format!("Failed to reset encoder: {}", e)))?;
        self.writer = PacketWriter::new(Vec::new());
        let previous = self.serial;
        while self.serial == previous {
            self.serial = rand::random();
        }
        self.granule = self.pre_skip as u64;
        self.headers_written = false;
        Ok(())
    }
}
