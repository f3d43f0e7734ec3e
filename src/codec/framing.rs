//! Frame alignment for codecs that only accept exact frame sizes
//!
//! Incoming buffers rarely line up with the codec's frame size, so samples
//! are appended to an accumulation buffer and drained in whole frames.

use bytes::{Bytes, BytesMut};

use crate::codec::{AudioEncoder, CodecKind};
use crate::constants::FRAME_COMPACTION_THRESHOLD;
use crate::error::CodecError;

/// Accumulates interleaved samples and hands out whole frames
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    buffer: Vec<f32>,
    /// Index of the first unconsumed sample
    head: usize,
    /// Samples per frame including all channels
    frame_samples: usize,
    compaction_threshold: usize,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize, channels: u16) -> Self {
        Self::with_threshold(frame_size, channels, FRAME_COMPACTION_THRESHOLD)
    }

    pub fn with_threshold(frame_size: usize, channels: u16, compaction_threshold: usize) -> Self {
        let frame_samples = frame_size.max(1) * channels.max(1) as usize;
        Self {
            buffer: Vec::with_capacity(frame_samples * 4),
            head: 0,
            frame_samples,
            compaction_threshold,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.buffer.extend_from_slice(samples);
    }

    /// Next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<&[f32]> {
        if self.buffer.len() - self.head < self.frame_samples {
            self.compact();
            return None;
        }
        let start = self.head;
        self.head += self.frame_samples;
        Some(&self.buffer[start..self.head])
    }

    /// Drop the consumed head once it grows past the threshold
    fn compact(&mut self) {
        if self.head == self.buffer.len() {
            self.buffer.clear();
            self.head = 0;
        } else if self.head > self.compaction_threshold {
            self.buffer.drain(..self.head);
            self.head = 0;
        }
    }

    /// Samples buffered but not yet handed out
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.head
    }

    /// Samples held in memory, consumed head included
    pub fn allocated(&self) -> usize {
        self.buffer.len()
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.head = 0;
    }
}

/// A codec that encodes exactly one frame at a time
pub trait FrameCodec: Send {
    /// Samples per channel in one frame
    fn frame_size(&self) -> usize;

    fn channels(&self) -> u16;

    fn kind(&self) -> CodecKind;

    /// Encode exactly one interleaved frame
    fn encode_frame(&mut self, frame: &[f32]) -> Result<Bytes, CodecError>;

    fn finish(&mut self) -> Result<Bytes, CodecError> {
        Ok(Bytes::new())
    }

    fn reset_stream(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Adapts a [`FrameCodec`] to arbitrary buffer sizes
pub struct FramedEncoder<C: FrameCodec> {
    codec: C,
    accumulator: FrameAccumulator,
}

impl<C: FrameCodec> FramedEncoder<C> {
    pub fn new(codec: C) -> Self {
        let accumulator = FrameAccumulator::new(codec.frame_size(), codec.channels());
        Self { codec, accumulator }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn pending_samples(&self) -> usize {
        self.accumulator.pending()
    }
}

impl<C: FrameCodec> AudioEncoder for FramedEncoder<C> {
    fn encode(&mut self, pcm: &[f32], frames: usize) -> Result<Bytes, CodecError> {
        let samples = (frames * self.codec.channels() as usize).min(pcm.len());
        self.accumulator.push(&pcm[..samples]);

        let mut out = BytesMut::new();
        while let Some(frame) = self.accumulator.next_frame() {
            let encoded = self.codec.encode_frame(frame)?;
            out.extend_from_slice(&encoded);
        }
        Ok(out.freeze())
    }

    fn flush(&mut self) -> Result<Bytes, CodecError> {
        // Pad the tail with silence so the last partial frame is not lost
        let pending = self.accumulator.pending();
        let mut out = BytesMut::new();
        if pending > 0 {
            let padding = self.accumulator.frame_samples() - pending;
            self.accumulator.push(&vec![0.0; padding]);
            if let Some(frame) = self.accumulator.next_frame() {
                out.extend_from_slice(&self.codec.encode_frame(frame)?);
            }
        }
        out.extend_from_slice(&self.codec.finish()?);
        self.accumulator.clear();
        Ok(out.freeze())
    }

    fn reset_stream(&mut self) -> Result<(), CodecError> {
        self.codec.reset_stream()
    }

    fn kind(&self) -> CodecKind {
        self.codec.kind()
    }
}
