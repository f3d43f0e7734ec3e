//! Audio inputs
//!
//! A slot pulls PCM from one [`AudioSource`]. Sources run their own decode
//! or capture thread and invoke the slot callback with interleaved f32 PCM
//! already converted to the slot's sample rate and channel count.

pub mod buffer;
pub mod capture;
pub mod convert;
pub mod device;
pub mod file;
pub mod tone;

pub use buffer::{AudioFrame, FrameQueue};
pub use capture::DeviceSource;
pub use convert::{remix, FormatConverter, LinearResampler};
pub use device::{list_input_devices, AudioDeviceInfo};
pub use file::SymphoniaFileSource;
pub use tone::ToneSource;

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AudioError;

/// Receives `(pcm, frames)` from a source thread
pub type PcmCallback = Arc<dyn Fn(&[f32], usize) + Send + Sync>;

/// Fired once when a file source reaches its end
pub type EofCallback = Box<dyn FnOnce() + Send>;

/// A running producer of PCM
pub trait AudioSource: Send {
    /// Start the source thread; `callback` runs on that thread
    fn start(&mut self, callback: PcmCallback) -> Result<(), AudioError>;

    /// Stop and join the source thread
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;
}

/// Tags and length of a file track
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: u64,
}

/// A finite source with track information
pub trait FileSource: AudioSource {
    fn track_info(&self) -> TrackInfo;

    fn set_eof_callback(&mut self, callback: EofCallback);

    fn position_ms(&self) -> u64;
}

/// Builds sources for slots
pub trait SourceFactory: Send + Sync {
    /// Capture device by enumeration index, `None` for the default input
    fn device(
        &self,
        index: Option<usize>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioSource>, AudioError>;

    /// File, URL or generator location from a playlist entry
    fn file(
        &self,
        location: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn FileSource>, AudioError>;
}

/// cpal devices, symphonia files and `tone:<hz>` generators
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSourceFactory;

impl SourceFactory for DefaultSourceFactory {
    fn device(
        &self,
        index: Option<usize>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn AudioSource>, AudioError> {
        Ok(Box::new(DeviceSource::new(index, sample_rate, channels)?))
    }

    fn file(
        &self,
        location: &str,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Box<dyn FileSource>, AudioError> {
        if let Some(descriptor) = location.strip_prefix("tone:") {
            return Ok(Box::new(ToneSource::parse(descriptor, sample_rate, channels)?));
        }
        if location.contains("://") && !location.starts_with("file://") {
            return Err(AudioError::UnsupportedFormat(format!(
                "remote input not supported: {}",
                location
            )));
        }
        let path = location.strip_prefix("file://").unwrap_or(location);
        Ok(Box::new(SymphoniaFileSource::open(
            Path::new(path),
            sample_rate,
            channels,
        )?))
    }
}

/// Holds a producer thread to wall-clock speed
#[derive(Debug)]
pub struct RealtimePacer {
    started: Instant,
    sample_rate: u32,
    frames: u64,
    /// How far ahead of real time the producer may run
    lead: Duration,
}

impl RealtimePacer {
    pub fn new(sample_rate: u32, lead: Duration) -> Self {
        Self {
            started: Instant::now(),
            sample_rate: sample_rate.max(1),
            frames: 0,
            lead,
        }
    }

    /// Account for `frames` produced and sleep if running ahead
    pub fn advance(&mut self, frames: usize) {
        self.frames += frames as u64;
        let due = Duration::from_secs_f64(self.frames as f64 / self.sample_rate as f64);
        let elapsed = self.started.elapsed();
        if due > elapsed + self.lead {
            thread::sleep(due - elapsed - self.lead);
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn position_ms(&self) -> u64 {
        self.frames * 1000 / self.sample_rate as u64
    }
}
