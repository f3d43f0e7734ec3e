//! Sine generator source, addressed as `tone:<hz>[:<seconds>]`

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::{AudioSource, EofCallback, FileSource, PcmCallback, RealtimePacer, TrackInfo};
use crate::constants::SOURCE_BLOCK_FRAMES;
use crate::error::AudioError;

const DEFAULT_TONE_SECONDS: f64 = 180.0;
const TONE_AMPLITUDE: f32 = 0.5;

/// Finite sine tone, paced in real time unless built with `unpaced`
pub struct ToneSource {
    frequency: f64,
    duration: Duration,
    sample_rate: u32,
    channels: u16,
    paced: bool,
    running: Arc<AtomicBool>,
    position_frames: Arc<AtomicU64>,
    eof_callback: Arc<Mutex<Option<EofCallback>>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ToneSource {
    pub fn new(frequency: f64, duration: Duration, sample_rate: u32, channels: u16) -> Self {
        Self {
            frequency,
            duration,
            sample_rate,
            channels: channels.max(1),
            paced: true,
            running: Arc::new(AtomicBool::new(false)),
            position_frames: Arc::new(AtomicU64::new(0)),
            eof_callback: Arc::new(Mutex::new(None)),
            thread_handle: None,
        }
    }

    /// Parse `<hz>` or `<hz>:<seconds>`
    pub fn parse(descriptor: &str, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        let mut parts = descriptor.splitn(2, ':');
        let bad = || AudioError::UnsupportedFormat(format!("bad tone descriptor '{}'", descriptor));
        let frequency: f64 = parts
            .next()
            .and_then(|f| f.trim().parse().ok())
            .filter(|f: &f64| *f > 0.0)
            .ok_or_else(bad)?;
        let seconds = match parts.next() {
            Some(s) => s.trim().parse::<f64>().ok().filter(|s| *s > 0.0).ok_or_else(bad)?,
            None => DEFAULT_TONE_SECONDS,
        };
        Ok(Self::new(
            frequency,
            Duration::from_secs_f64(seconds),
            sample_rate,
            channels,
        ))
    }

    /// Generate as fast as the consumer accepts
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl AudioSource for ToneSource {
    fn start(&mut self, callback: PcmCallback) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);
        self.position_frames.store(0, Ordering::SeqCst);

        let running = self.running.clone();
        let position = self.position_frames.clone();
        let eof_callback = self.eof_callback.clone();
        let sample_rate = self.sample_rate;
        let channels = self.channels as usize;
        let step = TAU * self.frequency / sample_rate as f64;
        let total_frames = (self.duration.as_secs_f64() * sample_rate as f64) as u64;
        let paced = self.paced;

        let handle = thread::Builder::new()
            .name(format!("tone-{}hz", self.frequency))
            .spawn(move || {
                let mut pacer = RealtimePacer::new(sample_rate, Duration::from_millis(100));
                let mut phase = 0.0f64;
                let mut block = vec![0.0f32; SOURCE_BLOCK_FRAMES * channels];
                let mut produced = 0u64;

                while running.load(Ordering::Relaxed) && produced < total_frames {
                    let frames = (total_frames - produced).min(SOURCE_BLOCK_FRAMES as u64) as usize;
                    for frame in block[..frames * channels].chunks_exact_mut(channels) {
                        let value = phase.sin() as f32 * TONE_AMPLITUDE;
                        frame.fill(value);
                        phase = (phase + step) % TAU;
                    }
                    callback(&block[..frames * channels], frames);
                    produced += frames as u64;
                    position.store(produced, Ordering::Relaxed);
                    if paced {
                        pacer.advance(frames);
                    }
                }

                let finished = produced >= total_frames;
                running.store(false, Ordering::SeqCst);
                if finished {
                    if let Some(cb) = eof_callback.lock().take() {
                        cb();
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Stopped from our own EOF callback; the thread exits on its own
                return;
            }
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl FileSource for ToneSource {
    fn track_info(&self) -> TrackInfo {
        TrackInfo {
            title: format!("{} Hz tone", self.frequency),
            artist: String::new(),
            album: None,
            duration_ms: self.duration.as_millis() as u64,
        }
    }

    fn set_eof_callback(&mut self, callback: EofCallback) {
        *self.eof_callback.lock() = Some(callback);
    }

    fn position_ms(&self) -> u64 {
        self.position_frames.load(Ordering::Relaxed) * 1000 / self.sample_rate.max(1) as u64
    }
}

impl Drop for ToneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_parse_descriptor() {
        let tone = ToneSource::parse("440:2.5", 48000, 2).unwrap();
        assert_eq!(tone.track_info().duration_ms, 2500);
        assert!(ToneSource::parse("abc", 48000, 2).is_err());
        assert!(ToneSource::parse("-5", 48000, 2).is_err());
    }

    #[test]
    fn test_finite_tone_fires_eof_once() {
        let mut tone = ToneSource::new(1000.0, Duration::from_millis(100), 8000, 1).unpaced();
        let delivered = Arc::new(AtomicU64::new(0));
        let (eof_tx, eof_rx) = bounded(2);
        tone.set_eof_callback(Box::new(move || {
            let _ = eof_tx.send(());
        }));

        let counter = delivered.clone();
        tone.start(Arc::new(move |pcm: &[f32], frames: usize| {
            assert_eq!(pcm.len(), frames);
            assert!(pcm.iter().all(|s| s.abs() <= TONE_AMPLITUDE + 1e-6));
            counter.fetch_add(frames as u64, Ordering::SeqCst);
        }))
        .unwrap();

        eof_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        tone.stop();
        assert_eq!(delivered.load(Ordering::SeqCst), 800);
        assert_eq!(tone.position_ms(), 100);
        assert!(eof_rx.try_recv().is_err());
    }

    #[test]
    fn test_stop_interrupts_paced_tone() {
        let mut tone = ToneSource::new(440.0, Duration::from_secs(60), 44100, 2);
        tone.start(Arc::new(|_: &[f32], _: usize| {})).unwrap();
        thread::sleep(Duration::from_millis(50));
        tone.stop();
        assert!(!tone.is_running());
        assert!(tone.position_ms() < 60_000);
    }
}
