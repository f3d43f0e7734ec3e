//! Live capture from an input device
//!
//! cpal streams are not `Send`, so the stream is built and owned by a
//! dedicated capture thread. The device callback only copies into a
//! [`FrameQueue`]; the same thread drains the queue, converts to the slot
//! format and invokes the slot callback.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{AudioFrame, FrameQueue};
use crate::audio::convert::FormatConverter;
use crate::audio::device::input_device;
use crate::audio::{AudioSource, PcmCallback};
use crate::constants::CAPTURE_QUEUE_CAPACITY;
use crate::error::AudioError;

/// [`AudioSource`] backed by a cpal input device
pub struct DeviceSource {
    device_index: Option<usize>,
    device_name: String,
    /// Native device format
    config: StreamConfig,
    /// Slot format delivered to the callback
    sample_rate: u32,
    channels: u16,
    running: Arc<AtomicBool>,
    queue: Arc<FrameQueue>,
    frames_delivered: Arc<AtomicU64>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DeviceSource {
    pub fn new(
        device_index: Option<usize>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, AudioError> {
        let device = input_device(device_index)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        if default_config.sample_format() != cpal::SampleFormat::F32 {
            tracing::debug!(
                "{} defaults to {:?}, requesting f32",
                device_name,
                default_config.sample_format()
            );
        }

        Ok(Self {
            device_index,
            device_name,
            config: StreamConfig {
                channels: default_config.channels(),
                sample_rate: default_config.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            },
            sample_rate,
            channels,
            running: Arc::new(AtomicBool::new(false)),
            queue: Arc::new(FrameQueue::new(CAPTURE_QUEUE_CAPACITY)),
            frames_delivered: Arc::new(AtomicU64::new(0)),
            thread_handle: None,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Captured blocks dropped because the slot fell behind
    pub fn dropped_blocks(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered.load(Ordering::Relaxed)
    }
}

impl AudioSource for DeviceSource {
    fn start(&mut self, callback: PcmCallback) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        let device = input_device(self.device_index)?;
        let config = self.config.clone();
        let running = self.running.clone();
        let queue = self.queue.clone();
        let frames_delivered = self.frames_delivered.clone();
        let mut converter = FormatConverter::new(
            config.sample_rate.0,
            config.channels,
            self.sample_rate,
            self.channels,
        );
        let out_channels = self.channels as usize;

        queue.clear();
        running.store(true, Ordering::SeqCst);

        // Stream construction errors are reported back before start() returns
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.device_name))
            .spawn(move || {
                let producer = queue.clone();
                let device_channels = config.channels;
                let mut sequence = 0u64;

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        producer.push(AudioFrame::new(data.to_vec(), device_channels, sequence));
                        sequence += 1;
                    },
                    |err| tracing::warn!("Capture stream error: {}", err),
                    None,
                );

                let stream = match stream.map_err(|e| AudioError::StreamError(e.to_string())) {
                    Ok(stream) => stream,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    running.store(false, Ordering::SeqCst);
                    let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    let mut idle = true;
                    while let Some(frame) = queue.pop() {
                        idle = false;
                        let pcm = converter.process(&frame.samples);
                        let frames = pcm.len() / out_channels;
                        if frames > 0 {
                            callback(&pcm, frames);
                            frames_delivered.fetch_add(frames as u64, Ordering::Relaxed);
                        }
                    }
                    if idle {
                        thread::sleep(Duration::from_millis(5));
                    }
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::info!(
                    "Capturing from {} at {} Hz / {} ch",
                    self.device_name,
                    self.config.sample_rate.0,
                    self.config.channels
                );
                self.thread_handle = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamError("capture thread exited".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
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

impl Drop for DeviceSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_source_reports_slot_format() {
        // Only meaningful where an input device exists
        if let Ok(source) = DeviceSource::new(None, 44100, 2) {
            assert_eq!(source.sample_rate(), 44100);
            assert_eq!(source.channels(), 2);
            assert!(!source.is_running());
        }
    }
}
