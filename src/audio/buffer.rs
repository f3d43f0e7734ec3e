//! Lock-free hand-off between the device callback and the capture thread
//!
//! The cpal callback must never block, so captured blocks go through a
//! bounded [`ArrayQueue`]. When the consumer falls behind the oldest block
//! is dropped; a live input prefers fresh audio over completeness.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// One block of captured interleaved samples
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub channels: u16,
    /// Capture sequence number
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, sequence: u64) -> Self {
        Self {
            samples,
            channels,
            sequence,
        }
    }

    /// Frames (samples per channel) in this block
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.frames() as u64 * 1_000_000) / sample_rate.max(1) as u64
    }
}

/// Bounded SPSC queue of captured blocks
pub struct FrameQueue {
    queue: ArrayQueue<AudioFrame>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push a block, evicting the oldest one when full.
    /// Returns false if a block was evicted.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        match self.queue.force_push(frame) {
            None => true,
            Some(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Blocks evicted because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}
