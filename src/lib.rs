//! # relaycast
//!
//! Multi-station internet radio encoder streaming to Icecast2 and Shoutcast
//! relays.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     AudioPipeline (pipeline)                          │
//! │   slot map + lifecycle worker pool                                    │
//! │                                                                       │
//! │   ┌───────────────────────────── EncoderSlot (slot) ───────────────┐  │
//! │   │                                                                 │  │
//! │   │  ┌──────────────┐   ┌──────────────┐   ┌─────────────────────┐  │  │
//! │   │  │ AudioSource  │──►│ volume + DSP │──►│ AudioEncoder        │  │  │
//! │   │  │ device/file/ │   │ EQ -> AGC    │   │ MP3 / Ogg Opus      │  │  │
//! │   │  │ tone thread  │   │ crossfader   │   └──────────┬──────────┘  │  │
//! │   │  └──────┬───────┘   └──────┬───────┘              │             │  │
//! │   │         │ EOF              ▼                      ▼             │  │
//! │   │         ▼            ┌────────────┐     ┌─────────────────────┐ │  │
//! │   │   playlist advance   │ WAV archive│     │ StreamClient        │ │  │
//! │   │                      └────────────┘     │ watchdog thread     │ │  │
//! │   │                                         └──────────┬──────────┘ │  │
//! │   └────────────────────────────────────────────────────┼───────────┘  │
//! └────────────────────────────────────────────────────────┼──────────────┘
//!                                                          │ TCP (PUT / SOURCE)
//!                                                          ▼
//!                                              Icecast2 / Shoutcast relay
//! ```

pub mod archive;
pub mod audio;
pub mod codec;
pub mod config;
pub mod dsp;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod slot;
pub mod stream;

pub use config::{AppConfig, EncoderConfig, InputSource, ServerProtocol, StreamTarget};
pub use error::{Error, Result};
pub use pipeline::AudioPipeline;
pub use slot::{EncoderSlot, SlotServices, SlotState, Stats};
pub use stream::{ConnectionState, StreamClient};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for encoding
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default codec bitrate in kbit/s
    pub const DEFAULT_BITRATE_KBPS: u32 = 128;

    /// Consumed samples after which a frame accumulator compacts its buffer
    pub const FRAME_COMPACTION_THRESHOLD: usize = 16384;

    /// Default relay port (Icecast2 and Shoutcast)
    pub const DEFAULT_RELAY_PORT: u16 = 8000;

    /// Threads running blocking slot lifecycle operations
    pub const DEFAULT_WORKER_THREADS: usize = 4;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Wait for the relay's handshake response
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// How often the watchdog checks a live connection
    pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

    /// Lock-free capture queue capacity (in callback buffers)
    pub const CAPTURE_QUEUE_CAPACITY: usize = 256;

    /// Frames per block produced by generator sources
    pub const SOURCE_BLOCK_FRAMES: usize = 1024;
}
