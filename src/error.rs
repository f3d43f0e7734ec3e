//! Error types for the broadcast encoder

use thiserror::Error;

use crate::codec::CodecKind;
use crate::slot::SlotState;

/// Main error type for the encoder
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio source errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Source already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("No encoder available for {0}")]
    Unsupported(CodecKind),
}

/// Relay connection errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Slot management errors
#[derive(Error, Debug)]
pub enum SlotError {
    #[error("Slot not found: {0}")]
    NotFound(u32),

    #[error("Slot already exists: {0}")]
    AlreadyExists(u32),

    #[error("Operation not allowed in state {0}")]
    InvalidState(SlotState),

    #[error("Slot has no playlist loaded")]
    EmptyPlaylist,

    #[error("Failed to load playlist: {0}")]
    Playlist(String),

    #[error("Slot start failed: {0}")]
    StartFailed(String),
}

/// Result type alias for the encoder
pub type Result<T> = std::result::Result<T, Error>;
