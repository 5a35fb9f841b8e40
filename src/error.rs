//! Error types for the audio hub

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binary wire-protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid string in payload")]
    InvalidString,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Audio source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open source {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("Invalid sample format: {0}")]
    InvalidSampleFormat(String),

    #[error("Source stopped")]
    Stopped,
}

/// Client registry persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Failed to write store {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Malformed store file: {0}")]
    Malformed(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
