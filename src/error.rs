//! Error types for each layer of the playback pipeline.
//!
//! Setup errors ([`PlayerError`]) disable the player. Everything below it is
//! either retried on a backoff or swallowed per frame.

use std::path::PathBuf;

/// Errors produced while interpreting a container header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Fewer bytes than a container header were available.
    #[error("insufficient header data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// Signature unknown and no field could be recovered in either byte order.
    #[error("unrecognized container signature {0:#010x}")]
    UnrecognizedSignature(u32),
}

/// Errors raised by the tiered allocator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Request is above the hard ceiling; no tier was consulted.
    #[error("{purpose}: {requested} bytes exceeds ceiling of {ceiling} bytes")]
    OverCeiling {
        purpose: &'static str,
        requested: usize,
        ceiling: usize,
    },

    /// Every tier refused the request.
    #[error("{purpose}: no memory tier could provide {requested} bytes")]
    Exhausted {
        purpose: &'static str,
        requested: usize,
    },
}

/// Errors raised by byte sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("allocation failed: {0}")]
    AllocationFailed(#[from] AllocError),

    /// A frame or read can never fit in the stream buffer and was dropped.
    #[error("{chunk} bytes exceed stream buffer capacity of {capacity} bytes")]
    CapacityExceeded { chunk: usize, capacity: usize },

    /// The buffer no longer holds the first frame, so it cannot loop in place.
    #[error("stream origin discarded; rewinding requires a reconnect")]
    OriginDiscarded,

    /// Requested range lies outside the populated window.
    #[error("range {offset}+{len} is outside the buffered window")]
    OutOfWindow { offset: u64, len: usize },

    #[error("stream feed failed: {0}")]
    Transport(#[from] TransportError),
}

impl SourceError {
    /// Whether a fresh connection may clear the error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::AllocationFailed(_)
                | SourceError::OriginDiscarded
                | SourceError::Transport(_)
        )
    }
}

/// Errors from the JPEG decode capability and the decode step around it.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("JPEG decode failed: {0}")]
    Jpeg(String),

    #[error("decoded image {width}x{height} exceeds pixel budget of {budget} bytes")]
    TooLarge { width: u32, height: u32, budget: usize },

    #[error("decoded output has unexpected length {actual} (expected {expected})")]
    OutputMismatch { expected: usize, actual: usize },

    #[error("pixel buffer allocation failed: {0}")]
    Allocation(#[from] AllocError),
}

/// Errors from a display surface.
#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("display backend error: {0}")]
    Backend(String),
}

/// Errors from the network transport. All of them are retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("stream read failed: {0}")]
    Read(String),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("exactly one of `player.path` or `player.url` must be set")]
    AmbiguousSource,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Setup failures that disable the player.
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("no display configured")]
    MissingDisplay,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    #[error("display error: {0}")]
    Display(#[from] DisplayError),

    #[error("player has failed and is disabled")]
    Disabled,
}

pub type Result<T, E = PlayerError> = std::result::Result<T, E>;
