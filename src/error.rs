//! Error types for mini-cdc.
//!
//! All fallible paths return `Result<T, StreamError>` (aliased as
//! [`StreamResult`]). Configuration and initial-connection errors abort
//! startup; everything else is logged at the stream loop and the decoder
//! resynchronizes on the next event boundary.

use std::fmt;

/// Primary error type for the streamer.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The configuration file is missing, unreadable, or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Initial dial, authentication, or stream-open failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// A wire-level framing violation: short read, length prefix past the
    /// buffer end, negative length, bad decompression.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An event parsed but its content could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Checkpoint file read/write failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// A publisher failed to load, start, or publish.
    #[error("publisher error: {0}")]
    Publisher(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether this error must abort startup rather than be skipped.
    ///
    /// Per the propagation policy only configuration and connection
    /// failures are fatal; stream/decode/publish errors are survivable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Config(_) | StreamError::Connection(_))
    }

    pub fn kind(&self) -> StreamErrorKind {
        match self {
            StreamError::Config(_) => StreamErrorKind::Config,
            StreamError::Connection(_) => StreamErrorKind::Connection,
            StreamError::Protocol(_) | StreamError::Io(_) => StreamErrorKind::Stream,
            StreamError::Decode(_) => StreamErrorKind::Decode,
            StreamError::Checkpoint(_) => StreamErrorKind::Checkpoint,
            StreamError::Publisher(_) => StreamErrorKind::Publisher,
        }
    }
}

/// Coarse classification used in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    Config,
    Connection,
    Stream,
    Decode,
    Checkpoint,
    Publisher,
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamErrorKind::Config => write!(f, "CONFIG"),
            StreamErrorKind::Connection => write!(f, "CONNECTION"),
            StreamErrorKind::Stream => write!(f, "STREAM"),
            StreamErrorKind::Decode => write!(f, "DECODE"),
            StreamErrorKind::Checkpoint => write!(f, "CHECKPOINT"),
            StreamErrorKind::Publisher => write!(f, "PUBLISHER"),
        }
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
