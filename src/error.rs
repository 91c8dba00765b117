//! Typed errors shared by every component in the pipeline.
//!
//! Every component that detects a failure reports one of these [`ErrorKind`]s
//! so callers can match on *why* an operation failed rather than parse a
//! message string.

use std::fmt;

/// The stable, closed set of ways a pipeline component can fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Used before `configure`/`open`.
    NotConfigured,
    /// Operation illegal in the component's current state-machine state.
    InvalidState,
    /// A codec config conflicts with another output's already-pinned source config.
    IncompatibleConfig,
    /// An endpoint can't carry the requested container.
    UnsupportedContainer,
    /// An endpoint can't carry the requested codec.
    UnsupportedCodec,
    /// Opaque failure surfaced from a platform encoder.
    Codec,
    /// Sink network/file I/O failure.
    Io,
    /// A capture device refused access.
    PermissionDenied,
    /// An awaited operation was cancelled.
    Cancelled,
    /// The endpoint was closed asynchronously; not a hard failure.
    Closed,
    /// `start_stream` was called on a pipeline with no registered outputs.
    NoOutput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotConfigured => "not configured",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::IncompatibleConfig => "incompatible config",
            ErrorKind::UnsupportedContainer => "unsupported container",
            ErrorKind::UnsupportedCodec => "unsupported codec",
            ErrorKind::Codec => "codec error",
            ErrorKind::Io => "i/o error",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Closed => "closed",
            ErrorKind::NoOutput => "no output",
        };
        f.write_str(s)
    }
}

/// A pipeline error: a [`ErrorKind`] plus a human-readable context message
/// and, for [`ErrorKind::Io`] and [`ErrorKind::Codec`], the underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error { kind, message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotConfigured, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::InvalidState, message)
    }

    pub fn incompatible_config(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::IncompatibleConfig, message)
    }

    pub fn unsupported_container(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::UnsupportedContainer, message)
    }

    pub fn unsupported_codec(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::UnsupportedCodec, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Closed, message)
    }

    pub fn no_output(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::NoOutput, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(ErrorKind::Io, "i/o failure", e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
