use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by any storage operation, local or remote.
///
/// Each variant carries the human-readable message (including the path or
/// target involved). The variant itself is the error kind and is preserved
/// unchanged across driver and protocol boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Malformed path or a path outside the storage root.
    #[error("invalid path: {0}")]
    PathValidation(String),

    /// The target does not exist and the caller did not ask to ignore that.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// pathCreate with `error_on_exists` against an existing path.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Connect failure or connection reset.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// A connect, read, or write did not complete in the configured time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The remote peer speaks a different protocol version or service.
    #[error("protocol version mismatch: {0}")]
    ProtocolVersion(String),

    /// Malformed or desynchronized protocol frame.
    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),

    /// Decrypt or verify failure (wrong key, corrupt or truncated ciphertext).
    #[error("cipher error: {0}")]
    Cipher(String),

    /// Malformed or truncated compressed stream.
    #[error("compression error: {0}")]
    Compression(String),

    /// Operation outside the driver's declared capability set.
    #[error("unsupported operation: {0}")]
    CapabilityUnsupported(String),

    /// Mutation attempted through a storage opened read-only.
    #[error("read-only storage: {0}")]
    ReadOnly(String),

    /// Object store returned an error status after retries were exhausted.
    #[error("provider error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Provider { status: Option<u16>, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// Any other local I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Serializable discriminant of [`StorageError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    PathValidation,
    NotFound,
    PermissionDenied,
    AlreadyExists,
    Connectivity,
    Timeout,
    ProtocolVersion,
    ProtocolFraming,
    Cipher,
    Compression,
    CapabilityUnsupported,
    ReadOnly,
    Provider,
    Config,
    Io,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PathValidation => "path-validation",
            Self::NotFound => "not-found",
            Self::PermissionDenied => "permission-denied",
            Self::AlreadyExists => "already-exists",
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::ProtocolVersion => "protocol-version",
            Self::ProtocolFraming => "protocol-framing",
            Self::Cipher => "cipher",
            Self::Compression => "compression",
            Self::CapabilityUnsupported => "capability-unsupported",
            Self::ReadOnly => "read-only",
            Self::Provider => "provider",
            Self::Config => "config",
            Self::Io => "io",
        }
    }
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathValidation(_) => ErrorKind::PathValidation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Connectivity(_) => ErrorKind::Connectivity,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ProtocolVersion(_) => ErrorKind::ProtocolVersion,
            Self::ProtocolFraming(_) => ErrorKind::ProtocolFraming,
            Self::Cipher(_) => ErrorKind::Cipher,
            Self::Compression(_) => ErrorKind::Compression,
            Self::CapabilityUnsupported(_) => ErrorKind::CapabilityUnsupported,
            Self::ReadOnly(_) => ErrorKind::ReadOnly,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// The message without the kind prefix added by `Display`.
    pub fn message(&self) -> &str {
        match self {
            Self::PathValidation(m)
            | Self::NotFound(m)
            | Self::PermissionDenied(m)
            | Self::AlreadyExists(m)
            | Self::Connectivity(m)
            | Self::Timeout(m)
            | Self::ProtocolVersion(m)
            | Self::ProtocolFraming(m)
            | Self::Cipher(m)
            | Self::Compression(m)
            | Self::CapabilityUnsupported(m)
            | Self::ReadOnly(m)
            | Self::Config(m)
            | Self::Io(m) => m,
            Self::Provider { message, .. } => message,
        }
    }

    /// Rebuild an error from its wire representation.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::PathValidation => Self::PathValidation(message),
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            ErrorKind::AlreadyExists => Self::AlreadyExists(message),
            ErrorKind::Connectivity => Self::Connectivity(message),
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::ProtocolVersion => Self::ProtocolVersion(message),
            ErrorKind::ProtocolFraming => Self::ProtocolFraming(message),
            ErrorKind::Cipher => Self::Cipher(message),
            ErrorKind::Compression => Self::Compression(message),
            ErrorKind::CapabilityUnsupported => Self::CapabilityUnsupported(message),
            ErrorKind::ReadOnly => Self::ReadOnly(message),
            ErrorKind::Provider => Self::Provider { status: None, message },
            ErrorKind::Config => Self::Config(message),
            ErrorKind::Io => Self::Io(message),
        }
    }

    /// Same kind, message prefixed with context.
    pub fn with_context(self, context: impl std::fmt::Display) -> Self {
        match self {
            Self::Provider { status, message } => Self::Provider {
                status,
                message: format!("{context}: {message}"),
            },
            other => {
                let kind = other.kind();
                Self::from_kind(kind, format!("{context}: {}", other.message()))
            }
        }
    }

    /// Transient failures that the transport and driver layers retry.
    ///
    /// Client errors (4xx) from an object store are terminal; server errors
    /// (5xx) and unknown statuses are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connectivity(_) | Self::Timeout(_) => true,
            Self::Provider { status, .. } => !matches!(status, Some(s) if (400..500).contains(s)),
            _ => false,
        }
    }

    /// Map an I/O error raised while operating on `path`.
    pub fn from_io(err: std::io::Error, action: &str, path: &str) -> Self {
        use std::io::ErrorKind as IoKind;

        let message = format!("unable to {action} '{path}': {err}");
        match err.kind() {
            IoKind::NotFound => Self::NotFound(message),
            IoKind::PermissionDenied => Self::PermissionDenied(message),
            IoKind::AlreadyExists => Self::AlreadyExists(message),
            IoKind::TimedOut => Self::Timeout(message),
            IoKind::ConnectionRefused
            | IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::BrokenPipe
            | IoKind::NotConnected
            | IoKind::UnexpectedEof => Self::Connectivity(message),
            _ => Self::Io(message),
        }
    }
}
