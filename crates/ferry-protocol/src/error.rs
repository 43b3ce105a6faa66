use ferry_types::{ErrorKind, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("expected {expected} frame, received {found}")]
    UnexpectedFrame {
        expected: &'static str,
        found: &'static str,
    },

    #[error("greeting {field} mismatch: expected '{expected}', found '{found}'")]
    VersionMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// An error raised by the peer, carried with its original kind.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl ProtocolError {
    /// True when the channel can no longer be trusted to be frame-aligned.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Remote { .. })
    }
}

impl From<ProtocolError> for StorageError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Remote { kind, message } => StorageError::from_kind(kind, message),
            ProtocolError::VersionMismatch { .. } => StorageError::ProtocolVersion(err.to_string()),
            ProtocolError::Io(io) => StorageError::from_io(io, "exchange with", "remote peer"),
            ProtocolError::InvalidFrameType(_)
            | ProtocolError::FrameTooLarge { .. }
            | ProtocolError::Framing(_)
            | ProtocolError::UnexpectedFrame { .. }
            | ProtocolError::Parameter(_)
            | ProtocolError::Serialization(_)
            | ProtocolError::Deserialization(_) => StorageError::ProtocolFraming(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_kind_preserved() {
        let err = ProtocolError::Remote {
            kind: ErrorKind::PermissionDenied,
            message: "raised from db1: unable to open '/pg/base'".into(),
        };
        assert!(!err.is_fatal());
        let mapped: StorageError = err.into();
        assert_eq!(mapped.kind(), ErrorKind::PermissionDenied);
        assert_eq!(mapped.message(), "raised from db1: unable to open '/pg/base'");
    }

    #[test]
    fn version_and_framing_kinds() {
        let err: StorageError = ProtocolError::VersionMismatch {
            field: "version",
            expected: "1".into(),
            found: "2".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ProtocolVersion);

        let err: StorageError = ProtocolError::Framing("bad block".into()).into();
        assert_eq!(err.kind(), ErrorKind::ProtocolFraming);
        assert!(!err.is_retryable());
    }

    #[test]
    fn eof_is_connectivity() {
        let io = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let err: StorageError = ProtocolError::Io(io).into();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }
}
