use ferry_types::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to connect to {target} after {attempts} attempt(s): {message}")]
    Connect {
        target: String,
        attempts: u32,
        message: String,
    },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("connection reset: {0}")]
    Reset(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("unable to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("invalid transport configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for StorageError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => StorageError::Timeout(err.to_string()),
            // Bad certificates and missing commands do not heal on retry.
            TransportError::Config(_) | TransportError::Tls(_) | TransportError::Spawn { .. } => {
                StorageError::Config(err.to_string())
            }
            TransportError::Io(io) => StorageError::from_io(io, "use", "transport channel"),
            TransportError::Connect { .. } | TransportError::Reset(_) => {
                StorageError::Connectivity(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::ErrorKind;

    #[test]
    fn timeout_distinct_from_reset() {
        let timeout: StorageError = TransportError::Timeout("read".into()).into();
        let reset: StorageError = TransportError::Reset("peer closed".into()).into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert_eq!(reset.kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn connect_message_names_target() {
        let err = TransportError::Connect {
            target: "repo.example:8432".into(),
            attempts: 3,
            message: "refused".into(),
        };
        let mapped: StorageError = err.into();
        assert_eq!(mapped.kind(), ErrorKind::Connectivity);
        assert!(mapped.message().contains("repo.example:8432 after 3 attempt(s)"));
    }

    #[test]
    fn tls_and_spawn_failures_are_final() {
        let tls: StorageError = TransportError::Tls("invalid peer certificate: UnknownIssuer".into()).into();
        assert_eq!(tls.kind(), ErrorKind::Config);
        assert!(!tls.is_retryable());

        let spawn: StorageError = TransportError::Spawn {
            command: "ferry-missing".into(),
            message: "No such file or directory".into(),
        }
        .into();
        assert_eq!(spawn.kind(), ErrorKind::Config);
        assert!(!spawn.is_retryable());
        assert!(spawn.message().contains("ferry-missing"));
    }
}
