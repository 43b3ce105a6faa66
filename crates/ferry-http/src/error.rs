use ferry_types::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid request: {0}")]
    Request(String),

    #[error("HTTP transport failed: {0}")]
    Transport(String),

    #[error("HTTP request timed out: {0}")]
    Timeout(String),

    #[error("{message}")]
    Status { status: u16, message: String },
}

pub type HttpResult<T> = Result<T, HttpError>;

impl HttpError {
    /// Classify a hyper failure, surfacing an underlying I/O timeout distinctly.
    pub fn from_hyper(err: hyper::Error, context: &str) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if io.kind() == std::io::ErrorKind::TimedOut {
                    return Self::Timeout(format!("{context}: {io}"));
                }
            }
            source = cause.source();
        }
        Self::Transport(format!("{context}: {err}"))
    }
}

impl From<HttpError> for StorageError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Request(_) => StorageError::Config(err.to_string()),
            HttpError::Transport(_) => StorageError::Connectivity(err.to_string()),
            HttpError::Timeout(_) => StorageError::Timeout(err.to_string()),
            HttpError::Status { status, message } => StorageError::Provider {
                status: Some(status),
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_types::ErrorKind;

    #[test]
    fn status_maps_to_provider() {
        let err: StorageError = HttpError::Status { status: 503, message: "slow down".into() }.into();
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(err.is_retryable());

        let err: StorageError = HttpError::Status { status: 403, message: "denied".into() }.into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn transport_is_connectivity() {
        let err: StorageError = HttpError::Transport("reset".into()).into();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        let err: StorageError = HttpError::Timeout("read".into()).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
