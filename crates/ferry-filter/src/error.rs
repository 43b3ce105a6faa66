use ferry_types::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("filter chain already finished")]
    Finished,
}

pub type FilterResult<T> = Result<T, FilterError>;

impl From<FilterError> for StorageError {
    fn from(err: FilterError) -> Self {
        match err {
            FilterError::Cipher(msg) => StorageError::Cipher(msg),
            FilterError::Compression(msg) => StorageError::Compression(msg),
            FilterError::Finished => StorageError::Io(err.to_string()),
        }
    }
}
