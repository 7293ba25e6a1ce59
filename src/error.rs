use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Failed to get lock for resource {resource}, operation timed out after {waited:?}")]
    LockTimeout {
        resource: String,
        waited: Duration,
    },
    #[error("Resource '{0}' already locked")]
    AlreadyLocked(String),
    #[error("Cannot release a not owned lock for resource '{0}'")]
    NotLocked(String),
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CounterError {
    /// 映射为 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            CounterError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            CounterError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, CounterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let timeout = CounterError::LockTimeout {
            resource: "42".into(),
            waited: Duration::from_secs(5),
        };
        assert_eq!(timeout.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            CounterError::ResourceNotFound("42".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            CounterError::InvalidInput("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
