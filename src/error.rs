//! Error types for forkpool.

use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Semaphore error: {0}")]
    Semaphore(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Procedure '{0}' uses the reserved '_' prefix")]
    ReservedProcedure(String),

    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("All workers are gone")]
    AllWorkersGone,

    #[error("Fork failed: {0}")]
    Fork(String),

    #[error("Pool error: {0}")]
    Pool(String),
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_reserved_procedure_error_message() {
        let err = PoolError::ReservedProcedure("_sneaky".to_string());
        let msg = err.to_string();
        assert!(msg.contains("_sneaky"));
        assert!(msg.contains("reserved"));
    }

    #[test]
    fn test_invalid_operation_error_message() {
        let err = PoolError::InvalidOperation("process already started".to_string());
        let msg = err.to_string();
        assert!(msg.contains("already started"));
    }

    #[test]
    fn test_all_workers_gone_error_message() {
        let err = PoolError::AllWorkersGone;
        let msg = err.to_string();
        assert!(msg.contains("workers are gone"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PoolError = io_err.into();
        let msg = err.to_string();
        assert!(msg.contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: PoolError = json_err.into();
        let msg = err.to_string();
        assert!(msg.contains("JSON"));
    }

    #[test]
    fn test_error_debug_format() {
        let err = PoolError::Semaphore("key collision".to_string());
        let debug = format!("{:?}", err);
        assert!(debug.contains("Semaphore"));
        assert!(debug.contains("key collision"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(7)
        }

        fn returns_err() -> Result<i32> {
            Err(PoolError::AllWorkersGone)
        }

        assert_eq!(returns_ok().unwrap(), 7);
        assert!(returns_err().is_err());
    }
}
