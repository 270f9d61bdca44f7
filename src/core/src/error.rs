use thiserror::Error;

/// Shale error types
#[derive(Error, Debug)]
pub enum ShaleError {
    /// Image reference string could not be parsed
    #[error("Invalid image reference '{reference}': {message}")]
    ReferenceInvalid { reference: String, message: String },

    /// Network or daemon I/O failure after retries were exhausted
    #[error("Transport failure for '{reference}': {message}")]
    Transport { reference: String, message: String },

    /// Malformed archive, path escape, or disk error while unpacking
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// External tool returned a non-zero exit status
    #[error("{tool} exited with status {code}: {stderr}")]
    SubprocessFailed {
        tool: String,
        code: i32,
        stderr: String,
    },

    /// Requested analyzer name is not registered
    #[error("Unknown analyzer '{0}'")]
    UnknownAnalyzer(String),

    /// Image cache operation failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// Container daemon operation failed
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Daemon gate could not be acquired
    #[error("Lock error: {0}")]
    Lock(String),

    /// Analyzer exceeded its deadline
    #[error("Analyzer '{name}' timed out after {seconds}s")]
    Timeout { name: String, seconds: u64 },

    /// Caller cancellation
    #[error("Cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ShaleError {
    fn from(err: serde_json::Error) -> Self {
        ShaleError::Serialization(err.to_string())
    }
}

impl ShaleError {
    /// Exit status the front-end should report for this error.
    ///
    /// Usage-level mistakes (bad reference, unknown analyzer) get 2,
    /// everything else 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShaleError::ReferenceInvalid { .. } | ShaleError::UnknownAnalyzer(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for shale operations
pub type Result<T> = std::result::Result<T, ShaleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_invalid_display() {
        let err = ShaleError::ReferenceInvalid {
            reference: "???".to_string(),
            message: "empty repository".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid image reference '???': empty repository"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ShaleError = io.into();
        assert!(matches!(err, ShaleError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            ShaleError::UnknownAnalyzer("bogus".to_string()).exit_code(),
            2
        );
        assert_eq!(ShaleError::Extraction("bad tar".to_string()).exit_code(), 1);
        assert_eq!(ShaleError::Cancelled.exit_code(), 1);
    }
}
