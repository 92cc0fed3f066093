use thiserror::Error;

/// Machina error types.
///
/// Verification failures are kept distinct from content-integrity failures:
/// the former indicate a supply-chain compromise and are never downgraded to
/// a generic content error.
#[derive(Error, Debug)]
pub enum MachinaError {
    /// Registry unreachable or bad response status
    #[error("Registry error: {url} - {message}")]
    Registry { url: String, message: String },

    /// Undecodable manifest, missing required header, or similar
    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// Signature or certificate chain failure
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Declared digest/size does not match the fetched content
    #[error("Content mismatch for {target}: expected {expected}, got {actual}")]
    ContentMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    /// Operation rejected by update policy
    #[error("Policy error: {0}")]
    Policy(String),

    /// Local blob store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Persisted system manifest error
    #[error("State error: {0}")]
    State(String),

    /// Device identity keyset error
    #[error("Identity error: {0}")]
    Identity(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MachinaError {
    fn from(err: serde_json::Error) -> Self {
        MachinaError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MachinaError {
    fn from(err: serde_yaml::Error) -> Self {
        MachinaError::Serialization(err.to_string())
    }
}

/// Result type alias for machina operations
pub type Result<T> = std::result::Result<T, MachinaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let error = MachinaError::Registry {
            url: "http://10.0.2.2:5000/v2/".to_string(),
            message: "status 503".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: http://10.0.2.2:5000/v2/ - status 503"
        );
    }

    #[test]
    fn test_content_mismatch_display() {
        let error = MachinaError::ContentMismatch {
            target: "hostfs".to_string(),
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Content mismatch for hostfs: expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn test_verification_error_display() {
        let error = MachinaError::Verification("signature does not match".to_string());
        assert_eq!(
            error.to_string(),
            "Verification failed: signature does not match"
        );
    }

    #[test]
    fn test_policy_error_display() {
        let error = MachinaError::Policy("cannot install with a partial manifest".to_string());
        assert!(error.to_string().starts_with("Policy error:"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: MachinaError = io_error.into();
        assert!(matches!(error, MachinaError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> =
            serde_json::from_str("{ invalid json }");
        let error: MachinaError = result.unwrap_err().into();
        assert!(matches!(error, MachinaError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: MachinaError = result.unwrap_err().into();
        assert!(matches!(error, MachinaError::Serialization(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_ok().unwrap(), 42);
    }
}
