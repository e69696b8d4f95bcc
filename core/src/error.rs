use thiserror::Error;

/// SOCI index builder error types
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Image reference could not be split into host, repository and digest
    #[error("Malformed image reference '{reference}': {reason}")]
    MalformedReference { reference: String, reason: String },

    /// Referenced digest is not a supported image manifest
    #[error("Image manifest validation error: {0}")]
    ManifestValidation(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Workspace directory could not be allocated
    #[error("Directory error: {0}")]
    DirectoryError(String),

    /// Blob store, OCI layout or artifacts database error
    #[error("Store error: {0}")]
    StoreError(String),

    /// Index construction failed
    #[error("Index build error: {0}")]
    BuildError(String),

    /// Index construction produced zero ztocs
    #[error("no ztocs created, all layers either skipped or produced errors")]
    EmptyIndex,

    /// Index was written but no descriptor for it could be found
    #[error("No SOCI indices found in OCI store for image {image} ({platform})")]
    NoIndexFound { image: String, platform: String },

    /// Blob content did not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BuilderError {
    /// Whether this error is the distinguished "no ztocs produced" condition.
    pub fn is_empty_index(&self) -> bool {
        matches!(self, BuilderError::EmptyIndex)
    }
}

impl From<serde_json::Error> for BuilderError {
    fn from(err: serde_json::Error) -> Self {
        BuilderError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuilderError {
    fn from(err: serde_yaml::Error) -> Self {
        BuilderError::SerializationError(err.to_string())
    }
}

/// Result type alias for SOCI index builder operations
pub type Result<T> = std::result::Result<T, BuilderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_reference_display() {
        let error = BuilderError::MalformedReference {
            reference: "nginx".to_string(),
            reason: "missing registry host".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Malformed image reference 'nginx': missing registry host"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = BuilderError::RegistryError {
            registry: "registry.example.com".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: registry.example.com - Authentication failed"
        );
    }

    #[test]
    fn test_empty_index_is_structural() {
        assert!(BuilderError::EmptyIndex.is_empty_index());

        // Same text in a different variant is not the empty-index condition
        let lookalike = BuilderError::BuildError(BuilderError::EmptyIndex.to_string());
        assert!(!lookalike.is_empty_index());
    }

    #[test]
    fn test_no_index_found_display() {
        let error = BuilderError::NoIndexFound {
            image: "repo@sha256:abc".to_string(),
            platform: "linux/amd64".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "No SOCI indices found in OCI store for image repo@sha256:abc (linux/amd64)"
        );
    }

    #[test]
    fn test_digest_mismatch_display() {
        let error = BuilderError::DigestMismatch {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Digest mismatch: expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BuilderError = io_error.into();
        assert!(matches!(error, BuilderError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: BuilderError = result.unwrap_err().into();
        assert!(matches!(error, BuilderError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: BuilderError = result.unwrap_err().into();
        assert!(matches!(error, BuilderError::SerializationError(_)));
    }
}
