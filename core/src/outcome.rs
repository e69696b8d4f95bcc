//! Invocation outcome taxonomy.
//!
//! Every invocation produces exactly one [`Outcome`]. Only [`Outcome::Failed`]
//! carries an error to the caller; both skip variants are reported as
//! successful responses so that an automatic-retry caller leaves them alone.

use crate::error::BuilderError;

pub const BUILD_AND_PUSH_SUCCESS_MESSAGE: &str = "Successfully built and pushed SOCI index";
pub const SKIP_VALIDATION_MESSAGE: &str = "Exited early due to manifest validation error";
pub const SKIP_EMPTY_INDEX_MESSAGE: &str =
    "Skipping pushing SOCI index as it does not contain any zTOCs";

/// Category of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    MalformedReference,
    RegistryInit,
    Directory,
    StoreInit,
    Pull,
    Build,
    Push,
}

impl FailureKind {
    /// Human-readable label returned to the caller.
    pub fn label(&self) -> &'static str {
        match self {
            Self::MalformedReference => "Malformed image reference",
            Self::RegistryInit => "Registry initialization error",
            Self::Directory => "Directory create error",
            Self::StoreInit => "OCI storage initialization error",
            Self::Pull => "Image pull error",
            Self::Build => "SOCI index build error",
            Self::Push => "SOCI index push error",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of one invocation.
#[derive(Debug)]
pub enum Outcome {
    Success(String),
    SkippedValidation(String),
    SkippedEmptyIndex(String),
    Failed {
        kind: FailureKind,
        message: String,
        cause: BuilderError,
    },
}

impl Outcome {
    pub fn success() -> Self {
        Self::Success(BUILD_AND_PUSH_SUCCESS_MESSAGE.to_string())
    }

    pub fn skipped_validation() -> Self {
        Self::SkippedValidation(SKIP_VALIDATION_MESSAGE.to_string())
    }

    pub fn skipped_empty_index() -> Self {
        Self::SkippedEmptyIndex(SKIP_EMPTY_INDEX_MESSAGE.to_string())
    }

    pub fn failed(kind: FailureKind, cause: BuilderError) -> Self {
        Self::Failed {
            kind,
            message: kind.label().to_string(),
            cause,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success(m) | Self::SkippedValidation(m) | Self::SkippedEmptyIndex(m) => m,
            Self::Failed { message, .. } => message,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Split into the caller-facing `(message, error)` pair.
    ///
    /// `(message, None)` is a success or a deliberate skip; `(message, Some(_))`
    /// is a failure the caller may retry.
    pub fn into_response(self) -> (String, Option<BuilderError>) {
        match self {
            Self::Success(m) | Self::SkippedValidation(m) | Self::SkippedEmptyIndex(m) => (m, None),
            Self::Failed { message, cause, .. } => (message, Some(cause)),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { message, cause, .. } => write!(f, "{}: {}", message, cause),
            other => f.write_str(other.message()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_response() {
        let (message, err) = Outcome::success().into_response();
        assert_eq!(message, "Successfully built and pushed SOCI index");
        assert!(err.is_none());
    }

    #[test]
    fn test_skips_carry_no_error() {
        let (message, err) = Outcome::skipped_validation().into_response();
        assert_eq!(message, "Exited early due to manifest validation error");
        assert!(err.is_none());

        let (message, err) = Outcome::skipped_empty_index().into_response();
        assert_eq!(
            message,
            "Skipping pushing SOCI index as it does not contain any zTOCs"
        );
        assert!(err.is_none());
    }

    #[test]
    fn test_failed_carries_label_and_cause() {
        let outcome = Outcome::failed(
            FailureKind::Directory,
            BuilderError::DirectoryError("read-only file system".to_string()),
        );
        assert!(outcome.is_failure());
        assert_eq!(outcome.failure_kind(), Some(FailureKind::Directory));
        assert_eq!(
            outcome.to_string(),
            "Directory create error: Directory error: read-only file system"
        );

        let (message, err) = outcome.into_response();
        assert_eq!(message, "Directory create error");
        assert!(matches!(err, Some(BuilderError::DirectoryError(_))));
    }

    #[test]
    fn test_failure_labels() {
        assert_eq!(FailureKind::Pull.label(), "Image pull error");
        assert_eq!(FailureKind::Build.label(), "SOCI index build error");
        assert_eq!(FailureKind::Push.label(), "SOCI index push error");
        assert_eq!(
            FailureKind::StoreInit.to_string(),
            "OCI storage initialization error"
        );
    }
}
