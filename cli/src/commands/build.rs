//! Build and push one SOCI index.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use soci_builder_core::config::BuilderConfig;
use soci_builder_core::error::BuilderError;
use soci_builder_runtime::{
    BuildRequest, OciRegistryConnector, RegistryAuth, RequestDispatcher, SociIndexBuilderFactory,
};
use tokio::time::Instant;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Digest-pinned image reference (e.g. registry.example.com/repo@sha256:...)
    #[arg(long)]
    pub repository: String,

    /// Layers smaller than this many bytes get no ztoc [default: 10485760]
    #[arg(long)]
    pub min_layer_size: Option<u64>,

    /// Invocation timeout in seconds [default: 300]
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Target platform as os/arch[/variant] (default: host)
    #[arg(long)]
    pub platform: Option<String>,

    /// YAML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// A failed invocation: the outcome message and its cause.
#[derive(Debug)]
pub struct BuildFailure {
    pub repository: String,
    pub message: String,
    pub cause: BuilderError,
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "error building SOCI index for \"{}\": {}: {}",
            self.repository, self.message, self.cause
        )
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Configuration from the file (or defaults) with command-line overrides applied.
fn resolve_config(args: &BuildArgs) -> Result<BuilderConfig, BuilderError> {
    let mut config = match &args.config {
        Some(path) => BuilderConfig::load(path)?,
        None => BuilderConfig::default(),
    };
    if let Some(platform) = &args.platform {
        config.platform = Some(platform.clone());
    }
    if let Some(timeout) = args.timeout {
        config.default_timeout_secs = timeout;
    }
    if let Some(min_layer_size) = args.min_layer_size {
        config.default_min_layer_size = min_layer_size;
    }
    config.validate()?;
    Ok(config)
}

pub async fn execute(args: BuildArgs) -> Result<String, Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;
    let deadline = Instant::now() + config.default_timeout();
    let min_layer_size = config.default_min_layer_size;

    let connector = OciRegistryConnector::new(RegistryAuth::from_env())
        .with_insecure_registries(config.insecure_registries.clone());
    let dispatcher = RequestDispatcher::new(
        config,
        Arc::new(connector),
        Arc::new(SociIndexBuilderFactory),
    )?;

    tracing::debug!(platform = %dispatcher.platform(), "Dispatching build request");
    let request = BuildRequest::new(args.repository.clone(), min_layer_size, deadline);
    match dispatcher.handle_request(request).await {
        (message, None) => Ok(message),
        (message, Some(cause)) => Err(Box::new(BuildFailure {
            repository: args.repository,
            message,
            cause,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args() -> BuildArgs {
        BuildArgs {
            repository: "registry.example.com/repo@sha256:abc".to_string(),
            min_layer_size: None,
            timeout: None,
            platform: None,
            config: None,
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let config = resolve_config(&args()).unwrap();
        assert_eq!(config.default_min_layer_size, 10_485_760);
        assert_eq!(config.default_timeout_secs, 300);
        assert!(config.platform.is_none());
    }

    #[test]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_timeout_secs: 120\nplatform: linux/arm64").unwrap();

        let config = resolve_config(&BuildArgs {
            config: Some(file.path().to_path_buf()),
            timeout: Some(30),
            min_layer_size: Some(0),
            ..args()
        })
        .unwrap();
        assert_eq!(config.default_timeout_secs, 30);
        assert_eq!(config.default_min_layer_size, 0);
        assert_eq!(config.platform.as_deref(), Some("linux/arm64"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = resolve_config(&BuildArgs {
            timeout: Some(0),
            ..args()
        })
        .unwrap_err();
        assert!(matches!(err, BuilderError::ConfigError(_)));
    }

    #[test]
    fn test_timeout_within_safety_margin_rejected() {
        for timeout in [1, 10] {
            let err = resolve_config(&BuildArgs {
                timeout: Some(timeout),
                ..args()
            })
            .unwrap_err();
            assert!(matches!(err, BuilderError::ConfigError(_)));
            assert!(err.to_string().contains("deadline_safety_margin_secs"));
        }
        assert!(resolve_config(&BuildArgs {
            timeout: Some(11),
            ..args()
        })
        .is_ok());
    }

    #[test]
    fn test_failure_display() {
        let failure = BuildFailure {
            repository: "registry.example.com/repo@sha256:abc".to_string(),
            message: "Image pull error".to_string(),
            cause: BuilderError::Other("boom".to_string()),
        };
        let text = failure.to_string();
        assert!(text.starts_with("error building SOCI index for \"registry.example.com/repo@sha256:abc\": Image pull error"));
        assert!(text.ends_with("boom"));
    }

    #[tokio::test]
    async fn test_malformed_reference_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workspace_root: {}", tmp.path().display()).unwrap();

        let err = execute(BuildArgs {
            repository: "no-digest".to_string(),
            config: Some(file.path().to_path_buf()),
            ..args()
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Malformed image reference"));
    }
}
