//! OCI registry collaborator.
//!
//! Uses the `oci-distribution` crate to validate, pull and push content.
//! The dispatcher only sees the [`RegistryConnector`] and [`Registry`] traits.

use std::str::FromStr;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciImageManifest;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use soci_builder_core::error::{BuilderError, Result};
use tokio::io::AsyncWriteExt;

use super::descriptor::{
    Descriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST, SUPPORTED_MANIFEST_MEDIA_TYPES,
};
use super::store::OciLayoutStore;

/// Media types requested when fetching a manifest. Index types are included so
/// the registry answers with what the digest really is.
const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Opens a [`Registry`] session for one registry host.
#[async_trait]
pub trait RegistryConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Box<dyn Registry>>;
}

/// Registry operations used by one invocation.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Succeeds only if `digest` names a single-platform image manifest.
    async fn validate_image_manifest(&self, repository: &str, digest: &str) -> Result<()>;

    /// Copy the image manifest, config and layers into `store`.
    async fn pull(
        &self,
        repository: &str,
        store: &OciLayoutStore,
        digest: &str,
    ) -> Result<Descriptor>;

    /// Upload the manifest described by `descriptor`, and everything it references, from `store`.
    async fn push(
        &self,
        store: &OciLayoutStore,
        descriptor: &Descriptor,
        repository: &str,
    ) -> Result<()>;
}

/// Connector backed by `oci-distribution`.
pub struct OciRegistryConnector {
    auth: RegistryAuth,
    insecure_registries: Vec<String>,
}

impl OciRegistryConnector {
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            auth,
            insecure_registries: Vec::new(),
        }
    }

    /// Registries reached over plain HTTP.
    pub fn with_insecure_registries(mut self, registries: Vec<String>) -> Self {
        self.insecure_registries = registries;
        self
    }
}

#[async_trait]
impl RegistryConnector for OciRegistryConnector {
    async fn connect(&self, host: &str) -> Result<Box<dyn Registry>> {
        if host.is_empty() {
            return Err(BuilderError::RegistryError {
                registry: host.to_string(),
                message: "empty registry host".to_string(),
            });
        }

        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(self.insecure_registries.clone()),
            ..Default::default()
        };

        tracing::debug!(registry = %host, "Initialized registry client");

        Ok(Box::new(OciRegistry {
            host: host.to_string(),
            client: Client::new(config),
            auth: self.auth.clone(),
        }))
    }
}

/// Registry session for a single host.
pub struct OciRegistry {
    host: String,
    client: Client,
    auth: RegistryAuth,
}

impl OciRegistry {
    fn reference(&self, repository: &str, digest: &str) -> Result<Reference> {
        let ref_str = format!("{}/{}@{}", self.host, repository, digest);
        ref_str.parse::<Reference>().map_err(|e| BuilderError::MalformedReference {
            reference: ref_str.clone(),
            reason: e.to_string(),
        })
    }

    fn registry_error(&self, message: String) -> BuilderError {
        BuilderError::RegistryError {
            registry: self.host.clone(),
            message,
        }
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn validate_image_manifest(&self, repository: &str, digest: &str) -> Result<()> {
        let reference = self.reference(repository, digest)?;
        let (manifest, _) = self
            .client
            .pull_manifest_raw(
                &reference,
                &self.auth.to_oci_auth(),
                ACCEPTED_MANIFEST_MEDIA_TYPES,
            )
            .await
            .map_err(|e| {
                BuilderError::ManifestValidation(format!("Failed to fetch manifest {}: {}", digest, e))
            })?;

        check_manifest_media_type(&manifest)
    }

    async fn pull(
        &self,
        repository: &str,
        store: &OciLayoutStore,
        digest: &str,
    ) -> Result<Descriptor> {
        let reference = self.reference(repository, digest)?;

        tracing::info!(
            registry = %self.host,
            repository = %repository,
            digest = %digest,
            "Pulling image from registry"
        );

        let (manifest_bytes, _) = self
            .client
            .pull_manifest_raw(
                &reference,
                &self.auth.to_oci_auth(),
                ACCEPTED_MANIFEST_MEDIA_TYPES,
            )
            .await
            .map_err(|e| self.registry_error(format!("Failed to pull manifest: {}", e)))?;

        // Verifies the manifest really hashes to the requested digest
        store.blobs().write(digest, &manifest_bytes).await?;

        let media_type = manifest_media_type(&manifest_bytes)?;
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes)?;

        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if store.blobs().contains(&blob.digest) {
                continue;
            }

            tracing::debug!(digest = %blob.digest, size = blob.size, "Pulling blob");

            // Streamed to disk; layers can be far larger than memory
            let staged = store.blobs().staging_path();
            let mut file = tokio::fs::File::create(&staged).await.map_err(|e| {
                BuilderError::StoreError(format!("Failed to stage blob {}: {}", blob.digest, e))
            })?;
            let pulled = self.client.pull_blob(&reference, blob, &mut file).await;
            let flushed = file.flush().await;
            drop(file);

            if let Err(e) = pulled {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(self.registry_error(format!("Failed to pull blob {}: {}", blob.digest, e)));
            }
            if let Err(e) = flushed {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(BuilderError::StoreError(format!(
                    "Failed to stage blob {}: {}",
                    blob.digest, e
                )));
            }
            store.blobs().commit(&staged, &blob.digest).await?;
        }

        let descriptor = Descriptor::new(media_type, digest, manifest_bytes.len() as u64);
        store
            .tag(&descriptor, &format!("{}@{}", repository, digest))
            .await?;

        tracing::info!(
            repository = %repository,
            digest = %digest,
            layers = manifest.layers.len(),
            "Image pulled successfully"
        );

        Ok(descriptor)
    }

    async fn push(
        &self,
        store: &OciLayoutStore,
        descriptor: &Descriptor,
        repository: &str,
    ) -> Result<()> {
        let reference = self.reference(repository, &descriptor.digest)?;

        tracing::info!(
            registry = %self.host,
            repository = %repository,
            digest = %descriptor.digest,
            "Pushing SOCI index to registry"
        );

        let manifest_bytes = store.blobs().read(&descriptor.digest).await?;
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes)?;

        let auth = self.auth.to_oci_auth();
        self.client
            .auth(&reference, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| self.registry_error(format!("Failed to authenticate for push: {}", e)))?;

        for blob in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            let data = store.blobs().read(&blob.digest).await?;
            self.client
                .push_blob(&reference, &data, &blob.digest)
                .await
                .map_err(|e| {
                    self.registry_error(format!("Failed to push blob {}: {}", blob.digest, e))
                })?;
            tracing::debug!(digest = %blob.digest, size = blob.size, "Pushed blob");
        }

        // Pushed verbatim; re-serializing would drop fields the client's
        // manifest type does not model, such as `subject`.
        let manifest_url = self
            .client
            .push_manifest_raw(
                &reference,
                manifest_bytes,
                parse_header(&descriptor.media_type)?,
            )
            .await
            .map_err(|e| self.registry_error(format!("Failed to push SOCI index: {}", e)))?;

        tracing::info!(
            repository = %repository,
            manifest_url = %manifest_url,
            "SOCI index pushed successfully"
        );

        Ok(())
    }
}

/// Header value for a media type, in whatever header type the client takes.
fn parse_header<T>(media_type: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    media_type.parse().map_err(|e: T::Err| {
        BuilderError::SerializationError(format!("Invalid media type '{}': {}", media_type, e))
    })
}

/// Media type of a manifest document.
///
/// OCI manifests may omit `mediaType`; the document shape decides then.
pub fn manifest_media_type(manifest: &[u8]) -> Result<String> {
    let value: serde_json::Value = serde_json::from_slice(manifest).map_err(|e| {
        BuilderError::ManifestValidation(format!("Manifest is not valid JSON: {}", e))
    })?;

    if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
        return Ok(media_type.to_string());
    }
    if value.get("manifests").is_some() {
        return Ok(MEDIA_TYPE_OCI_INDEX.to_string());
    }
    if value.get("config").is_some() && value.get("layers").is_some() {
        return Ok(MEDIA_TYPE_OCI_MANIFEST.to_string());
    }

    Err(BuilderError::ManifestValidation(
        "Manifest has no media type".to_string(),
    ))
}

/// Accept only Docker v2 schema 2 and OCI image manifests.
pub fn check_manifest_media_type(manifest: &[u8]) -> Result<()> {
    let media_type = manifest_media_type(manifest)?;
    if SUPPORTED_MANIFEST_MEDIA_TYPES.contains(&media_type.as_str()) {
        Ok(())
    } else {
        Err(BuilderError::ManifestValidation(format!(
            "Unexpected media type {}, expected: [{}]",
            media_type,
            SUPPORTED_MANIFEST_MEDIA_TYPES.join(", ")
        )))
    }
}
