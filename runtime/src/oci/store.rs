//! Workspace-scoped artifact stores.
//!
//! A content-addressable blob store and an OCI image layout share the
//! workspace `store/` directory; the artifacts database sits next to it.
//!
//! ```text
//! <workspace>/
//! ├── store/
//! │   ├── oci-layout          (OCI layout marker)
//! │   ├── index.json          (tagged descriptors)
//! │   └── blobs/sha256/<hex>  (manifests, configs, layers, ztocs)
//! └── artifacts.db            (index metadata)
//! ```

use std::path::{Path, PathBuf};

use soci_builder_core::error::{BuilderError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use super::db::ArtifactsDb;
use super::descriptor::{sha256_digest, Descriptor};

/// Annotation holding the name a descriptor is tagged with in `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Content-addressable blob store laid out as `blobs/<algorithm>/<hex>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    ///
    /// Only `root` itself and the directories below it are created; a
    /// missing parent is an error, so a store never resurrects a workspace
    /// that has already been reclaimed.
    pub fn open(root: &Path) -> Result<Self> {
        let sha256 = root.join("blobs").join("sha256");
        for dir in [root.to_path_buf(), root.join("blobs"), sha256] {
            match std::fs::create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(BuilderError::StoreError(format!(
                        "Failed to create blob store {}: {}",
                        dir.display(),
                        e
                    )))
                }
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path of the blob for `digest`.
    pub fn path_for(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
            BuilderError::StoreError(format!("Invalid digest '{}': expected algorithm:hex", digest))
        })?;
        let safe = |s: &str| {
            !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '_' | '-' | '='))
        };
        if !safe(algorithm) || !safe(encoded) || algorithm.starts_with('.') {
            return Err(BuilderError::StoreError(format!("Invalid digest '{}'", digest)));
        }
        Ok(self.root.join("blobs").join(algorithm).join(encoded))
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.path_for(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Write `data` under `expected_digest`, verifying the content first.
    ///
    /// The blob is written to a temporary file and renamed into place, so a
    /// reader never observes a partial blob.
    pub async fn write(&self, expected_digest: &str, data: &[u8]) -> Result<()> {
        if !expected_digest.starts_with("sha256:") {
            return Err(BuilderError::StoreError(format!(
                "Unsupported digest algorithm in '{}'",
                expected_digest
            )));
        }
        let actual = sha256_digest(data);
        if actual != expected_digest {
            return Err(BuilderError::DigestMismatch {
                expected: expected_digest.to_string(),
                actual,
            });
        }

        let path = self.path_for(expected_digest)?;
        if path.exists() {
            return Ok(());
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await.map_err(|e| {
            BuilderError::StoreError(format!("Failed to write blob {}: {}", expected_digest, e))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            BuilderError::StoreError(format!("Failed to commit blob {}: {}", expected_digest, e))
        })?;

        tracing::debug!(digest = %expected_digest, size = data.len(), "Wrote blob");
        Ok(())
    }

    /// Fresh path to stream an incoming blob into before [`commit`](Self::commit).
    pub fn staging_path(&self) -> PathBuf {
        self.root
            .join("blobs")
            .join(format!("ingest-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Move a staged file into place as `expected_digest`.
    ///
    /// The file is hashed while it is read back, so a blob of any size is
    /// verified without holding it in memory. The staged file is removed on
    /// mismatch. Returns the blob size.
    pub async fn commit(&self, staged: &Path, expected_digest: &str) -> Result<u64> {
        let path = self.path_for(expected_digest)?;
        let verified = verify_file(staged, expected_digest).await;
        let size = match verified {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(staged).await;
                return Err(e);
            }
        };

        if path.exists() {
            let _ = tokio::fs::remove_file(staged).await;
            return Ok(size);
        }
        tokio::fs::rename(staged, &path).await.map_err(|e| {
            BuilderError::StoreError(format!("Failed to commit blob {}: {}", expected_digest, e))
        })?;

        tracing::debug!(digest = %expected_digest, size, "Committed blob");
        Ok(size)
    }

    /// Store `data` and return its descriptor.
    pub async fn put(&self, media_type: &str, data: &[u8]) -> Result<Descriptor> {
        let descriptor = Descriptor::for_bytes(media_type, data);
        self.write(&descriptor.digest, data).await?;
        Ok(descriptor)
    }

    pub async fn read(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.path_for(digest)?;
        tokio::fs::read(&path).await.map_err(|e| {
            BuilderError::StoreError(format!("Failed to read blob {}: {}", digest, e))
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Hash `path` in chunks and compare against `expected_digest`.
async fn verify_file(path: &Path, expected_digest: &str) -> Result<u64> {
    if !expected_digest.starts_with("sha256:") {
        return Err(BuilderError::StoreError(format!(
            "Unsupported digest algorithm in '{}'",
            expected_digest
        )));
    }

    let io_error = |e: std::io::Error| {
        BuilderError::StoreError(format!("Failed to read staged blob {}: {}", path.display(), e))
    };
    let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await.map_err(io_error)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
    if actual != expected_digest {
        return Err(BuilderError::DigestMismatch {
            expected: expected_digest.to_string(),
            actual,
        });
    }
    Ok(size)
}

/// Persistent `index.json` of an OCI image layout.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

/// OCI image layout on top of a [`BlobStore`].
pub struct OciLayoutStore {
    blobs: BlobStore,
    /// In-memory copy of `index.json`
    manifests: RwLock<Vec<Descriptor>>,
}

impl OciLayoutStore {
    /// Open (creating if needed) an OCI image layout at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let blobs = BlobStore::open(root)?;

        let marker = root.join("oci-layout");
        if !marker.exists() {
            std::fs::write(&marker, OCI_LAYOUT_MARKER).map_err(|e| {
                BuilderError::StoreError(format!("Failed to write oci-layout: {}", e))
            })?;
        }

        let index_path = root.join("index.json");
        let manifests = if index_path.exists() {
            let data = std::fs::read_to_string(&index_path).map_err(|e| {
                BuilderError::StoreError(format!(
                    "Failed to read {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            let index: LayoutIndex = serde_json::from_str(&data)?;
            index.manifests
        } else {
            let empty = LayoutIndex {
                schema_version: 2,
                manifests: Vec::new(),
            };
            std::fs::write(&index_path, serde_json::to_string_pretty(&empty)?).map_err(|e| {
                BuilderError::StoreError(format!("Failed to write index.json: {}", e))
            })?;
            Vec::new()
        };

        Ok(Self {
            blobs,
            manifests: RwLock::new(manifests),
        })
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Tag `descriptor` as `name`, replacing any previous descriptor with that name.
    pub async fn tag(&self, descriptor: &Descriptor, name: &str) -> Result<()> {
        if !self.blobs.contains(&descriptor.digest) {
            return Err(BuilderError::StoreError(format!(
                "Cannot tag {}: blob not in store",
                descriptor.digest
            )));
        }

        let tagged = descriptor.clone().with_annotation(ANNOTATION_REF_NAME, name);
        let mut manifests = self.manifests.write().await;
        manifests.retain(|d| d.annotation(ANNOTATION_REF_NAME) != Some(name));
        manifests.push(tagged);
        let index = LayoutIndex {
            schema_version: 2,
            manifests: manifests.clone(),
        };
        drop(manifests);

        let index_path = self.blobs.root().join("index.json");
        tokio::fs::write(&index_path, serde_json::to_string_pretty(&index)?)
            .await
            .map_err(|e| BuilderError::StoreError(format!("Failed to write index.json: {}", e)))?;

        Ok(())
    }

    /// Look up the descriptor tagged `name`.
    pub async fn resolve(&self, name: &str) -> Option<Descriptor> {
        let manifests = self.manifests.read().await;
        manifests
            .iter()
            .find(|d| d.annotation(ANNOTATION_REF_NAME) == Some(name))
            .cloned()
    }

    pub async fn manifests(&self) -> Vec<Descriptor> {
        self.manifests.read().await.clone()
    }
}

/// Stores of one invocation, all rooted under its workspace.
pub struct ArtifactStores {
    oci: OciLayoutStore,
    db: ArtifactsDb,
}

impl ArtifactStores {
    /// Open the stores at `store_dir` and `db_path`.
    pub fn open(store_dir: &Path, db_path: &Path) -> Result<Self> {
        Ok(Self {
            oci: OciLayoutStore::open(store_dir)?,
            db: ArtifactsDb::open(db_path)?,
        })
    }

    /// Content-addressable blob store.
    pub fn content(&self) -> &BlobStore {
        self.oci.blobs()
    }

    pub fn oci(&self) -> &OciLayoutStore {
        &self.oci
    }

    pub fn db(&self) -> &ArtifactsDb {
        &self.db
    }
}
