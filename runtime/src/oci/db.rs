//! Artifacts database.
//!
//! Records every SOCI index and ztoc written into a workspace, keyed by the
//! image manifest they were built for. Backed by a JSON document that is only
//! created on first write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soci_builder_core::error::{BuilderError, Result};
use tokio::sync::RwLock;

use super::descriptor::{Descriptor, Platform};

/// Kind of artifact recorded in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SociIndex,
    Ztoc,
}

/// One recorded artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Digest of the artifact itself
    pub digest: String,
    /// Digest of the image manifest the artifact was built for
    pub image_digest: String,
    /// Digest of the source layer (ztocs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_digest: Option<String>,
    pub platform: Platform,
    pub media_type: String,
    pub size: u64,
    pub kind: ArtifactKind,
    pub created_at: DateTime<Utc>,
}

impl ArtifactEntry {
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.media_type.clone(), self.digest.clone(), self.size)
    }
}

/// An index descriptor together with its creation time.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptorInfo {
    pub descriptor: Descriptor,
    pub created_at: DateTime<Utc>,
}

impl IndexDescriptorInfo {
    /// The most recently created descriptor.
    ///
    /// Entries with equal timestamps resolve to the one recorded last.
    pub fn latest(infos: Vec<IndexDescriptorInfo>) -> Option<IndexDescriptorInfo> {
        infos.into_iter().max_by_key(|info| info.created_at)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DbDocument {
    artifacts: Vec<ArtifactEntry>,
}

pub struct ArtifactsDb {
    path: PathBuf,
    entries: RwLock<Vec<ArtifactEntry>>,
}

impl ArtifactsDb {
    /// Open the database at `path`, loading existing entries if the file exists.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|e| {
                BuilderError::StoreError(format!(
                    "Failed to read artifacts db {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let doc: DbDocument = serde_json::from_str(&data).map_err(|e| {
                BuilderError::StoreError(format!("Failed to parse artifacts db: {}", e))
            })?;
            doc.artifacts
        } else {
            Vec::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    /// Record an artifact and persist the database.
    pub async fn record(&self, entry: ArtifactEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        let doc = DbDocument {
            artifacts: entries.clone(),
        };
        drop(entries);

        let data = serde_json::to_vec_pretty(&doc)?;
        tokio::fs::write(&self.path, data).await.map_err(|e| {
            BuilderError::StoreError(format!(
                "Failed to write artifacts db {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// SOCI index descriptors built for `image_digest` on any of `platforms`.
    pub async fn index_descriptors(
        &self,
        image_digest: &str,
        platforms: &[Platform],
    ) -> Vec<IndexDescriptorInfo> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.kind == ArtifactKind::SociIndex)
            .filter(|e| e.image_digest == image_digest)
            .filter(|e| platforms.contains(&e.platform))
            .map(|e| IndexDescriptorInfo {
                descriptor: e.descriptor(),
                created_at: e.created_at,
            })
            .collect()
    }

    pub async fn entries(&self) -> Vec<ArtifactEntry> {
        self.entries.read().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn entry(digest: &str, image: &str, kind: ArtifactKind, created_at: DateTime<Utc>) -> ArtifactEntry {
        ArtifactEntry {
            digest: digest.to_string(),
            image_digest: image.to_string(),
            layer_digest: None,
            platform: Platform::parse("linux/amd64").unwrap(),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            size: 100,
            kind,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_open_is_lazy() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("artifacts.db");
        let db = ArtifactsDb::open(&path).unwrap();
        assert!(!path.exists());
        assert!(db.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("artifacts.db");
        {
            let db = ArtifactsDb::open(&path).unwrap();
            db.record(entry("sha256:i1", "sha256:img", ArtifactKind::SociIndex, Utc::now()))
                .await
                .unwrap();
        }
        let db = ArtifactsDb::open(&path).unwrap();
        assert_eq!(db.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_index_descriptors_filters() {
        let tmp = TempDir::new().unwrap();
        let db = ArtifactsDb::open(&tmp.path().join("artifacts.db")).unwrap();
        let now = Utc::now();
        db.record(entry("sha256:i1", "sha256:img", ArtifactKind::SociIndex, now)).await.unwrap();
        db.record(entry("sha256:z1", "sha256:img", ArtifactKind::Ztoc, now)).await.unwrap();
        db.record(entry("sha256:i2", "sha256:other", ArtifactKind::SociIndex, now)).await.unwrap();

        let amd64 = Platform::parse("linux/amd64").unwrap();
        let found = db.index_descriptors("sha256:img", &[amd64]).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].descriptor.digest, "sha256:i1");

        let arm64 = Platform::parse("linux/arm64").unwrap();
        assert!(db.index_descriptors("sha256:img", &[arm64]).await.is_empty());
    }

    #[test]
    fn test_latest_picks_newest() {
        let now = Utc::now();
        let info = |digest: &str, at| IndexDescriptorInfo {
            descriptor: Descriptor::new("m", digest, 1),
            created_at: at,
        };
        let latest = IndexDescriptorInfo::latest(vec![
            info("sha256:old", now - Duration::seconds(10)),
            info("sha256:new", now),
            info("sha256:mid", now - Duration::seconds(5)),
        ])
        .unwrap();
        assert_eq!(latest.descriptor.digest, "sha256:new");
    }

    #[test]
    fn test_latest_tie_resolves_to_last_recorded() {
        let now = Utc::now();
        let info = |digest: &str| IndexDescriptorInfo {
            descriptor: Descriptor::new("m", digest, 1),
            created_at: now,
        };
        let latest = IndexDescriptorInfo::latest(vec![info("sha256:a"), info("sha256:b")]).unwrap();
        assert_eq!(latest.descriptor.digest, "sha256:b");
    }

    #[test]
    fn test_latest_empty() {
        assert!(IndexDescriptorInfo::latest(Vec::new()).is_none());
    }
}
