//! SOCI index construction.
//!
//! [`IndexBuilderFactory`] binds a builder to one invocation's stores;
//! [`IndexBuilder`] builds and persists the index. The index descriptor is
//! looked up afterwards through [`index_descriptors`], since writing an index
//! does not hand its descriptor back.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use oci_distribution::manifest::OciImageManifest;
use soci_builder_core::error::{BuilderError, Result};

use crate::oci::db::{ArtifactEntry, ArtifactKind, IndexDescriptorInfo};
use crate::oci::descriptor::{
    Descriptor, Image, Platform, MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_SOCI_INDEX, MEDIA_TYPE_ZTOC,
};
use crate::oci::store::ArtifactStores;

use super::ztoc::{build_ztoc, LayerCompression};

pub const ANNOTATION_IMAGE_LAYER_DIGEST: &str = "com.amazon.soci.image-layer-digest";
pub const ANNOTATION_IMAGE_LAYER_MEDIA_TYPE: &str = "com.amazon.soci.image-layer-mediatype";
pub const ANNOTATION_BUILD_VERSION: &str = "com.amazon.soci.build-version";

/// Content of the SOCI index config blob.
const EMPTY_CONFIG: &[u8] = b"{}";

/// Options a builder is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub platform: Platform,
    /// Layers smaller than this get no ztoc
    pub min_layer_size: u64,
}

/// A ztoc blob and the layer it describes.
#[derive(Debug, Clone)]
pub struct ZtocBlob {
    pub descriptor: Descriptor,
    pub layer_digest: String,
    pub data: Vec<u8>,
}

/// A built, not yet persisted, SOCI index.
#[derive(Debug, Clone)]
pub struct SociIndex {
    pub image: Image,
    pub platform: Platform,
    /// Descriptor of `manifest`
    pub descriptor: Descriptor,
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
    pub ztocs: Vec<ZtocBlob>,
}

#[async_trait]
pub trait IndexBuilder: Send + Sync {
    /// Build the index for `image`. Fails with [`BuilderError::EmptyIndex`]
    /// when no layer produced a ztoc.
    async fn build(&self, image: &Image) -> Result<SociIndex>;

    /// Persist `index` into the stores the builder is bound to.
    async fn write_index(&self, index: &SociIndex) -> Result<()>;
}

pub trait IndexBuilderFactory: Send + Sync {
    fn new_builder(
        &self,
        stores: Arc<ArtifactStores>,
        options: BuildOptions,
    ) -> Result<Box<dyn IndexBuilder>>;
}

/// Index descriptors recorded for `image` on any of `platforms`.
pub async fn index_descriptors(
    stores: &ArtifactStores,
    image: &Image,
    platforms: &[Platform],
) -> Result<Vec<IndexDescriptorInfo>> {
    Ok(stores
        .db()
        .index_descriptors(&image.target.digest, platforms)
        .await)
}

/// Factory for [`SociIndexBuilder`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SociIndexBuilderFactory;

impl IndexBuilderFactory for SociIndexBuilderFactory {
    fn new_builder(
        &self,
        stores: Arc<ArtifactStores>,
        options: BuildOptions,
    ) -> Result<Box<dyn IndexBuilder>> {
        Ok(Box::new(SociIndexBuilder::new(stores, options)))
    }
}

/// Builds ztocs for every qualifying layer and wraps them in an index manifest.
pub struct SociIndexBuilder {
    stores: Arc<ArtifactStores>,
    options: BuildOptions,
}

impl SociIndexBuilder {
    pub fn new(stores: Arc<ArtifactStores>, options: BuildOptions) -> Self {
        Self { stores, options }
    }

    /// Ztoc for one layer, `Ok(None)` when the layer does not qualify.
    async fn build_layer_ztoc(&self, media_type: &str, digest: &str, size: u64) -> Result<Option<ZtocBlob>> {
        if size < self.options.min_layer_size {
            tracing::debug!(
                layer = %digest,
                size,
                min_layer_size = self.options.min_layer_size,
                "Skipping layer below minimum size"
            );
            return Ok(None);
        }

        let Some(compression) = LayerCompression::from_media_type(media_type) else {
            tracing::debug!(layer = %digest, media_type = %media_type, "Skipping layer with unsupported media type");
            return Ok(None);
        };

        let path = self.stores.content().path_for(digest)?;
        let ztoc = tokio::task::spawn_blocking(move || {
            let file = File::open(&path).map_err(|e| {
                BuilderError::StoreError(format!("Failed to open layer {}: {}", path.display(), e))
            })?;
            build_ztoc(BufReader::new(file), compression)
        })
            .await
            .map_err(|e| BuilderError::BuildError(format!("ztoc task failed: {}", e)))??;
        let data = serde_json::to_vec(&ztoc)?;

        let descriptor = Descriptor::for_bytes(MEDIA_TYPE_ZTOC, &data)
            .with_annotation(ANNOTATION_IMAGE_LAYER_DIGEST, digest)
            .with_annotation(ANNOTATION_IMAGE_LAYER_MEDIA_TYPE, media_type);

        tracing::debug!(
            layer = %digest,
            ztoc = %descriptor.digest,
            files = ztoc.toc.len(),
            "Built ztoc"
        );

        Ok(Some(ZtocBlob {
            descriptor,
            layer_digest: digest.to_string(),
            data,
        }))
    }
}

#[async_trait]
impl IndexBuilder for SociIndexBuilder {
    async fn build(&self, image: &Image) -> Result<SociIndex> {
        tracing::info!(image = %image.name, platform = %self.options.platform, "Building SOCI index");

        let manifest_bytes = self.stores.content().read(&image.target.digest).await?;
        let manifest: OciImageManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
            BuilderError::BuildError(format!("Failed to parse image manifest: {}", e))
        })?;

        let mut ztocs = Vec::new();
        for layer in &manifest.layers {
            let size = u64::try_from(layer.size).unwrap_or(0);
            match self.build_layer_ztoc(&layer.media_type, &layer.digest, size).await {
                Ok(Some(ztoc)) => ztocs.push(ztoc),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(layer = %layer.digest, error = %e, "Failed to build ztoc, skipping layer");
                }
            }
        }

        if ztocs.is_empty() {
            return Err(BuilderError::EmptyIndex);
        }
        let manifest_layers = manifest.layers.len();

        let config = EMPTY_CONFIG.to_vec();
        let config_descriptor = Descriptor::for_bytes(MEDIA_TYPE_SOCI_INDEX, &config);
        let index_manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "artifactType": MEDIA_TYPE_SOCI_INDEX,
            "config": config_descriptor,
            "layers": ztocs.iter().map(|z| &z.descriptor).collect::<Vec<_>>(),
            "subject": Descriptor::new(
                image.target.media_type.clone(),
                image.target.digest.clone(),
                image.target.size,
            ),
            "annotations": {
                ANNOTATION_BUILD_VERSION: soci_builder_core::VERSION,
            },
        });

        // These bytes are stored and pushed as is, so the digest never changes
        let manifest = canonical_json(&index_manifest);
        let descriptor = Descriptor::for_bytes(MEDIA_TYPE_OCI_MANIFEST, &manifest);

        tracing::info!(
            image = %image.name,
            index_digest = %descriptor.digest,
            ztocs = ztocs.len(),
            image_layers = manifest_layers,
            "Built SOCI index"
        );

        Ok(SociIndex {
            image: image.clone(),
            platform: self.options.platform.clone(),
            descriptor,
            manifest,
            config,
            ztocs,
        })
    }

    async fn write_index(&self, index: &SociIndex) -> Result<()> {
        let content = self.stores.content();
        let db = self.stores.db();

        for ztoc in &index.ztocs {
            content.write(&ztoc.descriptor.digest, &ztoc.data).await?;
            db.record(ArtifactEntry {
                digest: ztoc.descriptor.digest.clone(),
                image_digest: index.image.target.digest.clone(),
                layer_digest: Some(ztoc.layer_digest.clone()),
                platform: index.platform.clone(),
                media_type: ztoc.descriptor.media_type.clone(),
                size: ztoc.descriptor.size,
                kind: ArtifactKind::Ztoc,
                created_at: Utc::now(),
            })
            .await?;
        }

        content.put(MEDIA_TYPE_SOCI_INDEX, &index.config).await?;
        content.write(&index.descriptor.digest, &index.manifest).await?;
        self.stores
            .oci()
            .tag(&index.descriptor, &index.descriptor.digest)
            .await?;

        db.record(ArtifactEntry {
            digest: index.descriptor.digest.clone(),
            image_digest: index.image.target.digest.clone(),
            layer_digest: None,
            platform: index.platform.clone(),
            media_type: index.descriptor.media_type.clone(),
            size: index.descriptor.size,
            kind: ArtifactKind::SociIndex,
            created_at: Utc::now(),
        })
        .await?;

        tracing::debug!(index_digest = %index.descriptor.digest, "Wrote SOCI index");
        Ok(())
    }
}

/// Serialize with sorted object keys and no insignificant whitespace.
pub fn canonical_json(value: &serde_json::Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(&serde_json::Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}
