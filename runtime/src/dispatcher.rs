//! Request dispatcher.
//!
//! Runs one invocation end to end: parse the reference, validate the
//! manifest, allocate a workspace, arm the deadline watcher, pull, build,
//! push, then stand the watcher down and release the workspace. Every exit
//! path yields exactly one [`Outcome`] and leaves nothing on disk.

use std::sync::Arc;

use soci_builder_core::config::BuilderConfig;
use soci_builder_core::context::InvocationContext;
use soci_builder_core::error::{BuilderError, Result};
use soci_builder_core::outcome::{FailureKind, Outcome};
use tokio::time::Instant;
use tracing::Instrument;

use crate::deadline::{Deadline, DeadlineWatcher, WatchOutcome};
use crate::oci::db::IndexDescriptorInfo;
use crate::oci::descriptor::{Image, Platform};
use crate::oci::reference::ImageReference;
use crate::oci::registry::{Registry, RegistryConnector};
use crate::oci::store::ArtifactStores;
use crate::soci::builder::{index_descriptors, BuildOptions, IndexBuilderFactory};
use crate::workspace::{Workspace, WorkspaceManager};

/// One invocation's input.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Digest-pinned image reference
    pub image_uri: String,
    /// Layers smaller than this get no ztoc
    pub min_layer_size: u64,
    /// Hard deadline of the invocation
    pub deadline: Instant,
}

impl BuildRequest {
    pub fn new(image_uri: impl Into<String>, min_layer_size: u64, deadline: Instant) -> Self {
        Self {
            image_uri: image_uri.into(),
            min_layer_size,
            deadline,
        }
    }
}

pub struct RequestDispatcher {
    config: BuilderConfig,
    workspaces: WorkspaceManager,
    connector: Arc<dyn RegistryConnector>,
    builders: Arc<dyn IndexBuilderFactory>,
    platform: Platform,
}

impl RequestDispatcher {
    /// Create a dispatcher. Fails if the configured platform does not parse.
    pub fn new(
        config: BuilderConfig,
        connector: Arc<dyn RegistryConnector>,
        builders: Arc<dyn IndexBuilderFactory>,
    ) -> Result<Self> {
        let platform = match config.platform.as_deref() {
            Some(spec) => Platform::parse(spec)?,
            None => Platform::host_linux(),
        };

        Ok(Self {
            workspaces: WorkspaceManager::new(&config),
            config,
            connector,
            builders,
            platform,
        })
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Run one invocation.
    pub async fn handle(&self, request: BuildRequest) -> Outcome {
        let mut ctx = InvocationContext::new();
        let span = ctx.span().clone();
        self.dispatch(&mut ctx, request).instrument(span).await
    }

    /// Run one invocation and return the caller-facing `(message, error)` pair.
    pub async fn handle_request(&self, request: BuildRequest) -> (String, Option<BuilderError>) {
        self.handle(request).await.into_response()
    }

    async fn dispatch(&self, ctx: &mut InvocationContext, request: BuildRequest) -> Outcome {
        let reference = match ImageReference::parse(&request.image_uri) {
            Ok(r) => r,
            Err(e) => return fail(FailureKind::MalformedReference, e),
        };
        ctx.set_image(&reference.registry, &reference.repository, &reference.digest);

        let registry = match self.connector.connect(&reference.registry).await {
            Ok(r) => r,
            Err(e) => return fail(FailureKind::RegistryInit, e),
        };

        if let Err(e) = registry
            .validate_image_manifest(&reference.repository, &reference.digest)
            .await
        {
            tracing::warn!(error = %e, "Image manifest validation error");
            return Outcome::skipped_validation();
        }

        let workspace = match self.workspaces.create(ctx) {
            Ok(w) => w,
            Err(e) => return fail(FailureKind::Directory, e),
        };

        let deadline = Deadline::new(request.deadline, self.config.deadline_safety_margin());
        let watcher = DeadlineWatcher::arm(deadline, workspace.clone(), ctx.clone());

        let outcome = self
            .run(ctx, registry.as_ref(), &reference, &workspace, request.min_layer_size)
            .await;

        if watcher.cancel().await == WatchOutcome::Fired {
            workspace.sweep(ctx).await;
        }
        workspace.destroy(ctx).await;

        match &outcome {
            Outcome::Success(message) => tracing::info!(
                repository = ctx.repository().unwrap_or_default(),
                digest = ctx.image_digest().unwrap_or_default(),
                index_digest = ctx.index_digest().unwrap_or_default(),
                "{}",
                message
            ),
            Outcome::SkippedEmptyIndex(message) => tracing::warn!("{}", message),
            _ => {}
        }
        outcome
    }

    /// Steps that need the workspace.
    async fn run(
        &self,
        ctx: &mut InvocationContext,
        registry: &dyn Registry,
        reference: &ImageReference,
        workspace: &Workspace,
        min_layer_size: u64,
    ) -> Outcome {
        if workspace.is_destroyed() {
            return fail(
                FailureKind::StoreInit,
                BuilderError::StoreError(format!(
                    "workspace {} was reclaimed before the stores were opened",
                    workspace.root_dir().display()
                )),
            );
        }
        let stores = match ArtifactStores::open(workspace.blob_store_path(), workspace.metadata_db_path()) {
            Ok(s) => Arc::new(s),
            Err(e) => return fail(FailureKind::StoreInit, e),
        };

        let target = match registry
            .pull(&reference.repository, stores.oci(), &reference.digest)
            .await
        {
            Ok(d) => d,
            Err(e) => return fail(FailureKind::Pull, e),
        };
        let image = Image {
            name: reference.name(),
            target,
        };

        let index = match self.build_index(stores.clone(), &image, min_layer_size).await {
            Ok(index) => index,
            Err(BuilderError::EmptyIndex) => return Outcome::skipped_empty_index(),
            Err(e) => return fail(FailureKind::Build, e),
        };
        ctx.set_index_digest(&index.descriptor.digest);

        match registry
            .push(stores.oci(), &index.descriptor, &reference.repository)
            .await
        {
            Ok(()) => Outcome::success(),
            Err(e) => fail(FailureKind::Push, e),
        }
    }

    /// Build and write the index, then look up its descriptor in the store.
    async fn build_index(
        &self,
        stores: Arc<ArtifactStores>,
        image: &Image,
        min_layer_size: u64,
    ) -> Result<IndexDescriptorInfo> {
        tracing::info!("Building SOCI index");
        let builder = self.builders.new_builder(
            stores.clone(),
            BuildOptions {
                platform: self.platform.clone(),
                min_layer_size,
            },
        )?;

        let index = builder.build(image).await?;
        builder.write_index(&index).await?;

        let platforms = [self.platform.clone()];
        let infos = index_descriptors(&stores, image, &platforms).await?;
        IndexDescriptorInfo::latest(infos).ok_or_else(|| BuilderError::NoIndexFound {
            image: image.name.clone(),
            platform: self.platform.to_string(),
        })
    }
}

fn fail(kind: FailureKind, cause: BuilderError) -> Outcome {
    tracing::error!(error = %cause, "{}", kind);
    Outcome::failed(kind, cause)
}
