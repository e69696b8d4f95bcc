//! SOCI builder runtime.
//!
//! The invocation pipeline (reference parsing, workspace lifecycle, deadline
//! watcher, dispatcher) together with the registry and index-build
//! collaborators it drives.

#![allow(clippy::result_large_err)]

pub mod deadline;
pub mod dispatcher;
pub mod oci;
pub mod soci;
pub mod workspace;

// Re-export common types
pub use deadline::{Deadline, DeadlineWatcher, WatchOutcome, WatcherHandle};
pub use dispatcher::{BuildRequest, RequestDispatcher};
pub use oci::{
    ArtifactStores, Descriptor, Image, ImageReference, OciRegistryConnector, Platform, Registry,
    RegistryAuth, RegistryConnector,
};
pub use soci::{IndexBuilder, IndexBuilderFactory, SociIndexBuilderFactory};
pub use workspace::{Workspace, WorkspaceManager};

/// SOCI builder runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
