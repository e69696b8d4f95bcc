//! OCI content handling.
//!
//! ```text
//! <workspace>/
//! ├── artifacts.db          (index and ztoc records)
//! └── store/
//!     ├── oci-layout        (OCI layout marker)
//!     ├── index.json        (tagged manifests)
//!     └── blobs/
//!         └── sha256/       (manifests, configs, layers, ztocs)
//! ```

pub mod db;
pub mod descriptor;
pub mod reference;
pub mod registry;
pub mod store;

pub use db::{ArtifactEntry, ArtifactKind, ArtifactsDb, IndexDescriptorInfo};
pub use descriptor::{Descriptor, Image, Platform};
pub use reference::ImageReference;
pub use registry::{OciRegistry, OciRegistryConnector, Registry, RegistryAuth, RegistryConnector};
pub use store::{ArtifactStores, BlobStore, OciLayoutStore};
