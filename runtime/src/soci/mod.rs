//! SOCI index and ztoc construction.

pub mod builder;
pub mod ztoc;

pub use builder::{
    index_descriptors, BuildOptions, IndexBuilder, IndexBuilderFactory, SociIndex,
    SociIndexBuilder, SociIndexBuilderFactory, ZtocBlob,
};
pub use ztoc::{build_ztoc, LayerCompression, Ztoc};
