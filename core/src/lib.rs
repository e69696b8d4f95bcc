//! SOCI index builder core - foundational types.
//!
//! Errors, configuration, the per-invocation telemetry context and the
//! outcome taxonomy shared by the runtime and the CLI.

pub mod config;
pub mod context;
pub mod error;
pub mod outcome;

// Re-export commonly used types
pub use config::BuilderConfig;
pub use context::InvocationContext;
pub use error::{BuilderError, Result};
pub use outcome::{FailureKind, Outcome};

/// SOCI index builder version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
