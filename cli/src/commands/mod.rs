//! CLI definition and dispatch.

mod build;

use clap::{Parser, ValueEnum};

pub use build::{BuildArgs, BuildFailure};

/// Build a SOCI index for a container image and push it to the image's repository.
#[derive(Parser, Debug)]
#[command(name = "soci-builder", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub build: BuildArgs,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Run the parsed CLI, returning the outcome message to print.
pub async fn dispatch(cli: Cli) -> Result<String, Box<dyn std::error::Error>> {
    build::execute(cli.build).await
}
