//! CLI argument parsing for services.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for all pistats services.
#[derive(Parser, Debug, Clone, Default)]
#[command(about = "pistats service")]
pub struct ServiceArgs {
    /// Path to configuration file (JSON5). Defaults are used when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl ServiceArgs {
    /// Parse CLI arguments.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
