//! sharegrid: encode a file and place its shares on a storage grid.
//!
//! The grid is described by a `grid.toml` and simulated with in-memory
//! storage servers, so placement decisions and failure diagnostics can be
//! explored without running real servers.
//!
//! # Usage
//!
//! ```text
//! sharegrid put photo.jpg --config grid.toml
//! sharegrid check-config --config grid.toml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod config;
mod encode;

#[derive(Parser)]
#[command(
    name = "sharegrid",
    about = "Erasure-coded share placement with happiness verification",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file and place its shares on the configured grid.
    ///
    /// Exits non-zero when the placement cannot reach the happiness
    /// threshold, with the diagnostic on stderr.
    Put {
        /// File to upload.
        file: PathBuf,
        /// Grid description.
        #[arg(short, long, default_value = "grid.toml")]
        config: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Validate a grid description and print what it contains.
    CheckConfig {
        #[arg(short, long, default_value = "grid.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sharegrid=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Put {
            file,
            config,
            format,
        } => commands::put::put(&file, &config, &format).await,
        Commands::CheckConfig { config } => commands::check::check(&config),
    }
}
