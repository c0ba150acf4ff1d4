use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Default, Parser)]
#[command(
    name = "glimpse",
    version,
    author,
    about = "Glimpse visual product search service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the Glimpse HTTP server.
    Serve(ServeArgs),
    /// Run one search against the configured backends and print JSON.
    Search(SearchArgs),
    /// Check that the embedding provider and vector backend answer.
    Probe(ProbeArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;

/// Query image plus optional crop and filters, mirroring the HTTP form.
#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Local image file to search with.
    #[arg(long, value_name = "PATH", conflicts_with = "url")]
    pub file: Option<PathBuf>,
    /// Remote image URL to search with.
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,
    /// Crop box as JSON, e.g. '{"x":0.1,"y":0.1,"w":0.5,"h":0.5}'.
    #[arg(long, value_name = "JSON")]
    pub bbox: Option<String>,
    /// Metadata filters as JSON, e.g. '{"brand":["Nike"],"priceMax":120}'.
    #[arg(long, value_name = "JSON")]
    pub filters: Option<String>,
    /// Client key charged against the rate limiter.
    #[arg(long, default_value = "cli")]
    pub client: String,
}

#[derive(Debug, Args)]
pub struct ProbeArgs {
    /// Image the embedding provider is asked to encode.
    #[arg(long, value_name = "URL")]
    pub image_url: Option<String>,
}
