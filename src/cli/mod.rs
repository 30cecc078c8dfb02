// src/cli/mod.rs
// Command-line surface

pub mod serve;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "mcp-of-mcps",
    version,
    about = "Meta MCP server: many downstream MCP servers behind one endpoint"
)]
pub struct Cli {
    /// Inline JSON configuration for the downstream MCP servers
    #[arg(long, value_name = "JSON", conflicts_with = "config_file")]
    pub config: Option<String>,

    /// Path to a JSON configuration file for the downstream MCP servers
    #[arg(long = "config-file", value_name = "PATH")]
    pub config_file: Option<PathBuf>,
}
