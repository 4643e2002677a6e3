pub mod config;
pub mod tools;

use anyhow::Context;
use clap::{Parser, Subcommand};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "mcpbridge.toml";

/// mcpbridge: talk to an MCP server from the command line.
#[derive(Debug, Parser)]
#[command(name = "mcpbridge", version, about)]
pub struct Cli {
    /// Path to the config file (overrides `MCPBRIDGE_CONFIG`).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Id of the `[[mcp.servers]]` entry to use (defaults to the first one).
    #[arg(long, global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the tools the server offers.
    List {
        /// Print the descriptors as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Call a tool and print the result as JSON.
    Call {
        /// Tool name.
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Identifier echoed back in the result.
        #[arg(long, default_value = "cli:call")]
        id: String,
        /// Read timeout for the call, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Resolve the config path: explicit flag, then `MCPBRIDGE_CONFIG`, then
/// [`DEFAULT_CONFIG_PATH`].
pub fn config_path(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("MCPBRIDGE_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.into())
}

/// Load the configuration, falling back to defaults when the file does not
/// exist. Returns the parsed [`Config`](mb_domain::config::Config) and the
/// path that was used.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<(mb_domain::config::Config, String)> {
    let config_path = config_path(explicit);
    let config = mb_domain::config::Config::load_or_default(&config_path)
        .with_context(|| format!("loading {config_path}"))?;
    Ok((config, config_path))
}
