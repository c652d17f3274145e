use clap::Parser;
use std::path::PathBuf;

/// Concierge - chat assistant grounded in live data from MCP providers
#[derive(Parser, Debug, Clone)]
#[command(name = "concierge", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CONCIERGE_CONFIG", default_value = "concierge.toml")]
    pub config: PathBuf,

    /// Server host address
    #[arg(long, env = "CONCIERGE_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "CONCIERGE_PORT")]
    pub port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Do not reload the configuration when the file changes
    #[arg(long)]
    pub no_watch: bool,
}
