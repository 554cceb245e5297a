//! Command-line argument parsing.

use clap::Parser;

/// Verdin Node Daemon - VM management agent
#[derive(Parser, Debug)]
#[command(name = "verdin-node")]
#[command(about = "Verdin Node Daemon - VM management agent")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "VERDIN_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Libvirt connection URI
    #[arg(long, default_value = "qemu:///system", env = "VERDIN_LIBVIRT_URI")]
    pub libvirt_uri: String,

    /// Default storage pool for created and cloned volumes
    #[arg(long)]
    pub default_pool: Option<String>,

    /// Path to the object store file
    #[arg(long)]
    pub objstore: Option<String>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}
