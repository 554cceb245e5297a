//! Configuration management for the node daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use verdin_engine::VmTemplate;

use crate::cli::Args;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node-specific configuration
    pub node: NodeConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Storage defaults
    pub storage: StorageConfig,
    /// Templates registered at startup
    pub templates: Vec<VmTemplate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            hypervisor: HypervisorConfig::default(),
            storage: StorageConfig::default(),
            templates: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }
        if args.libvirt_uri != "qemu:///system" {
            self.hypervisor.libvirt_uri = args.libvirt_uri.clone();
        }
        if let Some(pool) = &args.default_pool {
            self.storage.default_pool = pool.clone();
        }
        if let Some(objstore) = &args.objstore {
            self.storage.objstore_path = objstore.clone();
        }
        self
    }

    /// Build a configuration from CLI arguments alone.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Hostname (auto-detected if not set)
    pub hostname: Option<String>,
    /// Unix account the hypervisor runs guests as
    pub hypervisor_user: String,
    /// Stats refresh interval in seconds
    pub stats_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            hypervisor_user: "qemu".to_string(),
            stats_interval_secs: 5,
        }
    }
}

impl NodeConfig {
    /// Get the hostname, detecting it if not set.
    pub fn get_hostname(&self) -> String {
        self.hostname.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }
}

/// Hypervisor backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Real libvirt backend (requires the `libvirt` feature)
    Libvirt,
    /// In-memory mock backend for development
    Mock,
}

/// Hypervisor configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub backend: HypervisorBackend,
    pub libvirt_uri: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Libvirt,
            libvirt_uri: "qemu:///system".to_string(),
        }
    }
}

/// Storage defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Pool that receives created volumes and clone fallbacks
    pub default_pool: String,
    /// Object store file
    pub objstore_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_pool: "default".to_string(),
            objstore_path: "/var/lib/verdin/objstore.json".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_with_templates() {
        let yaml = r#"
node:
  hypervisor_user: libvirt-qemu
hypervisor:
  backend: mock
storage:
  default_pool: images
templates:
  - name: fedora
    cpus: 2
    memory_mib: 2048
    disks:
      - pool: images
        size_gib: 10
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, yaml).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.storage.default_pool, "images");
        assert_eq!(config.node.hypervisor_user, "libvirt-qemu");
        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.templates[0].disks[0].size_gib, 10);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load("/nonexistent/node.yaml").is_err());
    }

    #[test]
    fn cli_overrides_apply() {
        use clap::Parser;
        let args = crate::cli::Args::parse_from([
            "verdin-node",
            "--dev",
            "--default-pool",
            "fast",
        ]);
        let config = Config::default_with_cli(&args);
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.storage.default_pool, "fast");
    }
}
