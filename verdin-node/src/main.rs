//! # Verdin Node Daemon
//!
//! Runs on each hypervisor host and manages virtual machines through the
//! driver abstraction: lifecycle, updates, storage volumes, devices and
//! runtime stats.
//!
//! ## Usage
//! ```bash
//! verdin-node --config /etc/verdin/node.yaml
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use verdin_engine::host::{HostOps, UnixHost};
use verdin_engine::{ObjectStore, TemplateCatalog, VmsModel};
use verdin_hypervisor::{Capabilities, MockDriver, VirtDriver};

mod cli;
mod config;

use cli::Args;
use config::{Config, HypervisorBackend};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.log_json {
        verdin_common::LogFormat::Json
    } else {
        verdin_common::LogFormat::Text
    };
    verdin_common::init(&args.log_level, format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Verdin Node Daemon"
    );

    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => {
            let default_path = "/etc/verdin/node.yaml";
            match Config::load(default_path) {
                Ok(cfg) => {
                    info!(config_path = %default_path, "Configuration loaded from default location");
                    cfg.with_cli_overrides(&args)
                }
                Err(_) => {
                    info!("No config file found, using CLI arguments and defaults");
                    Config::default_with_cli(&args)
                }
            }
        }
    };

    info!(
        hostname = %config.node.get_hostname(),
        hypervisor = ?config.hypervisor.backend,
        default_pool = %config.storage.default_pool,
        "Node daemon configured"
    );

    let driver = build_driver(&config).await?;
    let host = Arc::new(UnixHost::new(config.node.hypervisor_user.clone()));
    let caps = Capabilities::probe(driver.as_ref(), host.arch()).await;
    info!(
        max_vcpus = caps.max_vcpus,
        mem_hotplug = caps.mem_hotplug_support,
        protocols = ?caps.stream_protocols,
        "Host capabilities probed"
    );

    let store = Arc::new(ObjectStore::open(&config.storage.objstore_path).await?);
    let templates = Arc::new(TemplateCatalog::new());
    for template in &config.templates {
        if let Err(e) = template.validate(&caps) {
            warn!(template = %template.name, error = %e, "Skipping invalid template");
            continue;
        }
        templates.add(template.clone()).await;
    }
    info!(templates = templates.list().await.len(), "Template catalog loaded");

    let model = VmsModel::new(
        driver,
        store,
        templates,
        host.clone(),
        host,
        caps,
        &config.storage.default_pool,
    );

    let stats_interval = std::time::Duration::from_secs(config.node.stats_interval_secs.max(1));
    let stats_model = model.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = refresh_all(&stats_model).await {
                warn!(error = %e, "Stats refresh pass failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    Ok(())
}

async fn build_driver(config: &Config) -> Result<Arc<dyn VirtDriver>> {
    if config.hypervisor.backend == HypervisorBackend::Mock {
        info!("Using mock hypervisor backend");
        return Ok(Arc::new(MockDriver::new()));
    }
    connect_libvirt(&config.hypervisor.libvirt_uri).await
}

#[cfg(feature = "libvirt")]
async fn connect_libvirt(uri: &str) -> Result<Arc<dyn VirtDriver>> {
    info!(uri = %uri, "Connecting to libvirt");
    let driver = verdin_hypervisor::LibvirtDriver::new(uri).await?;
    Ok(Arc::new(driver))
}

#[cfg(not(feature = "libvirt"))]
async fn connect_libvirt(uri: &str) -> Result<Arc<dyn VirtDriver>> {
    anyhow::bail!(
        "built without libvirt support, cannot connect to {uri}; run with --dev for the mock backend"
    )
}

/// One stats pass over every known VM. Keeps the tracker's baselines warm
/// so API lookups report rates instead of first-sample zeros.
async fn refresh_all(model: &Arc<VmsModel>) -> verdin_hypervisor::Result<()> {
    for name in model.list().await? {
        if let Err(e) = model.refresh_stats(&name).await {
            warn!(vm = %name, error = %e, "stats refresh failed");
        }
    }
    Ok(())
}
