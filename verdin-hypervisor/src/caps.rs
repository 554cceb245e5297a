//! Host capability probe.
//!
//! Probed once at startup and cached; every answer degrades to a safe
//! default when the driver cannot say, so a flaky probe never blocks the
//! node from coming up.

use tracing::warn;

use crate::traits::VirtDriver;

/// Upper bound on guest vCPUs for Power hosts, regardless of what the
/// hypervisor reports.
const POWER_MAX_VCPUS: u32 = 255;

/// Fallback when the driver cannot report a vCPU limit.
const DEFAULT_MAX_VCPUS: u32 = 64;

/// What the host can do, as far as the engine cares.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Whether memory DIMMs can be hot-added to running guests.
    pub mem_hotplug_support: bool,
    /// Remote display protocols available for console streaming.
    pub stream_protocols: Vec<String>,
    /// Maximum vCPUs per guest.
    pub max_vcpus: u32,
}

impl Capabilities {
    /// Probe the driver. `arch` is the host machine architecture as
    /// reported by the OS (`x86_64`, `ppc64le`, ...).
    pub async fn probe(driver: &dyn VirtDriver, arch: &str) -> Self {
        let mem_hotplug_support = match driver.supports_memory_hotplug().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "memory hotplug probe failed, assuming unsupported");
                false
            }
        };

        let stream_protocols = match driver.stream_protocols().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stream protocol probe failed");
                Vec::new()
            }
        };

        let reported = match driver.hypervisor_max_vcpus().await {
            Ok(v) if v > 0 => v,
            Ok(_) => DEFAULT_MAX_VCPUS,
            Err(e) => {
                warn!(error = %e, "max vcpu probe failed, using default");
                DEFAULT_MAX_VCPUS
            }
        };
        let max_vcpus = if arch.starts_with("ppc64") {
            reported.min(POWER_MAX_VCPUS)
        } else {
            reported
        };

        Self { mem_hotplug_support, stream_protocols, max_vcpus }
    }
}
