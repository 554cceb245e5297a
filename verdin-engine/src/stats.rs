//! Runtime stats tracker.
//!
//! Keeps exactly one previous sample per VM uuid and turns the driver's
//! cumulative counters into rates on each refresh. Entries are dropped as
//! soon as the VM stops running so a later boot starts from a clean sample
//! instead of reporting rates against a stale baseline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use verdin_hypervisor::descriptor::DomainDescriptor;
use verdin_hypervisor::error::Result;
use verdin_hypervisor::{DomainInfo, VirtDriver};

/// Rates are reported in KB per second, CPU in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VmStats {
    pub cpu_utilization: f64,
    pub net_throughput: f64,
    pub net_throughput_peak: f64,
    pub io_throughput: f64,
    pub io_throughput_peak: f64,
}

struct Sample {
    when: Instant,
    cpu_time_ns: u64,
    net_kb: f64,
    disk_kb: f64,
    net_peak: f64,
    io_peak: f64,
}

pub struct StatsTracker {
    driver: Arc<dyn VirtDriver>,
    samples: Mutex<HashMap<String, Sample>>,
}

impl StatsTracker {
    pub fn new(driver: Arc<dyn VirtDriver>) -> Self {
        Self { driver, samples: Mutex::new(HashMap::new()) }
    }

    /// Drop the sample for a uuid. Called whenever the VM is seen not
    /// running.
    pub async fn reset(&self, uuid: &str) {
        self.samples.lock().await.remove(uuid);
    }

    /// Refresh stats for a running VM. Returns zeros on the first sample.
    pub async fn refresh(&self, uuid: &str, name: &str, info: &DomainInfo) -> Result<VmStats> {
        if !info.state.is_running() {
            self.reset(uuid).await;
            return Ok(VmStats::default());
        }

        let descriptor = DomainDescriptor::parse(&self.driver.domain_xml(name).await?)?;

        let mut net_kb = 0.0;
        for iface in &descriptor.devices.interfaces {
            let Some(target) = &iface.target else { continue };
            let c = self.driver.interface_counters(name, &target.dev).await?;
            net_kb += (c.rx_bytes + c.tx_bytes) as f64 / 1000.0;
        }
        let mut disk_kb = 0.0;
        for dev in descriptor.disk_targets() {
            let c = self.driver.block_counters(name, dev).await?;
            disk_kb += (c.rd_bytes + c.wr_bytes) as f64 / 1000.0;
        }

        let now = Instant::now();
        let mut samples = self.samples.lock().await;
        let stats = match samples.get(uuid) {
            Some(prev) => {
                let seconds = now.duration_since(prev.when).as_secs_f64();
                if seconds <= 0.0 {
                    return Ok(VmStats {
                        net_throughput_peak: prev.net_peak,
                        io_throughput_peak: prev.io_peak,
                        ..VmStats::default()
                    });
                }
                let vcpus = info.vcpus.max(1) as f64;
                let cpu_delta_s =
                    info.cpu_time_ns.saturating_sub(prev.cpu_time_ns) as f64 / 1e9;
                let cpu = (cpu_delta_s / seconds / vcpus * 100.0).clamp(0.0, 100.0);
                let net_rate = ((net_kb - prev.net_kb) / seconds).max(0.0);
                let io_rate = ((disk_kb - prev.disk_kb) / seconds).max(0.0);
                VmStats {
                    cpu_utilization: cpu,
                    net_throughput: net_rate,
                    net_throughput_peak: prev.net_peak.max(net_rate),
                    io_throughput: io_rate,
                    io_throughput_peak: prev.io_peak.max(io_rate),
                }
            }
            None => VmStats::default(),
        };
        samples.insert(
            uuid.to_string(),
            Sample {
                when: now,
                cpu_time_ns: info.cpu_time_ns,
                net_kb,
                disk_kb,
                net_peak: stats.net_throughput_peak,
                io_peak: stats.io_throughput_peak,
            },
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use verdin_hypervisor::descriptor::{
        DiskBus, DiskDevice, DiskRole, DiskSource, DiskSourceType, DiskTarget,
        InterfaceDevice, InterfaceTarget, SizedElement, VcpuElement,
    };
    use verdin_hypervisor::MockDriver;

    async fn setup() -> (Arc<MockDriver>, StatsTracker, String) {
        let driver = Arc::new(MockDriver::new());
        let desc = DomainDescriptor {
            virt_type: "kvm".to_string(),
            name: "vm1".to_string(),
            uuid: None,
            memory: SizedElement::kib(1024 * 1024),
            current_memory: None,
            max_memory: None,
            vcpu: VcpuElement::new(1),
            cpu: None,
            os: None,
            devices: verdin_hypervisor::descriptor::Devices {
                disks: vec![DiskDevice {
                    source_type: DiskSourceType::File,
                    role: DiskRole::Disk,
                    driver: None,
                    source: Some(DiskSource {
                        file: Some("/tmp/vm1.img".to_string()),
                        ..Default::default()
                    }),
                    target: DiskTarget { dev: "vda".to_string(), bus: DiskBus::Virtio },
                    address: None,
                    readonly: None,
                }],
                interfaces: vec![InterfaceDevice {
                    kind: "network".to_string(),
                    mac: None,
                    source: None,
                    model: None,
                    target: Some(InterfaceTarget { dev: "vnet0".to_string() }),
                }],
                ..Default::default()
            },
        };
        driver.define_domain(&desc.to_xml().unwrap()).await.unwrap();
        driver.start_domain("vm1").await.unwrap();
        let uuid = driver.domain_uuid("vm1").await.unwrap();
        let tracker = StatsTracker::new(driver.clone());
        (driver, tracker, uuid)
    }

    #[tokio::test]
    async fn first_sample_is_zero_then_rates_appear() {
        let (driver, tracker, uuid) = setup().await;
        let info = driver.domain_info("vm1").await.unwrap();
        let first = tracker.refresh(&uuid, "vm1", &info).await.unwrap();
        assert_eq!(first, VmStats::default());

        driver.add_net_traffic("vm1", "vnet0", 100_000, 100_000).await;
        driver.add_disk_io("vm1", "vda", 50_000, 50_000).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let info = driver.domain_info("vm1").await.unwrap();
        let second = tracker.refresh(&uuid, "vm1", &info).await.unwrap();
        assert!(second.net_throughput > 0.0);
        assert!(second.io_throughput > 0.0);
        assert_eq!(second.net_throughput_peak, second.net_throughput);
    }

    #[tokio::test]
    async fn cpu_is_clamped_to_hundred() {
        let (driver, tracker, uuid) = setup().await;
        let info = driver.domain_info("vm1").await.unwrap();
        tracker.refresh(&uuid, "vm1", &info).await.unwrap();
        // An hour of CPU time in a few milliseconds of wall clock.
        driver.advance_cpu_time("vm1", 3_600_000_000_000).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let info = driver.domain_info("vm1").await.unwrap();
        let stats = tracker.refresh(&uuid, "vm1", &info).await.unwrap();
        assert_eq!(stats.cpu_utilization, 100.0);
    }

    #[tokio::test]
    async fn stopped_vm_resets_sample() {
        let (driver, tracker, uuid) = setup().await;
        let info = driver.domain_info("vm1").await.unwrap();
        tracker.refresh(&uuid, "vm1", &info).await.unwrap();
        driver.destroy_domain("vm1").await.unwrap();
        let info = driver.domain_info("vm1").await.unwrap();
        let stats = tracker.refresh(&uuid, "vm1", &info).await.unwrap();
        assert_eq!(stats, VmStats::default());
        assert!(tracker.samples.lock().await.get(&uuid).is_none());
    }
}
