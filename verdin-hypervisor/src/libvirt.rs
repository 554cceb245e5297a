//! Libvirt backend.
//!
//! Only compiled with the `libvirt` feature (requires system libvirt).
//! Domain, pool and volume operations go through the virt crate; the few
//! APIs the v0.4 bindings do not expose (snapshots, per-key metadata,
//! screenshots) fall back to the `virsh` command line tool.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{EngineError, Result};
use crate::traits::VirtDriver;
use crate::types::{
    BlockCounters, DeviceFlags, DomainInfo, DomainState, InterfaceCounters, PoolKind,
    PoolState, SnapshotRecord, VolumeRecord, VolumeSpec,
};

/// Libvirt/QEMU driver.
///
/// Common URIs:
/// - `qemu:///system` - System-wide QEMU/KVM
/// - `qemu:///session` - User session QEMU
pub struct LibvirtDriver {
    uri: String,
    connection: Connect,
}

impl LibvirtDriver {
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "connecting to libvirt");
        let connection = Connect::open(Some(uri))
            .map_err(|e| EngineError::failed("libvirt connect", e))?;
        Ok(Self { uri: uri.to_string(), connection })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|_| EngineError::not_found("domain", name))
    }

    fn pool(&self, name: &str) -> Result<StoragePool> {
        StoragePool::lookup_by_name(&self.connection, name)
            .map_err(|_| EngineError::not_found("pool", name))
    }

    fn device_change_flags(flags: DeviceFlags) -> u32 {
        let mut out = 0;
        if flags.live {
            out |= sys::VIR_DOMAIN_AFFECT_LIVE;
        }
        if flags.persistent {
            out |= sys::VIR_DOMAIN_AFFECT_CONFIG;
        }
        out
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let output = std::process::Command::new("virsh")
            .arg("-c")
            .arg(&self.uri)
            .args(args)
            .output()
            .map_err(|e| EngineError::failed("virsh", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::failed("virsh", stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn metadata_uri(namespace: &str, key: &str) -> String {
        format!("{namespace}/{key}")
    }
}

/// Just enough of the pool definition to read its type.
#[derive(Deserialize)]
#[serde(rename = "pool")]
struct PoolDoc {
    #[serde(rename = "@type")]
    kind: String,
}

/// Just enough of the volume definition to read its format.
#[derive(Deserialize)]
#[serde(rename = "volume")]
struct VolumeDoc {
    #[serde(default)]
    target: Option<VolumeTargetDoc>,
}

#[derive(Deserialize)]
struct VolumeTargetDoc {
    #[serde(default)]
    format: Option<VolumeFormatDoc>,
}

#[derive(Deserialize)]
struct VolumeFormatDoc {
    #[serde(rename = "@type")]
    kind: String,
}

fn volume_format(xml: &str) -> String {
    quick_xml::de::from_str::<VolumeDoc>(xml)
        .ok()
        .and_then(|v| v.target)
        .and_then(|t| t.format)
        .map(|f| f.kind)
        .unwrap_or_else(|| "raw".to_string())
}

fn volume_record_from(vol: &StorageVol, pool_name: &str) -> Result<VolumeRecord> {
    let info = vol.get_info().map_err(|e| EngineError::failed("volume info", e))?;
    let name = vol.get_name().map_err(|e| EngineError::failed("volume name", e))?;
    let path = vol.get_path().map_err(|e| EngineError::failed("volume path", e))?;
    let xml = vol
        .get_xml_desc(0)
        .map_err(|e| EngineError::failed("volume xml", e))?;
    Ok(VolumeRecord {
        name,
        pool: pool_name.to_string(),
        path,
        capacity: info.capacity,
        allocation: info.allocation,
        format: volume_format(&xml),
    })
}

#[async_trait]
impl VirtDriver for LibvirtDriver {
    async fn list_domains(&self) -> Result<Vec<String>> {
        let domains = self
            .connection
            .list_all_domains(0)
            .map_err(|e| EngineError::failed("list domains", e))?;
        let mut names = Vec::with_capacity(domains.len());
        for d in domains {
            names.push(d.get_name().map_err(|e| EngineError::failed("domain name", e))?);
        }
        names.sort();
        Ok(names)
    }

    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(Domain::lookup_by_name(&self.connection, name).is_ok())
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<()> {
        Domain::define_xml(&self.connection, xml)
            .map_err(|e| EngineError::failed("define", e))?;
        Ok(())
    }

    async fn redefine_domain(&self, xml: &str) -> Result<()> {
        // Defining over an existing name replaces the persistent config.
        Domain::define_xml(&self.connection, xml)
            .map_err(|e| EngineError::failed("redefine", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn undefine_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain
            .undefine()
            .map_err(|e| EngineError::failed("undefine", e))?;
        Ok(())
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        let domain = self.domain(name)?;
        domain
            .get_xml_desc(0)
            .map_err(|e| EngineError::failed("domain xml", e))
    }

    async fn domain_uuid(&self, name: &str) -> Result<String> {
        let domain = self.domain(name)?;
        domain
            .get_uuid_string()
            .map_err(|e| EngineError::failed("domain uuid", e))
    }

    async fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        let domain = self.domain(name)?;
        let info = domain
            .get_info()
            .map_err(|e| EngineError::failed("domain info", e))?;
        Ok(DomainInfo {
            state: DomainState::from_code(info.state),
            max_memory_kib: info.max_mem,
            memory_kib: info.memory,
            vcpus: info.nr_virt_cpu as u32,
            cpu_time_ns: info.cpu_time,
        })
    }

    async fn is_persistent(&self, name: &str) -> Result<bool> {
        let domain = self.domain(name)?;
        domain
            .is_persistent()
            .map_err(|e| EngineError::failed("domain persistence", e))
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn start_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain.create().map_err(|e| EngineError::failed("start", e))?;
        info!(domain = %name, "domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn destroy_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain.destroy().map_err(|e| EngineError::failed("destroy", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain.shutdown().map_err(|e| EngineError::failed("shutdown", e))?;
        Ok(())
    }

    async fn reset_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain.reset().map_err(|e| EngineError::failed("reset", e))?;
        Ok(())
    }

    async fn suspend_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain.suspend().map_err(|e| EngineError::failed("suspend", e))?;
        Ok(())
    }

    async fn resume_domain(&self, name: &str) -> Result<()> {
        let domain = self.domain(name)?;
        domain.resume().map_err(|e| EngineError::failed("resume", e))?;
        Ok(())
    }

    #[instrument(skip(self, device_xml), fields(domain = %name))]
    async fn attach_device(
        &self,
        name: &str,
        device_xml: &str,
        flags: DeviceFlags,
    ) -> Result<()> {
        let domain = self.domain(name)?;
        debug!(xml = %device_xml, "attaching device");
        domain
            .attach_device_flags(device_xml, Self::device_change_flags(flags))
            .map_err(|e| EngineError::failed("attach device", e))?;
        Ok(())
    }

    #[instrument(skip(self, device_xml), fields(domain = %name))]
    async fn detach_device(
        &self,
        name: &str,
        device_xml: &str,
        flags: DeviceFlags,
    ) -> Result<()> {
        let domain = self.domain(name)?;
        domain
            .detach_device_flags(device_xml, Self::device_change_flags(flags))
            .map_err(|e| EngineError::failed("detach device", e))?;
        Ok(())
    }

    async fn update_device(
        &self,
        name: &str,
        device_xml: &str,
        flags: DeviceFlags,
    ) -> Result<()> {
        let domain = self.domain(name)?;
        domain
            .update_device_flags(device_xml, Self::device_change_flags(flags))
            .map_err(|e| EngineError::failed("update device", e))?;
        Ok(())
    }

    async fn set_vcpus_live(&self, name: &str, count: u32) -> Result<()> {
        let domain = self.domain(name)?;
        domain
            .set_vcpus_flags(count, sys::VIR_DOMAIN_VCPU_LIVE)
            .map_err(|e| EngineError::failed("set vcpus", e))?;
        Ok(())
    }

    async fn domain_metadata(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>> {
        // The v0.4 bindings do not expose virDomainGetMetadata.
        let uri = Self::metadata_uri(namespace, key);
        match self.virsh(&["metadata", name, &uri]) {
            Ok(xml) => Ok(Some(xml.trim().to_string())),
            Err(EngineError::OperationFailed { cause, .. })
                if cause.contains("no metadata") || cause.contains("not found") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn set_domain_metadata(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        fragment_xml: Option<&str>,
    ) -> Result<()> {
        let uri = Self::metadata_uri(namespace, key);
        match fragment_xml {
            Some(xml) => {
                self.virsh(&["metadata", name, &uri, "--key", key, "--set", xml])?;
            }
            None => {
                self.virsh(&["metadata", name, &uri, "--remove"])?;
            }
        }
        Ok(())
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotRecord>> {
        // virsh fallback, the v0.4 bindings lack snapshot APIs.
        let listing = self.virsh(&["snapshot-list", name, "--name"])?;
        let current = self
            .virsh(&["snapshot-current", name, "--name"])
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let mut records = Vec::new();
        for snap in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let xml = self.virsh(&["snapshot-dumpxml", name, snap])?;
            let parent = self
                .virsh(&["snapshot-parent", name, snap])
                .ok()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty());
            let created = xml
                .split("<creationTime>")
                .nth(1)
                .and_then(|rest| rest.split('<').next())
                .and_then(|t| t.trim().parse().ok())
                .unwrap_or(0);
            records.push(SnapshotRecord {
                name: snap.to_string(),
                parent,
                current: snap == current,
                created,
                xml,
            });
        }
        Ok(records)
    }

    #[instrument(skip(self), fields(domain = %name))]
    async fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()> {
        self.virsh(&["snapshot-create-as", name, snapshot_name])?;
        info!(domain = %name, snapshot = %snapshot_name, "snapshot created");
        Ok(())
    }

    async fn redefine_snapshot(&self, name: &str, xml: &str, current: bool) -> Result<()> {
        let path = std::env::temp_dir().join(format!("verdin-snap-{}.xml", uuid::Uuid::new_v4()));
        std::fs::write(&path, xml).map_err(|e| EngineError::failed("snapshot spool", e))?;
        let path_str = path.to_string_lossy().into_owned();
        let mut args = vec!["snapshot-create", name, path_str.as_str(), "--redefine"];
        if current {
            args.push("--current");
        }
        let result = self.virsh(&args);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(error = %e, "failed to remove snapshot spool file");
        }
        result.map(|_| ())
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        snapshot_name: &str,
        children: bool,
        metadata_only: bool,
    ) -> Result<()> {
        let mut args = vec!["snapshot-delete", name, snapshot_name];
        if children {
            args.push("--children");
        }
        if metadata_only {
            args.push("--metadata");
        }
        self.virsh(&args)?;
        Ok(())
    }

    async fn interface_counters(&self, name: &str, dev: &str) -> Result<InterfaceCounters> {
        let domain = self.domain(name)?;
        let stats = domain
            .interface_stats(dev)
            .map_err(|e| EngineError::failed("interface stats", e))?;
        Ok(InterfaceCounters {
            rx_bytes: stats.rx_bytes.max(0) as u64,
            tx_bytes: stats.tx_bytes.max(0) as u64,
        })
    }

    async fn block_counters(&self, name: &str, dev: &str) -> Result<BlockCounters> {
        let domain = self.domain(name)?;
        let stats = domain
            .get_block_stats(dev)
            .map_err(|e| EngineError::failed("block stats", e))?;
        Ok(BlockCounters {
            rd_bytes: stats.rd_bytes.max(0) as u64,
            wr_bytes: stats.wr_bytes.max(0) as u64,
        })
    }

    async fn screenshot(&self, name: &str) -> Result<Vec<u8>> {
        let path = std::env::temp_dir().join(format!("verdin-shot-{}.ppm", uuid::Uuid::new_v4()));
        let path_str = path.to_string_lossy().into_owned();
        self.virsh(&["screenshot", name, "--file", path_str.as_str()])?;
        let bytes =
            std::fs::read(&path).map_err(|e| EngineError::failed("screenshot read", e))?;
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(error = %e, "failed to remove screenshot file");
        }
        Ok(bytes)
    }

    async fn hypervisor_max_vcpus(&self) -> Result<u32> {
        self.connection
            .get_max_vcpus(None)
            .map(|n| n as u32)
            .map_err(|e| EngineError::failed("max vcpus", e))
    }

    async fn supports_memory_hotplug(&self) -> Result<bool> {
        // QEMU/KVM accepts DIMM hot-add on every version this targets.
        Ok(true)
    }

    async fn stream_protocols(&self) -> Result<Vec<String>> {
        Ok(vec!["vnc".to_string(), "spice".to_string()])
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        let pools = self
            .connection
            .list_all_storage_pools(0)
            .map_err(|e| EngineError::failed("list pools", e))?;
        let mut names = Vec::with_capacity(pools.len());
        for p in pools {
            names.push(p.get_name().map_err(|e| EngineError::failed("pool name", e))?);
        }
        names.sort();
        Ok(names)
    }

    async fn pool_state(&self, pool: &str) -> Result<PoolState> {
        let p = self.pool(pool)?;
        let info = p.get_info().map_err(|e| EngineError::failed("pool info", e))?;
        let active = p.is_active().map_err(|e| EngineError::failed("pool state", e))?;
        let xml = p
            .get_xml_desc(0)
            .map_err(|e| EngineError::failed("pool xml", e))?;
        let doc: PoolDoc =
            quick_xml::de::from_str(&xml).map_err(|e| EngineError::failed("pool xml parse", e))?;
        let kind = doc
            .kind
            .parse::<PoolKind>()
            .map_err(EngineError::InvalidParameter)?;
        Ok(PoolState {
            name: pool.to_string(),
            kind,
            capacity: info.capacity,
            available: info.available,
            active,
        })
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let p = self.pool(pool)?;
        let mut names = p
            .list_volumes()
            .map_err(|e| EngineError::failed("list volumes", e))?;
        names.sort();
        Ok(names)
    }

    async fn volume_record(&self, pool: &str, volume: &str) -> Result<VolumeRecord> {
        let p = self.pool(pool)?;
        let vol = StorageVol::lookup_by_name(&p, volume)
            .map_err(|_| EngineError::not_found("volume", volume))?;
        volume_record_from(&vol, pool)
    }

    async fn volume_by_path(&self, path: &str) -> Result<VolumeRecord> {
        let vol = StorageVol::lookup_by_path(&self.connection, path)
            .map_err(|_| EngineError::not_found("volume", path))?;
        let pool = StoragePool::lookup_by_volume(&vol)
            .map_err(|e| EngineError::failed("volume pool", e))?;
        let pool_name = pool
            .get_name()
            .map_err(|e| EngineError::failed("pool name", e))?;
        volume_record_from(&vol, &pool_name)
    }

    #[instrument(skip(self, spec), fields(pool = %pool, volume = %spec.name))]
    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeRecord> {
        let p = self.pool(pool)?;
        let xml = format!(
            "<volume><name>{}</name><capacity unit=\"bytes\">{}</capacity>\
             <target><format type=\"{}\"/></target></volume>",
            spec.name, spec.capacity, spec.format
        );
        let vol = StorageVol::create_xml(&p, &xml, 0)
            .map_err(|e| EngineError::failed("volume create", e))?;
        volume_record_from(&vol, pool)
    }

    #[instrument(skip(self), fields(src = %src_volume, dest = %dest_name))]
    async fn clone_volume(
        &self,
        src_pool: &str,
        src_volume: &str,
        dest_pool: &str,
        dest_name: &str,
    ) -> Result<VolumeRecord> {
        let sp = self.pool(src_pool)?;
        let src = StorageVol::lookup_by_name(&sp, src_volume)
            .map_err(|_| EngineError::not_found("volume", src_volume))?;
        let src_record = volume_record_from(&src, src_pool)?;
        let dp = self.pool(dest_pool)?;
        let xml = format!(
            "<volume><name>{}</name><capacity unit=\"bytes\">{}</capacity>\
             <target><format type=\"{}\"/></target></volume>",
            dest_name, src_record.capacity, src_record.format
        );
        let vol = StorageVol::create_xml_from(&dp, &xml, &src, 0)
            .map_err(|e| EngineError::failed("volume clone", e))?;
        volume_record_from(&vol, dest_pool)
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        let p = self.pool(pool)?;
        let vol = StorageVol::lookup_by_name(&p, volume)
            .map_err(|_| EngineError::not_found("volume", volume))?;
        vol.delete(0)
            .map_err(|e| EngineError::failed("volume delete", e))?;
        Ok(())
    }
}
