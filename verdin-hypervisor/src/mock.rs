//! In-memory mock driver.
//!
//! Implements the full `VirtDriver` surface against hash maps so the engine
//! can be developed and tested on hosts without a hypervisor. State
//! transitions are immediate (a shutdown request lands in `Shutoff` right
//! away) and storage pools do real capacity accounting so out-of-space
//! paths are testable. A few fault-injection knobs let tests force the
//! failure branches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::descriptor::{
    CpuSocketDevice, DiskDevice, DomainDescriptor, GraphicsDevice, HostdevDevice,
    InterfaceDevice, MemoryDevice,
};
use crate::error::{EngineError, Result};
use crate::traits::VirtDriver;
use crate::types::{
    BlockCounters, DeviceFlags, DomainInfo, DomainState, InterfaceCounters, PoolKind,
    PoolState, SnapshotRecord, VolumeRecord, VolumeSpec,
};

#[derive(Debug, Clone)]
struct MockDomain {
    descriptor: DomainDescriptor,
    state: DomainState,
    persistent: bool,
    uuid: String,
    cpu_time_ns: u64,
    snapshots: Vec<SnapshotRecord>,
    metadata: HashMap<String, String>,
    net_counters: HashMap<String, InterfaceCounters>,
    block_counters: HashMap<String, BlockCounters>,
}

#[derive(Debug, Clone)]
struct MockPool {
    kind: PoolKind,
    capacity: u64,
    used: u64,
    active: bool,
    volumes: HashMap<String, VolumeRecord>,
}

impl MockPool {
    fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Stored snapshot definition. The engine treats snapshot XML as opaque;
/// this is the shape the mock round-trips through redefine.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "domainsnapshot")]
struct SnapshotDoc {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<SnapshotParentDoc>,
    #[serde(rename = "creationTime")]
    creation_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotParentDoc {
    name: String,
}

/// Mock hypervisor driver.
pub struct MockDriver {
    domains: RwLock<HashMap<String, MockDomain>>,
    pools: RwLock<HashMap<String, MockPool>>,
    max_vcpus: RwLock<u32>,
    mem_hotplug: RwLock<bool>,
    snapshots_unsupported: AtomicBool,
    fail_next_define: AtomicBool,
    fail_next_volume_create: AtomicBool,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// A driver with one 100 GiB `default` directory pool.
    pub fn new() -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            "default".to_string(),
            MockPool {
                kind: PoolKind::Dir,
                capacity: 100 * 1024 * 1024 * 1024,
                used: 0,
                active: true,
                volumes: HashMap::new(),
            },
        );
        Self {
            domains: RwLock::new(HashMap::new()),
            pools: RwLock::new(pools),
            max_vcpus: RwLock::new(160),
            mem_hotplug: RwLock::new(true),
            snapshots_unsupported: AtomicBool::new(false),
            fail_next_define: AtomicBool::new(false),
            fail_next_volume_create: AtomicBool::new(false),
        }
    }

    // --- test harness knobs ----------------------------------------------

    pub async fn add_pool(&self, name: &str, kind: PoolKind, capacity: u64) {
        self.pools.write().await.insert(
            name.to_string(),
            MockPool { kind, capacity, used: 0, active: true, volumes: HashMap::new() },
        );
    }

    pub async fn set_max_vcpus(&self, count: u32) {
        *self.max_vcpus.write().await = count;
    }

    pub async fn set_memory_hotplug(&self, supported: bool) {
        *self.mem_hotplug.write().await = supported;
    }

    /// Make every snapshot operation report `Unsupported`.
    pub fn disable_snapshots(&self) {
        self.snapshots_unsupported.store(true, Ordering::SeqCst);
    }

    /// Fail the next `define_domain` call.
    pub fn fail_next_define(&self) {
        self.fail_next_define.store(true, Ordering::SeqCst);
    }

    /// Fail the next volume create or clone.
    pub fn fail_next_volume_create(&self) {
        self.fail_next_volume_create.store(true, Ordering::SeqCst);
    }

    /// Bump a domain's cumulative CPU time.
    pub async fn advance_cpu_time(&self, name: &str, delta_ns: u64) {
        if let Some(dom) = self.domains.write().await.get_mut(name) {
            dom.cpu_time_ns += delta_ns;
        }
    }

    /// Bump interface counters for a device.
    pub async fn add_net_traffic(&self, name: &str, dev: &str, rx: u64, tx: u64) {
        if let Some(dom) = self.domains.write().await.get_mut(name) {
            let c = dom.net_counters.entry(dev.to_string()).or_default();
            c.rx_bytes += rx;
            c.tx_bytes += tx;
        }
    }

    /// Bump block counters for a device.
    pub async fn add_disk_io(&self, name: &str, dev: &str, rd: u64, wr: u64) {
        if let Some(dom) = self.domains.write().await.get_mut(name) {
            let c = dom.block_counters.entry(dev.to_string()).or_default();
            c.rd_bytes += rd;
            c.wr_bytes += wr;
        }
    }

    fn snapshots_off(&self) -> Result<()> {
        if self.snapshots_unsupported.load(Ordering::SeqCst) {
            return Err(EngineError::Unsupported("snapshots".to_string()));
        }
        Ok(())
    }
}

fn domain_not_found(name: &str) -> EngineError {
    EngineError::not_found("domain", name)
}

fn pool_not_found(name: &str) -> EngineError {
    EngineError::not_found("pool", name)
}

/// Root element name of a device fragment.
fn fragment_tag(xml: &str) -> Result<&str> {
    let rest = xml.trim_start().strip_prefix('<').ok_or_else(|| {
        EngineError::InvalidParameter("device fragment is not XML".to_string())
    })?;
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .ok_or_else(|| EngineError::InvalidParameter("malformed device fragment".to_string()))?;
    Ok(&rest[..end])
}

fn parse_fragment<'de, T: Deserialize<'de>>(xml: &'de str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|e| EngineError::failed("device fragment parse", e))
}

#[async_trait]
impl VirtDriver for MockDriver {
    async fn list_domains(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.domains.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.domains.read().await.contains_key(name))
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        if self.fail_next_define.swap(false, Ordering::SeqCst) {
            return Err(EngineError::failed("define", "injected failure"));
        }
        let descriptor = DomainDescriptor::parse(xml)?;
        let name = descriptor.name.clone();
        let mut domains = self.domains.write().await;
        if domains.contains_key(&name) {
            return Err(EngineError::InvalidParameter(format!(
                "domain '{name}' already exists"
            )));
        }
        let uuid = descriptor
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        info!(domain = %name, "defined domain");
        domains.insert(
            name,
            MockDomain {
                descriptor,
                state: DomainState::Shutoff,
                persistent: true,
                uuid,
                cpu_time_ns: 0,
                snapshots: Vec::new(),
                metadata: HashMap::new(),
                net_counters: HashMap::new(),
                block_counters: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn redefine_domain(&self, xml: &str) -> Result<()> {
        let descriptor = DomainDescriptor::parse(xml)?;
        let mut domains = self.domains.write().await;
        let dom = domains
            .get_mut(&descriptor.name)
            .ok_or_else(|| domain_not_found(&descriptor.name))?;
        dom.descriptor = descriptor;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        if dom.state.is_running() || dom.state == DomainState::Paused {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is {}, cannot undefine",
                dom.state
            )));
        }
        domains.remove(name);
        info!(domain = %name, "undefined domain");
        Ok(())
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        dom.descriptor.to_xml()
    }

    async fn domain_uuid(&self, name: &str) -> Result<String> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        Ok(dom.uuid.clone())
    }

    async fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        let current = dom
            .descriptor
            .current_memory
            .as_ref()
            .map(|m| m.value)
            .unwrap_or(dom.descriptor.memory.value);
        Ok(DomainInfo {
            state: dom.state,
            max_memory_kib: dom.descriptor.memory.value,
            memory_kib: current,
            vcpus: dom.descriptor.vcpu.current.unwrap_or(dom.descriptor.vcpu.count),
            cpu_time_ns: dom.cpu_time_ns,
        })
    }

    async fn is_persistent(&self, name: &str) -> Result<bool> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        Ok(dom.persistent)
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is already running"
            )));
        }
        dom.state = DomainState::Running;
        info!(domain = %name, "started domain");
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if dom.state == DomainState::Shutoff {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running"
            )));
        }
        dom.state = DomainState::Shutoff;
        dom.cpu_time_ns = 0;
        dom.net_counters.clear();
        dom.block_counters.clear();
        info!(domain = %name, "destroyed domain");
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running"
            )));
        }
        // The mock guest obliges immediately.
        dom.state = DomainState::Shutoff;
        dom.cpu_time_ns = 0;
        dom.net_counters.clear();
        dom.block_counters.clear();
        Ok(())
    }

    async fn reset_domain(&self, name: &str) -> Result<()> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        if !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running"
            )));
        }
        Ok(())
    }

    async fn suspend_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running, cannot suspend"
            )));
        }
        dom.state = DomainState::Paused;
        Ok(())
    }

    async fn resume_domain(&self, name: &str) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if dom.state != DomainState::Paused {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not paused, cannot resume"
            )));
        }
        dom.state = DomainState::Running;
        Ok(())
    }

    async fn attach_device(
        &self,
        name: &str,
        device_xml: &str,
        flags: DeviceFlags,
    ) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if flags.live && !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running, cannot hot-attach"
            )));
        }
        let devices = &mut dom.descriptor.devices;
        match fragment_tag(device_xml)? {
            "disk" => devices.disks.push(parse_fragment::<DiskDevice>(device_xml)?),
            "interface" => devices
                .interfaces
                .push(parse_fragment::<InterfaceDevice>(device_xml)?),
            "hostdev" => devices
                .hostdevs
                .push(parse_fragment::<HostdevDevice>(device_xml)?),
            "memory" => devices
                .memory_devices
                .push(parse_fragment::<MemoryDevice>(device_xml)?),
            "cpusocket" => devices
                .cpu_sockets
                .push(parse_fragment::<CpuSocketDevice>(device_xml)?),
            other => {
                return Err(EngineError::Unsupported(format!(
                    "attach of '{other}' devices"
                )))
            }
        }
        debug!(domain = %name, live = flags.live, "attached device");
        Ok(())
    }

    async fn detach_device(
        &self,
        name: &str,
        device_xml: &str,
        flags: DeviceFlags,
    ) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if flags.live && !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running, cannot hot-detach"
            )));
        }
        let devices = &mut dom.descriptor.devices;
        let found = match fragment_tag(device_xml)? {
            "disk" => {
                let disk: DiskDevice = parse_fragment(device_xml)?;
                let before = devices.disks.len();
                devices.disks.retain(|d| d.target.dev != disk.target.dev);
                devices.disks.len() < before
            }
            "interface" => {
                let iface: InterfaceDevice = parse_fragment(device_xml)?;
                remove_first(&mut devices.interfaces, |d| *d == iface)
            }
            "hostdev" => {
                let hostdev: HostdevDevice = parse_fragment(device_xml)?;
                remove_first(&mut devices.hostdevs, |d| d.source == hostdev.source)
            }
            "memory" => {
                let dimm: MemoryDevice = parse_fragment(device_xml)?;
                remove_first(&mut devices.memory_devices, |d| *d == dimm)
            }
            "cpusocket" => {
                let socket: CpuSocketDevice = parse_fragment(device_xml)?;
                remove_first(&mut devices.cpu_sockets, |d| d.id == socket.id)
            }
            other => {
                return Err(EngineError::Unsupported(format!(
                    "detach of '{other}' devices"
                )))
            }
        };
        if !found {
            return Err(EngineError::not_found("device", fragment_tag(device_xml)?));
        }
        debug!(domain = %name, live = flags.live, "detached device");
        Ok(())
    }

    async fn update_device(
        &self,
        name: &str,
        device_xml: &str,
        _flags: DeviceFlags,
    ) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        match fragment_tag(device_xml)? {
            "disk" => {
                let disk: DiskDevice = parse_fragment(device_xml)?;
                let slot = dom
                    .descriptor
                    .devices
                    .disks
                    .iter_mut()
                    .find(|d| d.target.dev == disk.target.dev)
                    .ok_or_else(|| EngineError::not_found("device", disk.target.dev.clone()))?;
                *slot = disk;
            }
            "graphics" => {
                let graphics: GraphicsDevice = parse_fragment(device_xml)?;
                let slot = dom
                    .descriptor
                    .devices
                    .graphics
                    .iter_mut()
                    .find(|g| g.kind == graphics.kind)
                    .ok_or_else(|| EngineError::not_found("device", graphics.kind.clone()))?;
                *slot = graphics;
            }
            other => {
                return Err(EngineError::Unsupported(format!(
                    "in-place update of '{other}' devices"
                )))
            }
        }
        Ok(())
    }

    async fn set_vcpus_live(&self, name: &str, count: u32) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running"
            )));
        }
        dom.descriptor.vcpu.current = Some(count);
        Ok(())
    }

    async fn domain_metadata(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        Ok(dom.metadata.get(&format!("{namespace}#{key}")).cloned())
    }

    async fn set_domain_metadata(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        fragment_xml: Option<&str>,
    ) -> Result<()> {
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        let full_key = format!("{namespace}#{key}");
        match fragment_xml {
            Some(xml) => {
                dom.metadata.insert(full_key, xml.to_string());
            }
            None => {
                dom.metadata.remove(&full_key);
            }
        }
        Ok(())
    }

    async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotRecord>> {
        self.snapshots_off()?;
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        Ok(dom.snapshots.clone())
    }

    async fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()> {
        self.snapshots_off()?;
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if dom.snapshots.iter().any(|s| s.name == snapshot_name) {
            return Err(EngineError::InvalidParameter(format!(
                "snapshot '{snapshot_name}' already exists"
            )));
        }
        let parent = dom
            .snapshots
            .iter()
            .find(|s| s.current)
            .map(|s| s.name.clone());
        for s in dom.snapshots.iter_mut() {
            s.current = false;
        }
        let created = chrono::Utc::now().timestamp();
        let doc = SnapshotDoc {
            name: snapshot_name.to_string(),
            parent: parent.clone().map(|name| SnapshotParentDoc { name }),
            creation_time: created,
        };
        let xml = quick_xml::se::to_string(&doc)
            .map_err(|e| EngineError::failed("snapshot serialize", e))?;
        dom.snapshots.push(SnapshotRecord {
            name: snapshot_name.to_string(),
            parent,
            current: true,
            created,
            xml,
        });
        Ok(())
    }

    async fn redefine_snapshot(&self, name: &str, xml: &str, current: bool) -> Result<()> {
        self.snapshots_off()?;
        let doc: SnapshotDoc = quick_xml::de::from_str(xml)
            .map_err(|e| EngineError::failed("snapshot parse", e))?;
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if current {
            for s in dom.snapshots.iter_mut() {
                s.current = false;
            }
        }
        dom.snapshots.retain(|s| s.name != doc.name);
        dom.snapshots.push(SnapshotRecord {
            name: doc.name,
            parent: doc.parent.map(|p| p.name),
            current,
            created: doc.creation_time,
            xml: xml.to_string(),
        });
        Ok(())
    }

    async fn delete_snapshot(
        &self,
        name: &str,
        snapshot_name: &str,
        children: bool,
        _metadata_only: bool,
    ) -> Result<()> {
        self.snapshots_off()?;
        let mut domains = self.domains.write().await;
        let dom = domains.get_mut(name).ok_or_else(|| domain_not_found(name))?;
        if !dom.snapshots.iter().any(|s| s.name == snapshot_name) {
            return Err(EngineError::not_found("snapshot", snapshot_name));
        }
        let mut doomed = vec![snapshot_name.to_string()];
        if children {
            // Walk the subtree.
            let mut i = 0;
            while i < doomed.len() {
                let parent = doomed[i].clone();
                for s in dom.snapshots.iter() {
                    if s.parent.as_deref() == Some(parent.as_str()) {
                        doomed.push(s.name.clone());
                    }
                }
                i += 1;
            }
        }
        let was_current = dom
            .snapshots
            .iter()
            .any(|s| s.current && doomed.contains(&s.name));
        let orphan_parent = dom
            .snapshots
            .iter()
            .find(|s| s.name == snapshot_name)
            .and_then(|s| s.parent.clone());
        dom.snapshots.retain(|s| !doomed.contains(&s.name));
        if !children {
            // Children of the deleted snapshot reparent onto its parent.
            for s in dom.snapshots.iter_mut() {
                if s.parent.as_deref() == Some(snapshot_name) {
                    s.parent = orphan_parent.clone();
                }
            }
        }
        if was_current {
            if let Some(p) = orphan_parent {
                for s in dom.snapshots.iter_mut() {
                    if s.name == p {
                        s.current = true;
                    }
                }
            }
        }
        Ok(())
    }

    async fn interface_counters(&self, name: &str, dev: &str) -> Result<InterfaceCounters> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        Ok(dom.net_counters.get(dev).copied().unwrap_or_default())
    }

    async fn block_counters(&self, name: &str, dev: &str) -> Result<BlockCounters> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        Ok(dom.block_counters.get(dev).copied().unwrap_or_default())
    }

    async fn screenshot(&self, name: &str) -> Result<Vec<u8>> {
        let domains = self.domains.read().await;
        let dom = domains.get(name).ok_or_else(|| domain_not_found(name))?;
        if !dom.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "domain '{name}' is not running"
            )));
        }
        // Minimal 1x1 PPM.
        Ok(b"P6\n1 1\n255\n\x00\x00\x00".to_vec())
    }

    async fn hypervisor_max_vcpus(&self) -> Result<u32> {
        Ok(*self.max_vcpus.read().await)
    }

    async fn supports_memory_hotplug(&self) -> Result<bool> {
        Ok(*self.mem_hotplug.read().await)
    }

    async fn stream_protocols(&self) -> Result<Vec<String>> {
        Ok(vec!["vnc".to_string(), "spice".to_string()])
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn pool_state(&self, pool: &str) -> Result<PoolState> {
        let pools = self.pools.read().await;
        let p = pools.get(pool).ok_or_else(|| pool_not_found(pool))?;
        Ok(PoolState {
            name: pool.to_string(),
            kind: p.kind,
            capacity: p.capacity,
            available: p.available(),
            active: p.active,
        })
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>> {
        let pools = self.pools.read().await;
        let p = pools.get(pool).ok_or_else(|| pool_not_found(pool))?;
        let mut names: Vec<String> = p.volumes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn volume_record(&self, pool: &str, volume: &str) -> Result<VolumeRecord> {
        let pools = self.pools.read().await;
        let p = pools.get(pool).ok_or_else(|| pool_not_found(pool))?;
        p.volumes
            .get(volume)
            .cloned()
            .ok_or_else(|| EngineError::not_found("volume", volume))
    }

    async fn volume_by_path(&self, path: &str) -> Result<VolumeRecord> {
        let pools = self.pools.read().await;
        for p in pools.values() {
            if let Some(v) = p.volumes.values().find(|v| v.path == path) {
                return Ok(v.clone());
            }
        }
        Err(EngineError::not_found("volume", path))
    }

    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeRecord> {
        if self.fail_next_volume_create.swap(false, Ordering::SeqCst) {
            return Err(EngineError::failed("volume create", "injected failure"));
        }
        let mut pools = self.pools.write().await;
        let p = pools.get_mut(pool).ok_or_else(|| pool_not_found(pool))?;
        if !p.kind.supports_volume_create() {
            return Err(EngineError::InvalidOperation(format!(
                "pool '{pool}' ({}) does not allow volume creation",
                p.kind
            )));
        }
        if p.volumes.contains_key(&spec.name) {
            return Err(EngineError::InvalidParameter(format!(
                "volume '{}' already exists in pool '{pool}'",
                spec.name
            )));
        }
        if spec.capacity > p.available() {
            return Err(EngineError::failed(
                "volume create",
                format!("pool '{pool}' has insufficient space"),
            ));
        }
        p.used += spec.capacity;
        let record = VolumeRecord {
            name: spec.name.clone(),
            pool: pool.to_string(),
            path: format!("/var/lib/verdin/pools/{pool}/{}", spec.name),
            capacity: spec.capacity,
            allocation: spec.capacity,
            format: spec.format.clone(),
        };
        p.volumes.insert(spec.name.clone(), record.clone());
        debug!(pool = %pool, volume = %spec.name, "created volume");
        Ok(record)
    }

    async fn clone_volume(
        &self,
        src_pool: &str,
        src_volume: &str,
        dest_pool: &str,
        dest_name: &str,
    ) -> Result<VolumeRecord> {
        let src = self.volume_record(src_pool, src_volume).await?;
        let spec = VolumeSpec {
            name: dest_name.to_string(),
            capacity: src.capacity,
            format: src.format.clone(),
        };
        self.create_volume(dest_pool, &spec).await
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        let p = pools.get_mut(pool).ok_or_else(|| pool_not_found(pool))?;
        if p.kind.is_read_only() {
            return Err(EngineError::InvalidOperation(format!(
                "pool '{pool}' ({}) is read-only",
                p.kind
            )));
        }
        let record = p
            .volumes
            .remove(volume)
            .ok_or_else(|| EngineError::not_found("volume", volume))?;
        p.used = p.used.saturating_sub(record.capacity);
        debug!(pool = %pool, volume = %volume, "deleted volume");
        Ok(())
    }
}

fn remove_first<T>(items: &mut Vec<T>, pred: impl Fn(&T) -> bool) -> bool {
    if let Some(pos) = items.iter().position(pred) {
        items.remove(pos);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{SizedElement, VcpuElement};

    fn descriptor(name: &str) -> DomainDescriptor {
        DomainDescriptor {
            virt_type: "kvm".to_string(),
            name: name.to_string(),
            uuid: None,
            memory: SizedElement::kib(1024 * 1024),
            current_memory: Some(SizedElement::kib(1024 * 1024)),
            max_memory: None,
            vcpu: VcpuElement::new(2),
            cpu: None,
            os: None,
            devices: Default::default(),
        }
    }

    async fn define(driver: &MockDriver, name: &str) {
        driver
            .define_domain(&descriptor(name).to_xml().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn define_start_destroy() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        assert!(driver.domain_exists("vm1").await.unwrap());
        driver.start_domain("vm1").await.unwrap();
        let info = driver.domain_info("vm1").await.unwrap();
        assert_eq!(info.state, DomainState::Running);
        assert!(driver.start_domain("vm1").await.is_err());
        driver.destroy_domain("vm1").await.unwrap();
        assert_eq!(
            driver.domain_info("vm1").await.unwrap().state,
            DomainState::Shutoff
        );
    }

    #[tokio::test]
    async fn undefine_refuses_running() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        driver.start_domain("vm1").await.unwrap();
        let err = driver.undefine_domain("vm1").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
        driver.destroy_domain("vm1").await.unwrap();
        driver.undefine_domain("vm1").await.unwrap();
        assert!(!driver.domain_exists("vm1").await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_tree_and_subtree_delete() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        driver.create_snapshot("vm1", "a").await.unwrap();
        driver.create_snapshot("vm1", "b").await.unwrap();
        driver.create_snapshot("vm1", "c").await.unwrap();
        let snaps = driver.list_snapshots("vm1").await.unwrap();
        assert_eq!(snaps.len(), 3);
        let b = snaps.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(b.parent.as_deref(), Some("a"));
        assert!(snaps.iter().find(|s| s.name == "c").unwrap().current);

        driver.delete_snapshot("vm1", "b", true, true).await.unwrap();
        let snaps = driver.list_snapshots("vm1").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].current, "parent becomes current after subtree delete");
    }

    #[tokio::test]
    async fn snapshot_redefine_round_trip() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        driver.create_snapshot("vm1", "base").await.unwrap();
        let snaps = driver.list_snapshots("vm1").await.unwrap();

        define(&driver, "vm2").await;
        driver
            .redefine_snapshot("vm2", &snaps[0].xml, snaps[0].current)
            .await
            .unwrap();
        let moved = driver.list_snapshots("vm2").await.unwrap();
        assert_eq!(moved[0].name, "base");
        assert!(moved[0].current);
    }

    #[tokio::test]
    async fn disabled_snapshots_report_unsupported() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        driver.disable_snapshots();
        let err = driver.list_snapshots("vm1").await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[tokio::test]
    async fn pool_capacity_accounting() {
        let driver = MockDriver::new();
        let gib = 1024 * 1024 * 1024u64;
        driver.add_pool("small", PoolKind::Dir, 2 * gib).await;
        let spec = VolumeSpec { name: "a.img".into(), capacity: gib, format: "qcow2".into() };
        driver.create_volume("small", &spec).await.unwrap();
        let state = driver.pool_state("small").await.unwrap();
        assert_eq!(state.available, gib);

        let too_big =
            VolumeSpec { name: "b.img".into(), capacity: 2 * gib, format: "qcow2".into() };
        assert!(driver.create_volume("small", &too_big).await.is_err());

        driver.delete_volume("small", "a.img").await.unwrap();
        assert_eq!(driver.pool_state("small").await.unwrap().available, 2 * gib);
    }

    #[tokio::test]
    async fn readonly_pool_refuses_writes() {
        let driver = MockDriver::new();
        driver.add_pool("luns", PoolKind::Iscsi, 0).await;
        let spec = VolumeSpec { name: "x".into(), capacity: 1, format: "raw".into() };
        assert!(driver.create_volume("luns", &spec).await.is_err());
        assert!(driver.delete_volume("luns", "x").await.is_err());
    }

    #[tokio::test]
    async fn attach_and_detach_disk() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        let disk = "<disk type=\"file\" device=\"disk\">\
            <source file=\"/tmp/extra.qcow2\"/>\
            <target dev=\"hdb\" bus=\"ide\"/></disk>";
        driver
            .attach_device("vm1", disk, DeviceFlags::PERSISTENT_ONLY)
            .await
            .unwrap();
        let xml = driver.domain_xml("vm1").await.unwrap();
        let desc = DomainDescriptor::parse(&xml).unwrap();
        assert!(desc.find_disk("hdb").is_some());

        driver
            .detach_device("vm1", disk, DeviceFlags::PERSISTENT_ONLY)
            .await
            .unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert!(desc.find_disk("hdb").is_none());
    }

    #[tokio::test]
    async fn hot_attach_requires_running() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        let dimm = quick_xml::se::to_string(&MemoryDevice::dimm_1gib()).unwrap();
        let err = driver
            .attach_device("vm1", &dimm, DeviceFlags { live: true, persistent: true })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        driver
            .set_domain_metadata("vm1", "urn:verdin:1.0", "os", Some("<os distro=\"f\" version=\"1\"/>"))
            .await
            .unwrap();
        let got = driver
            .domain_metadata("vm1", "urn:verdin:1.0", "os")
            .await
            .unwrap();
        assert!(got.unwrap().contains("distro"));
        driver
            .set_domain_metadata("vm1", "urn:verdin:1.0", "os", None)
            .await
            .unwrap();
        assert!(driver
            .domain_metadata("vm1", "urn:verdin:1.0", "os")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn counters_reset_on_stop() {
        let driver = MockDriver::new();
        define(&driver, "vm1").await;
        driver.start_domain("vm1").await.unwrap();
        driver.add_net_traffic("vm1", "vnet0", 1000, 500).await;
        let c = driver.interface_counters("vm1", "vnet0").await.unwrap();
        assert_eq!(c.rx_bytes, 1000);
        driver.destroy_domain("vm1").await.unwrap();
        let c = driver.interface_counters("vm1", "vnet0").await.unwrap();
        assert_eq!(c.rx_bytes, 0);
    }
}
