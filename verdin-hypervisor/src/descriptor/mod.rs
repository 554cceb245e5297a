//! Typed domain descriptor tree.
//!
//! The descriptor is the structured document a driver understands (a libvirt
//! domain definition). Every mutation path in the engine goes through this
//! module instead of editing XML strings in place: the tree is parsed with
//! quick-xml, edited through typed fields or the named paths in
//! [`fields::DescriptorField`], and serialized back.

mod fields;
mod metadata;

pub use fields::DescriptorField;
pub use metadata::{
    fragment_from_xml, fragment_to_xml, AccessMetadata, NameMetadata, OsMetadata,
    METADATA_NAMESPACE, METADATA_KEY_ACCESS, METADATA_KEY_NAME, METADATA_KEY_OS,
};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

fn default_virt_type() -> String {
    "kvm".to_string()
}

fn default_unit() -> String {
    "KiB".to_string()
}

/// A sized element carrying a value and a unit attribute, e.g.
/// `<memory unit='KiB'>1048576</memory>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizedElement {
    #[serde(rename = "@unit", default = "default_unit")]
    pub unit: String,
    #[serde(rename = "$text")]
    pub value: u64,
}

impl SizedElement {
    pub fn kib(value: u64) -> Self {
        Self { unit: default_unit(), value }
    }
}

/// `<maxMemory slots='N' unit='KiB'>...</maxMemory>` - the memory hotplug
/// ceiling and the number of DIMM slots available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxMemoryElement {
    #[serde(rename = "@slots")]
    pub slots: u32,
    #[serde(rename = "@unit", default = "default_unit")]
    pub unit: String,
    #[serde(rename = "$text")]
    pub value: u64,
}

/// `<vcpu placement='static' current='N'>M</vcpu>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuElement {
    #[serde(rename = "@placement", skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(rename = "@current", skip_serializing_if = "Option::is_none")]
    pub current: Option<u32>,
    #[serde(rename = "$text")]
    pub count: u32,
}

impl VcpuElement {
    pub fn new(count: u32) -> Self {
        Self { placement: Some("static".to_string()), current: None, count }
    }
}

/// Explicit socket/core/thread layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTopology {
    #[serde(rename = "@sockets")]
    pub sockets: u32,
    #[serde(rename = "@cores")]
    pub cores: u32,
    #[serde(rename = "@threads")]
    pub threads: u32,
}

impl CpuTopology {
    /// Total vCPUs implied by the topology.
    pub fn total_vcpus(&self) -> u32 {
        self.sockets * self.cores * self.threads
    }

    /// vCPUs contributed by one socket.
    pub fn vcpus_per_socket(&self) -> u32 {
        self.cores * self.threads
    }
}

/// `<cpu>` element; only the pieces the engine edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuElement {
    #[serde(rename = "@mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<CpuTopology>,
}

/// `<os><type arch=... machine=...>hvm</type><boot dev=.../></os>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsElement {
    #[serde(rename = "type")]
    pub os_type: OsType,
    #[serde(rename = "boot", default, skip_serializing_if = "Vec::is_empty")]
    pub boot: Vec<BootDev>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsType {
    #[serde(rename = "@arch", skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(rename = "@machine", skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootDev {
    #[serde(rename = "@dev")]
    pub dev: String,
}

// =============================================================================
// DEVICES
// =============================================================================

/// `<devices>` container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Devices {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
    #[serde(rename = "disk", default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskDevice>,
    #[serde(rename = "interface", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceDevice>,
    #[serde(rename = "graphics", default, skip_serializing_if = "Vec::is_empty")]
    pub graphics: Vec<GraphicsDevice>,
    #[serde(rename = "video", default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<VideoDevice>,
    #[serde(rename = "hostdev", default, skip_serializing_if = "Vec::is_empty")]
    pub hostdevs: Vec<HostdevDevice>,
    #[serde(rename = "memory", default, skip_serializing_if = "Vec::is_empty")]
    pub memory_devices: Vec<MemoryDevice>,
    #[serde(rename = "cpusocket", default, skip_serializing_if = "Vec::is_empty")]
    pub cpu_sockets: Vec<CpuSocketDevice>,
}

/// Disk source type (`<disk type='...'>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskSourceType {
    File,
    Block,
    Network,
}

impl DiskSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskSourceType::File => "file",
            DiskSourceType::Block => "block",
            DiskSourceType::Network => "network",
        }
    }
}

/// Disk role (`<disk device='...'>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskRole {
    Disk,
    Cdrom,
}

impl DiskRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskRole::Disk => "disk",
            DiskRole::Cdrom => "cdrom",
        }
    }
}

/// Disk bus. Only `scsi` and `virtio` support hotplug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Whether devices on this bus can be attached to a running VM.
    pub fn supports_hotplug(&self) -> bool {
        matches!(self, DiskBus::Scsi | DiskBus::Virtio)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDriver {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@type")]
    pub format: String,
}

impl DiskDriver {
    pub fn qemu(format: impl Into<String>) -> Self {
        Self { name: "qemu".to_string(), format: format.into() }
    }
}

/// Disk source; exactly one of the location attributes is set depending on
/// the source type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSource {
    #[serde(rename = "@file", skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "@dev", skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    #[serde(rename = "@protocol", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "@name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "host", skip_serializing_if = "Option::is_none")]
    pub host: Option<DiskSourceHost>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSourceHost {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@port")]
    pub port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
    #[serde(rename = "@bus")]
    pub bus: DiskBus,
}

/// `<address type='drive' .../>` for buses with fixed slot layouts (IDE).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveAddress {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@controller")]
    pub controller: String,
    #[serde(rename = "@bus")]
    pub bus: String,
    #[serde(rename = "@target")]
    pub target: String,
    #[serde(rename = "@unit")]
    pub unit: String,
}

/// Presence-only element, e.g. `<readonly/>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "disk")]
pub struct DiskDevice {
    #[serde(rename = "@type")]
    pub source_type: DiskSourceType,
    #[serde(rename = "@device")]
    pub role: DiskRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<DiskDriver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DiskSource>,
    pub target: DiskTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<DriveAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<Presence>,
}

impl DiskDevice {
    /// The source path, for file- and block-backed disks.
    pub fn source_path(&self) -> Option<&str> {
        let source = self.source.as_ref()?;
        source.file.as_deref().or(source.dev.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "interface")]
pub struct InterfaceDevice {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<MacAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<InterfaceSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<InterfaceModel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<InterfaceTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddress {
    #[serde(rename = "@address")]
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSource {
    #[serde(rename = "@bridge", skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    #[serde(rename = "@network", skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceModel {
    #[serde(rename = "@type")]
    pub kind: String,
}

/// `<target dev='vnetN'/>` - the host-side device the counters hang off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceTarget {
    #[serde(rename = "@dev")]
    pub dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "graphics")]
pub struct GraphicsDevice {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@port", skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(rename = "@autoport", skip_serializing_if = "Option::is_none")]
    pub autoport: Option<String>,
    #[serde(rename = "@listen", skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(rename = "@passwd", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "@passwdValidTo", skip_serializing_if = "Option::is_none")]
    pub password_valid_to: Option<String>,
}

impl GraphicsDevice {
    pub fn vnc() -> Self {
        Self {
            kind: "vnc".to_string(),
            port: Some(-1),
            autoport: Some("yes".to_string()),
            listen: Some("127.0.0.1".to_string()),
            password: None,
            password_valid_to: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoDevice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<VideoModel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoModel {
    #[serde(rename = "@type")]
    pub kind: String,
}

/// Host device passthrough fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "hostdev")]
pub struct HostdevDevice {
    #[serde(rename = "@mode")]
    pub mode: String,
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "@managed", skip_serializing_if = "Option::is_none")]
    pub managed: Option<String>,
    #[serde(rename = "@sgio", skip_serializing_if = "Option::is_none")]
    pub sgio: Option<String>,
    pub source: HostdevSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<HostdevDriver>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevSource {
    #[serde(rename = "@startupPolicy", skip_serializing_if = "Option::is_none")]
    pub startup_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<HostdevAdapter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<HostdevId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<HostdevId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<HostdevAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevAdapter {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevId {
    #[serde(rename = "@id")]
    pub id: String,
}

/// Address element shared by PCI/SCSI/USB hostdev sources; unused fields
/// stay `None` for a given device type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevAddress {
    #[serde(rename = "@type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "@domain", skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "@bus", skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    #[serde(rename = "@slot", skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(rename = "@function", skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(rename = "@target", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "@unit", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "@device", skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostdevDriver {
    #[serde(rename = "@name")]
    pub name: String,
}

/// Memory DIMM module for memory hot-add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "memory")]
pub struct MemoryDevice {
    #[serde(rename = "@model")]
    pub model: String,
    pub target: MemoryDeviceTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDeviceTarget {
    pub size: SizedElement,
    pub node: u32,
}

impl MemoryDevice {
    /// A 1 GiB DIMM on NUMA node 0, the unit of memory hot-add.
    pub fn dimm_1gib() -> Self {
        Self {
            model: "dimm".to_string(),
            target: MemoryDeviceTarget {
                size: SizedElement::kib(1024 * 1024),
                node: 0,
            },
        }
    }
}

/// CPU socket device used for vCPU hot-add/remove on topology-constrained
/// guests. Transient: dropped from the persistent descriptor after each
/// live CPU change so a later boot does not race the socket driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "cpusocket")]
pub struct CpuSocketDevice {
    #[serde(rename = "@id")]
    pub id: u32,
}

// =============================================================================
// DOMAIN DESCRIPTOR
// =============================================================================

/// The full domain descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "domain")]
pub struct DomainDescriptor {
    #[serde(rename = "@type", default = "default_virt_type")]
    pub virt_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub memory: SizedElement,
    #[serde(rename = "currentMemory", skip_serializing_if = "Option::is_none")]
    pub current_memory: Option<SizedElement>,
    #[serde(rename = "maxMemory", skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<MaxMemoryElement>,
    pub vcpu: VcpuElement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsElement>,
    #[serde(default)]
    pub devices: Devices,
}

impl DomainDescriptor {
    /// Parse a descriptor from XML.
    pub fn parse(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml)
            .map_err(|e| EngineError::failed("descriptor parse", e))
    }

    /// Serialize the descriptor to XML.
    pub fn to_xml(&self) -> Result<String> {
        quick_xml::se::to_string(self)
            .map_err(|e| EngineError::failed("descriptor serialize", e))
    }

    /// Stable checksum of the serialized form, for change detection.
    pub fn checksum(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.to_xml().unwrap_or_default().hash(&mut hasher);
        hasher.finish()
    }

    /// The explicit CPU topology, if one is defined.
    pub fn topology(&self) -> Option<CpuTopology> {
        self.cpu.as_ref().and_then(|c| c.topology)
    }

    /// Memory size in MiB (descriptor stores KiB).
    pub fn memory_mib(&self) -> u64 {
        self.memory.value / 1024
    }

    /// Set memory and currentMemory together, in MiB.
    pub fn set_memory_mib(&mut self, mib: u64) {
        self.memory = SizedElement::kib(mib * 1024);
        self.current_memory = Some(SizedElement::kib(mib * 1024));
    }

    /// Target device names already in use by disks and CD-ROMs.
    pub fn disk_targets(&self) -> Vec<&str> {
        self.devices.disks.iter().map(|d| d.target.dev.as_str()).collect()
    }

    /// Find a disk by its target device name.
    pub fn find_disk(&self, dev: &str) -> Option<&DiskDevice> {
        self.devices.disks.iter().find(|d| d.target.dev == dev)
    }

    /// Source paths of all ISO files attached to CD-ROM devices.
    pub fn cdrom_iso_paths(&self) -> Vec<&str> {
        self.devices
            .disks
            .iter()
            .filter(|d| d.role == DiskRole::Cdrom)
            .filter_map(|d| d.source_path())
            .collect()
    }

    /// Source paths of all regular (non-CD-ROM) disks.
    pub fn disk_paths(&self) -> Vec<&str> {
        self.devices
            .disks
            .iter()
            .filter(|d| d.role == DiskRole::Disk)
            .filter_map(|d| d.source_path())
            .collect()
    }

    /// Whether a video device is present (screenshots need one).
    pub fn has_video(&self) -> bool {
        !self.devices.videos.is_empty()
    }

    /// The primary graphics device, if any.
    pub fn primary_graphics(&self) -> Option<&GraphicsDevice> {
        self.devices.graphics.first()
    }

    pub fn primary_graphics_mut(&mut self) -> Option<&mut GraphicsDevice> {
        self.devices.graphics.first_mut()
    }

    /// MAC addresses of all interfaces.
    pub fn mac_addresses(&self) -> Vec<&str> {
        self.devices
            .interfaces
            .iter()
            .filter_map(|i| i.mac.as_ref().map(|m| m.address.as_str()))
            .collect()
    }
}

/// Serialize a single device to the fragment XML drivers accept for
/// attach/detach/update.
pub fn device_to_xml<T: Serialize>(device: &T) -> Result<String> {
    quick_xml::se::to_string(device).map_err(|e| EngineError::failed("device serialize", e))
}

/// Random MAC in the QEMU/KVM locally administered prefix.
pub fn generate_mac_address() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DomainDescriptor {
        DomainDescriptor {
            virt_type: "kvm".to_string(),
            name: "test-vm".to_string(),
            uuid: Some("6a3d5a6a-46a4-4a2f-ae8a-0c8f66ad82f0".to_string()),
            memory: SizedElement::kib(1024 * 1024),
            current_memory: Some(SizedElement::kib(1024 * 1024)),
            max_memory: None,
            vcpu: VcpuElement::new(2),
            cpu: Some(CpuElement {
                mode: Some("host-model".to_string()),
                topology: Some(CpuTopology { sockets: 1, cores: 2, threads: 1 }),
            }),
            os: Some(OsElement {
                os_type: OsType {
                    arch: Some("x86_64".to_string()),
                    machine: Some("q35".to_string()),
                    value: "hvm".to_string(),
                },
                boot: vec![BootDev { dev: "hd".to_string() }],
            }),
            devices: Devices {
                disks: vec![DiskDevice {
                    source_type: DiskSourceType::File,
                    role: DiskRole::Disk,
                    driver: Some(DiskDriver::qemu("qcow2")),
                    source: Some(DiskSource {
                        file: Some("/var/lib/verdin/images/test.qcow2".to_string()),
                        ..Default::default()
                    }),
                    target: DiskTarget { dev: "hda".to_string(), bus: DiskBus::Ide },
                    address: None,
                    readonly: None,
                }],
                graphics: vec![GraphicsDevice::vnc()],
                ..Default::default()
            },
        }
    }

    #[test]
    fn round_trip_preserves_descriptor() {
        let desc = sample();
        let xml = desc.to_xml().unwrap();
        let parsed = DomainDescriptor::parse(&xml).unwrap();
        assert_eq!(desc, parsed);
    }

    #[test]
    fn checksum_changes_with_name() {
        let desc = sample();
        let before = desc.checksum();
        let mut renamed = desc.clone();
        renamed.name = "other-vm".to_string();
        assert_ne!(before, renamed.checksum());
        assert_eq!(before, desc.checksum());
    }

    #[test]
    fn topology_arithmetic() {
        let topo = CpuTopology { sockets: 2, cores: 2, threads: 2 };
        assert_eq!(topo.total_vcpus(), 8);
        assert_eq!(topo.vcpus_per_socket(), 4);
    }

    #[test]
    fn disk_helpers() {
        let desc = sample();
        assert_eq!(desc.disk_paths(), vec!["/var/lib/verdin/images/test.qcow2"]);
        assert!(desc.cdrom_iso_paths().is_empty());
        assert_eq!(desc.disk_targets(), vec!["hda"]);
        assert!(desc.find_disk("hda").is_some());
        assert!(desc.find_disk("hdb").is_none());
    }
}
