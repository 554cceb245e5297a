//! VM templates.
//!
//! A template is the recipe `create` renders into a domain descriptor:
//! CPU and memory sizing, disk declarations resolved to volumes at create
//! time, an optional install medium, and metadata hints. The catalog is a
//! plain in-memory registry; template CRUD has no surface of its own here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use verdin_hypervisor::descriptor::{
    BootDev, CpuElement, CpuTopology, Devices, DiskBus, DiskDevice, DiskDriver, DiskRole,
    DiskSource, DiskSourceType, DiskTarget, DomainDescriptor, GraphicsDevice,
    InterfaceDevice, InterfaceModel, InterfaceSource, MacAddress, MaxMemoryElement,
    OsElement, OsType, Presence, SizedElement, VcpuElement, VideoDevice, VideoModel,
    generate_mac_address,
};
use verdin_hypervisor::error::{EngineError, Result};
use verdin_hypervisor::{Capabilities, VolumeRecord};

/// One disk the template provisions at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDisk {
    pub pool: String,
    pub size_gib: u64,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "qcow2".to_string()
}

fn default_graphics() -> String {
    "vnc".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub name: String,
    pub cpus: u32,
    #[serde(default)]
    pub topology: Option<CpuTopology>,
    pub memory_mib: u64,
    /// Hotplug ceiling; defaults to 4x memory when omitted.
    #[serde(default)]
    pub max_memory_mib: Option<u64>,
    #[serde(default)]
    pub disks: Vec<TemplateDisk>,
    /// Install medium attached as a read-only CD-ROM.
    #[serde(default)]
    pub cdrom: Option<String>,
    /// Whether the install medium is streamed from a remote source and
    /// needs a display protocol on the host.
    #[serde(default)]
    pub iso_stream: bool,
    #[serde(default = "default_graphics")]
    pub graphics: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub os_distro: Option<String>,
    #[serde(default)]
    pub os_version: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

impl VmTemplate {
    /// Template-level checks run before any provisioning.
    pub fn validate(&self, caps: &Capabilities) -> Result<()> {
        if self.cpus == 0 {
            return Err(EngineError::InvalidParameter(
                "template cpus must be greater than zero".to_string(),
            ));
        }
        if self.cpus > caps.max_vcpus {
            return Err(EngineError::InvalidParameter(format!(
                "template asks for {} vcpus, host maximum is {}",
                self.cpus, caps.max_vcpus
            )));
        }
        if let Some(topo) = &self.topology {
            if topo.total_vcpus() != self.cpus {
                return Err(EngineError::InvalidParameter(format!(
                    "topology implies {} vcpus but template declares {}",
                    topo.total_vcpus(),
                    self.cpus
                )));
            }
        }
        if self.iso_stream && caps.stream_protocols.is_empty() {
            return Err(EngineError::InvalidOperation(
                "template streams its install medium but the host supports no display protocol".to_string(),
            ));
        }
        Ok(())
    }

    /// Render the descriptor for a new VM. `volumes` are the provisioned
    /// disk volumes, in template disk order.
    pub fn render_descriptor(
        &self,
        vm_name: &str,
        uuid: &str,
        volumes: &[VolumeRecord],
    ) -> DomainDescriptor {
        let memory_kib = self.memory_mib * 1024;
        let max_memory = self.max_memory_mib.unwrap_or(self.memory_mib * 4);

        let mut devices = Devices::default();
        for (i, vol) in volumes.iter().enumerate() {
            devices.disks.push(DiskDevice {
                source_type: DiskSourceType::File,
                role: DiskRole::Disk,
                driver: Some(DiskDriver::qemu(vol.format.clone())),
                source: Some(DiskSource { file: Some(vol.path.clone()), ..Default::default() }),
                target: DiskTarget {
                    dev: format!("vd{}", (b'a' + i as u8) as char),
                    bus: DiskBus::Virtio,
                },
                address: None,
                readonly: None,
            });
        }
        if let Some(iso) = &self.cdrom {
            devices.disks.push(DiskDevice {
                source_type: DiskSourceType::File,
                role: DiskRole::Cdrom,
                driver: Some(DiskDriver::qemu("raw")),
                source: Some(DiskSource { file: Some(iso.clone()), ..Default::default() }),
                target: DiskTarget { dev: "hda".to_string(), bus: DiskBus::Ide },
                address: None,
                readonly: Some(Presence {}),
            });
        }
        for net in &self.networks {
            devices.interfaces.push(InterfaceDevice {
                kind: "network".to_string(),
                mac: Some(MacAddress { address: generate_mac_address() }),
                source: Some(InterfaceSource {
                    network: Some(net.clone()),
                    ..Default::default()
                }),
                model: Some(InterfaceModel { kind: "virtio".to_string() }),
                target: None,
            });
        }
        let mut graphics = GraphicsDevice::vnc();
        graphics.kind = self.graphics.clone();
        devices.graphics.push(graphics);
        devices.videos.push(VideoDevice {
            model: Some(VideoModel { kind: "vga".to_string() }),
        });

        DomainDescriptor {
            virt_type: "kvm".to_string(),
            name: vm_name.to_string(),
            uuid: Some(uuid.to_string()),
            memory: SizedElement::kib(memory_kib),
            current_memory: Some(SizedElement::kib(memory_kib)),
            max_memory: Some(MaxMemoryElement {
                slots: 32,
                unit: "KiB".to_string(),
                value: max_memory * 1024,
            }),
            vcpu: VcpuElement::new(self.cpus),
            cpu: self.topology.map(|topology| CpuElement {
                mode: Some("host-model".to_string()),
                topology: Some(topology),
            }),
            os: Some(OsElement {
                os_type: OsType {
                    arch: Some("x86_64".to_string()),
                    machine: Some("q35".to_string()),
                    value: "hvm".to_string(),
                },
                boot: vec![
                    BootDev { dev: "hd".to_string() },
                    BootDev { dev: "cdrom".to_string() },
                ],
            }),
            devices,
        }
    }
}

/// In-memory template registry.
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, VmTemplate>>,
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self { templates: RwLock::new(HashMap::new()) }
    }

    pub async fn add(&self, template: VmTemplate) {
        self.templates
            .write()
            .await
            .insert(template.name.clone(), template);
    }

    pub async fn get(&self, name: &str) -> Result<VmTemplate> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found("template", name))
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.templates.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
