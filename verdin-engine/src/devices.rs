//! Device attachment manager.
//!
//! Builds minimal descriptor fragments from typed parameters and drives
//! attach/detach/update through the driver with flags derived from the VM
//! state. Disk target names are assigned here, never by callers.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use verdin_hypervisor::descriptor::{
    device_to_xml, DiskBus, DiskDevice, DiskDriver, DiskRole, DiskSource, DiskSourceType,
    DiskTarget, DomainDescriptor, DriveAddress, HostdevAddress, HostdevDevice,
    HostdevDriver, HostdevId, HostdevSource, Presence,
};
use verdin_hypervisor::error::{EngineError, Result};
use verdin_hypervisor::{DeviceFlags, VirtDriver};

use crate::objstore::ObjectStore;
use crate::rollback::RollbackContext;

/// IDE controller 0 offers exactly four slots.
const IDE_SLOTS: [(u8, u8); 4] = [(0, 0), (0, 1), (1, 0), (1, 1)];

/// Request to attach a disk or CD-ROM.
#[derive(Debug, Clone)]
pub struct DiskAttachRequest {
    pub path: String,
    pub source_type: DiskSourceType,
    pub role: DiskRole,
    /// Default: IDE for CD-ROMs, virtio for disks.
    pub bus: Option<DiskBus>,
    pub format: Option<String>,
}

/// PCI address of a host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u32,
    pub slot: u32,
    pub function: u32,
}

impl PciAddress {
    /// Node device name, deduced from the address.
    pub fn node_name(&self) -> String {
        format!(
            "pci_{:04x}_{:02x}_{:02x}_{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }

    fn to_hostdev_address(self) -> HostdevAddress {
        HostdevAddress {
            kind: Some("pci".to_string()),
            domain: Some(format!("{:#06x}", self.domain)),
            bus: Some(format!("{:#04x}", self.bus)),
            slot: Some(format!("{:#04x}", self.slot)),
            function: Some(format!("{:#x}", self.function)),
            ..Default::default()
        }
    }
}

pub struct DevicesModel {
    driver: Arc<dyn VirtDriver>,
    store: Arc<ObjectStore>,
    /// Whether the host kernel offers the vfio passthrough driver.
    vfio: bool,
}

impl DevicesModel {
    pub fn new(driver: Arc<dyn VirtDriver>, store: Arc<ObjectStore>, vfio: bool) -> Self {
        Self { driver, store, vfio }
    }

    async fn descriptor_and_running(&self, vm: &str) -> Result<(DomainDescriptor, bool)> {
        let info = self.driver.domain_info(vm).await?;
        let descriptor = DomainDescriptor::parse(&self.driver.domain_xml(vm).await?)?;
        Ok((descriptor, info.state.is_running()))
    }

    /// First free target name for a bus, past every name already in use.
    fn next_target(descriptor: &DomainDescriptor, bus: DiskBus) -> Result<String> {
        let prefix = match bus {
            DiskBus::Ide | DiskBus::Sata => "hd",
            DiskBus::Virtio => "vd",
            DiskBus::Scsi => "sd",
        };
        let used = descriptor.disk_targets();
        for letter in b'a'..=b'z' {
            let candidate = format!("{prefix}{}", letter as char);
            if !used.iter().any(|u| *u == candidate) {
                return Ok(candidate);
            }
        }
        Err(EngineError::InvalidOperation(format!(
            "no free '{prefix}*' target names left"
        )))
    }

    /// First free IDE (bus, unit) pair. Controller 0 only; four slots.
    fn next_ide_address(descriptor: &DomainDescriptor) -> Result<DriveAddress> {
        let taken: Vec<(String, String)> = descriptor
            .devices
            .disks
            .iter()
            .filter(|d| d.target.bus == DiskBus::Ide)
            .filter_map(|d| {
                d.address
                    .as_ref()
                    .map(|a| (a.bus.clone(), a.unit.clone()))
            })
            .collect();
        let ide_count = descriptor
            .devices
            .disks
            .iter()
            .filter(|d| d.target.bus == DiskBus::Ide)
            .count();
        if ide_count >= IDE_SLOTS.len() {
            return Err(EngineError::InvalidOperation(
                "all four IDE slots are occupied".to_string(),
            ));
        }
        for (bus, unit) in IDE_SLOTS {
            let pair = (bus.to_string(), unit.to_string());
            if !taken.contains(&pair) {
                return Ok(DriveAddress {
                    kind: "drive".to_string(),
                    controller: "0".to_string(),
                    bus: pair.0,
                    target: "0".to_string(),
                    unit: pair.1,
                });
            }
        }
        Err(EngineError::InvalidOperation(
            "all four IDE slots are occupied".to_string(),
        ))
    }

    /// Attach a disk or CD-ROM. Returns the assigned target name.
    #[instrument(skip(self, request), fields(vm = %vm, path = %request.path))]
    pub async fn attach_disk(&self, vm: &str, request: DiskAttachRequest) -> Result<String> {
        let (descriptor, running) = self.descriptor_and_running(vm).await?;
        let bus = request.bus.unwrap_or(match request.role {
            DiskRole::Cdrom => DiskBus::Ide,
            DiskRole::Disk => DiskBus::Virtio,
        });
        if running && !bus.supports_hotplug() {
            return Err(EngineError::InvalidOperation(format!(
                "bus '{}' does not support hotplug; stop the VM first",
                bus.as_str()
            )));
        }

        // Volume-backed disks must not be shared.
        let managed = self.driver.volume_by_path(&request.path).await.is_ok();
        if managed && !self.store.volume_used_by(&request.path).await.is_empty() {
            return Err(EngineError::InvalidOperation(format!(
                "volume '{}' is already attached to another VM",
                request.path
            )));
        }

        let dev = Self::next_target(&descriptor, bus)?;
        let address = if bus == DiskBus::Ide {
            Some(Self::next_ide_address(&descriptor)?)
        } else {
            None
        };
        let format = request.format.unwrap_or_else(|| {
            let default = if request.role == DiskRole::Cdrom { "raw" } else { "qcow2" };
            default.to_string()
        });
        let source = match request.source_type {
            DiskSourceType::File | DiskSourceType::Network => DiskSource {
                file: Some(request.path.clone()),
                ..Default::default()
            },
            DiskSourceType::Block => DiskSource {
                dev: Some(request.path.clone()),
                ..Default::default()
            },
        };
        let disk = DiskDevice {
            source_type: request.source_type,
            role: request.role,
            driver: Some(DiskDriver::qemu(format)),
            source: Some(source),
            target: DiskTarget { dev: dev.clone(), bus },
            address,
            readonly: (request.role == DiskRole::Cdrom).then(Presence::default),
        };
        self.driver
            .attach_device(vm, &device_to_xml(&disk)?, DeviceFlags::for_state(running))
            .await?;
        if managed {
            if let Err(e) = self.store.volume_add_user(&request.path, vm).await {
                warn!(error = %e, "failed to record volume holder");
            }
        }
        info!(vm = %vm, dev = %dev, "disk attached");
        Ok(dev)
    }

    /// Swap (or, with `None`, eject) the medium of a CD-ROM device.
    #[instrument(skip(self), fields(vm = %vm, dev = %dev))]
    pub async fn change_cdrom_media(
        &self,
        vm: &str,
        dev: &str,
        path: Option<&str>,
    ) -> Result<()> {
        let (descriptor, running) = self.descriptor_and_running(vm).await?;
        let disk = descriptor
            .find_disk(dev)
            .ok_or_else(|| EngineError::not_found("device", dev))?;
        if disk.role != DiskRole::Cdrom {
            return Err(EngineError::InvalidOperation(format!(
                "device '{dev}' is not a CD-ROM; only media changes are supported"
            )));
        }
        let mut updated = disk.clone();
        updated.source = path.map(|p| DiskSource {
            file: Some(p.to_string()),
            ..Default::default()
        });
        self.driver
            .update_device(vm, &device_to_xml(&updated)?, DeviceFlags::for_state(running))
            .await
    }

    #[instrument(skip(self), fields(vm = %vm, dev = %dev))]
    pub async fn detach_disk(&self, vm: &str, dev: &str) -> Result<()> {
        let (descriptor, running) = self.descriptor_and_running(vm).await?;
        let disk = descriptor
            .find_disk(dev)
            .ok_or_else(|| EngineError::not_found("device", dev))?
            .clone();
        if running && !disk.target.bus.supports_hotplug() {
            return Err(EngineError::InvalidOperation(format!(
                "bus '{}' does not support hot-unplug; stop the VM first",
                disk.target.bus.as_str()
            )));
        }
        let path = disk.source_path().map(str::to_string);
        self.driver
            .detach_device(vm, &device_to_xml(&disk)?, DeviceFlags::for_state(running))
            .await?;
        if let Some(path) = path {
            if let Err(e) = self.store.volume_remove_user(&path, vm).await {
                warn!(error = %e, "failed to clear volume holder");
            }
        }
        Ok(())
    }

    fn pci_fragment(&self, address: PciAddress, running: bool) -> HostdevDevice {
        // vfio needs the device bound before boot; fall back to the kvm
        // driver when attaching live or when vfio is absent.
        let driver_name = if self.vfio && !running { "vfio" } else { "kvm" };
        HostdevDevice {
            mode: "subsystem".to_string(),
            kind: "pci".to_string(),
            managed: Some("yes".to_string()),
            sgio: None,
            source: HostdevSource {
                address: Some(address.to_hostdev_address()),
                ..Default::default()
            },
            driver: Some(HostdevDriver { name: driver_name.to_string() }),
        }
    }

    /// Attach a PCI device together with the rest of its IOMMU group.
    /// Either the whole group lands or none of it does.
    #[instrument(skip(self, group), fields(vm = %vm))]
    pub async fn attach_pci_group(&self, vm: &str, group: &[PciAddress]) -> Result<()> {
        if group.is_empty() {
            return Err(EngineError::InvalidParameter(
                "empty IOMMU group".to_string(),
            ));
        }
        let (_, running) = self.descriptor_and_running(vm).await?;
        let flags = DeviceFlags::for_state(running);
        let mut rollback = RollbackContext::new();
        for address in group {
            let fragment = self.pci_fragment(*address, running);
            let xml = device_to_xml(&fragment)?;
            if let Err(e) = self.driver.attach_device(vm, &xml, flags).await {
                warn!(vm = %vm, device = %address.node_name(), error = %e, "group attach failed");
                rollback.rollback().await;
                return Err(e);
            }
            let driver = self.driver.clone();
            let vm_name = vm.to_string();
            rollback.push("detach pci device", move || async move {
                if let Err(e) = driver.detach_device(&vm_name, &xml, flags).await {
                    warn!(error = %e, "rollback detach failed");
                }
            });
        }
        rollback.commit();
        info!(vm = %vm, devices = group.len(), "IOMMU group attached");
        Ok(())
    }

    /// SCSI LUN passthrough fragment attach.
    pub async fn attach_scsi_device(
        &self,
        vm: &str,
        adapter: &str,
        bus: u32,
        target: u32,
        unit: u32,
    ) -> Result<()> {
        let (_, running) = self.descriptor_and_running(vm).await?;
        let fragment = HostdevDevice {
            mode: "subsystem".to_string(),
            kind: "scsi".to_string(),
            managed: None,
            sgio: Some("unfiltered".to_string()),
            source: HostdevSource {
                adapter: Some(verdin_hypervisor::descriptor::HostdevAdapter {
                    name: adapter.to_string(),
                }),
                address: Some(HostdevAddress {
                    bus: Some(bus.to_string()),
                    target: Some(target.to_string()),
                    unit: Some(unit.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            driver: None,
        };
        self.driver
            .attach_device(vm, &device_to_xml(&fragment)?, DeviceFlags::for_state(running))
            .await
    }

    /// USB passthrough fragment attach, addressed by vendor/product id.
    pub async fn attach_usb_device(&self, vm: &str, vendor: &str, product: &str) -> Result<()> {
        let (_, running) = self.descriptor_and_running(vm).await?;
        let fragment = HostdevDevice {
            mode: "subsystem".to_string(),
            kind: "usb".to_string(),
            managed: Some("yes".to_string()),
            sgio: None,
            source: HostdevSource {
                startup_policy: Some("optional".to_string()),
                vendor: Some(HostdevId { id: vendor.to_string() }),
                product: Some(HostdevId { id: product.to_string() }),
                ..Default::default()
            },
            driver: None,
        };
        self.driver
            .attach_device(vm, &device_to_xml(&fragment)?, DeviceFlags::for_state(running))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdin_hypervisor::descriptor::{SizedElement, VcpuElement};
    use verdin_hypervisor::{MockDriver, VolumeSpec};

    async fn setup() -> (Arc<MockDriver>, DevicesModel) {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(ObjectStore::in_memory());
        let model = DevicesModel::new(driver.clone(), store, true);
        let desc = DomainDescriptor {
            virt_type: "kvm".to_string(),
            name: "vm1".to_string(),
            uuid: None,
            memory: SizedElement::kib(1024 * 1024),
            current_memory: None,
            max_memory: None,
            vcpu: VcpuElement::new(2),
            cpu: None,
            os: None,
            devices: Default::default(),
        };
        driver.define_domain(&desc.to_xml().unwrap()).await.unwrap();
        (driver, model)
    }

    fn cdrom_request(path: &str) -> DiskAttachRequest {
        DiskAttachRequest {
            path: path.to_string(),
            source_type: DiskSourceType::File,
            role: DiskRole::Cdrom,
            bus: None,
            format: None,
        }
    }

    #[tokio::test]
    async fn ide_targets_count_up_and_cap_at_four() {
        let (_driver, model) = setup().await;
        assert_eq!(model.attach_disk("vm1", cdrom_request("/isos/1.iso")).await.unwrap(), "hda");
        assert_eq!(model.attach_disk("vm1", cdrom_request("/isos/2.iso")).await.unwrap(), "hdb");
        assert_eq!(model.attach_disk("vm1", cdrom_request("/isos/3.iso")).await.unwrap(), "hdc");
        assert_eq!(model.attach_disk("vm1", cdrom_request("/isos/4.iso")).await.unwrap(), "hdd");
        let err = model
            .attach_disk("vm1", cdrom_request("/isos/5.iso"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn running_vm_rejects_ide_hotplug_but_takes_virtio() {
        let (driver, model) = setup().await;
        driver.start_domain("vm1").await.unwrap();
        let err = model
            .attach_disk("vm1", cdrom_request("/isos/1.iso"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));

        let request = DiskAttachRequest {
            path: "/tmp/data.qcow2".to_string(),
            source_type: DiskSourceType::File,
            role: DiskRole::Disk,
            bus: Some(DiskBus::Virtio),
            format: None,
        };
        assert_eq!(model.attach_disk("vm1", request).await.unwrap(), "vda");
    }

    #[tokio::test]
    async fn media_change_only_for_cdroms() {
        let (driver, model) = setup().await;
        model.attach_disk("vm1", cdrom_request("/isos/1.iso")).await.unwrap();
        model
            .change_cdrom_media("vm1", "hda", Some("/isos/2.iso"))
            .await
            .unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert_eq!(desc.cdrom_iso_paths(), vec!["/isos/2.iso"]);

        model.change_cdrom_media("vm1", "hda", None).await.unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert!(desc.cdrom_iso_paths().is_empty());

        let request = DiskAttachRequest {
            path: "/tmp/data.qcow2".to_string(),
            source_type: DiskSourceType::File,
            role: DiskRole::Disk,
            bus: Some(DiskBus::Virtio),
            format: None,
        };
        model.attach_disk("vm1", request).await.unwrap();
        let err = model
            .change_cdrom_media("vm1", "vda", Some("/isos/2.iso"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn shared_volume_attach_is_refused() {
        let (driver, model) = setup().await;
        let spec = VolumeSpec {
            name: "shared.img".into(),
            capacity: 1024,
            format: "qcow2".into(),
        };
        let record = driver.create_volume("default", &spec).await.unwrap();
        let request = DiskAttachRequest {
            path: record.path.clone(),
            source_type: DiskSourceType::File,
            role: DiskRole::Disk,
            bus: Some(DiskBus::Virtio),
            format: None,
        };
        model.attach_disk("vm1", request.clone()).await.unwrap();
        assert_eq!(model.store.volume_used_by(&record.path).await, vec!["vm1"]);

        let err = model.attach_disk("vm1", request).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn detach_clears_volume_holder() {
        let (driver, model) = setup().await;
        let spec = VolumeSpec { name: "d.img".into(), capacity: 1024, format: "qcow2".into() };
        let record = driver.create_volume("default", &spec).await.unwrap();
        let dev = model
            .attach_disk(
                "vm1",
                DiskAttachRequest {
                    path: record.path.clone(),
                    source_type: DiskSourceType::File,
                    role: DiskRole::Disk,
                    bus: Some(DiskBus::Virtio),
                    format: None,
                },
            )
            .await
            .unwrap();
        model.detach_disk("vm1", &dev).await.unwrap();
        assert!(model.store.volume_used_by(&record.path).await.is_empty());
    }

    #[tokio::test]
    async fn pci_group_attach_is_atomic() {
        let (driver, model) = setup().await;
        let group = [
            PciAddress { domain: 0, bus: 0x0a, slot: 0x00, function: 0 },
            PciAddress { domain: 0, bus: 0x0a, slot: 0x00, function: 1 },
        ];
        model.attach_pci_group("vm1", &group).await.unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert_eq!(desc.devices.hostdevs.len(), 2);
        assert_eq!(group[1].node_name(), "pci_0000_0a_00_1");
    }
}
