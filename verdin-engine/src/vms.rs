//! VM lifecycle and update engine.
//!
//! `VmsModel` owns the collection-level operations (create, clone, list)
//! and the per-instance ones (update, delete, lifecycle verbs, lookup).
//! Every mutating per-VM path serializes on a per-name async mutex from a
//! process-wide map; entries are created lazily and never removed, so two
//! racing updates of the same VM always contend on the same lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use verdin_hypervisor::descriptor::{
    device_to_xml, fragment_from_xml, fragment_to_xml, generate_mac_address,
    CpuSocketDevice, DescriptorField, DomainDescriptor, GraphicsDevice, MemoryDevice,
    NameMetadata, OsMetadata, SizedElement, METADATA_KEY_ACCESS, METADATA_KEY_NAME,
    METADATA_KEY_OS, METADATA_NAMESPACE,
};
use verdin_hypervisor::descriptor::AccessMetadata;
use verdin_hypervisor::error::{EngineError, Result};
use verdin_hypervisor::{
    Capabilities, DeviceFlags, DomainState, SnapshotRecord, VirtDriver,
};

use crate::host::{HostIdentity, HostOps};
use crate::objstore::{ObjectStore, KIND_SCREENSHOT, KIND_VM};
use crate::rollback::RollbackContext;
use crate::stats::{StatsTracker, VmStats};
use crate::storage::StorageCoordinator;
use crate::tasks::TaskManager;
use crate::templates::TemplateCatalog;

const LIVE_ONLY: DeviceFlags = DeviceFlags { live: true, persistent: false };

/// One gigabyte, the memory hot-add granularity, in MiB.
const DIMM_MIB: u64 = 1024;

fn vms_target(name: &str) -> String {
    format!("/vms/{name}")
}

/// Parameters accepted by `create`.
#[derive(Debug, Clone)]
pub struct VmCreateParams {
    /// Generated from the template name when omitted.
    pub name: Option<String>,
    pub template: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphicsView {
    pub kind: String,
    pub listen: Option<String>,
    /// Only populated while the VM runs.
    pub port: Option<i32>,
    pub password: Option<String>,
    pub password_valid_to: Option<String>,
}

/// Everything `lookup` reports about one VM.
#[derive(Debug, Clone, Serialize)]
pub struct VmView {
    pub name: String,
    pub state: String,
    pub uuid: String,
    pub persistent: bool,
    pub memory_mib: u64,
    pub cpus: u32,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub os_distro: Option<String>,
    pub os_version: Option<String>,
    pub icon: Option<String>,
    pub graphics: Option<GraphicsView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Vec<u8>>,
    pub stats: VmStats,
}

enum CpuAction {
    Noop,
    StaticSet(u32),
    HotPlug { target: u32, add: Vec<u32> },
    HotUnplug { target: u32, remove: Vec<u32> },
}

enum MemoryAction {
    Noop,
    StaticSet(u64),
    HotAdd { target_mib: u64, dimms: u32 },
}

pub struct VmsModel {
    driver: Arc<dyn VirtDriver>,
    store: Arc<ObjectStore>,
    templates: Arc<TemplateCatalog>,
    host: Arc<dyn HostOps>,
    identity: Arc<dyn HostIdentity>,
    caps: Capabilities,
    stats: StatsTracker,
    storage: Arc<StorageCoordinator>,
    tasks: Arc<TaskManager>,
    locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl VmsModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<dyn VirtDriver>,
        store: Arc<ObjectStore>,
        templates: Arc<TemplateCatalog>,
        host: Arc<dyn HostOps>,
        identity: Arc<dyn HostIdentity>,
        caps: Capabilities,
        default_pool: &str,
    ) -> Arc<Self> {
        let stats = StatsTracker::new(driver.clone());
        let storage = Arc::new(StorageCoordinator::new(
            driver.clone(),
            store.clone(),
            default_pool,
        ));
        Arc::new(Self {
            driver,
            store,
            templates,
            host,
            identity,
            caps,
            stats,
            storage,
            tasks: Arc::new(TaskManager::new()),
            locks: StdMutex::new(HashMap::new()),
        })
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn storage(&self) -> &StorageCoordinator {
        &self.storage
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn vm_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn name_taken(&self, name: &str) -> Result<bool> {
        Ok(self.driver.domain_exists(name).await?
            || self.tasks.is_target_busy(&vms_target(name)).await)
    }

    async fn descriptor(&self, name: &str) -> Result<DomainDescriptor> {
        DomainDescriptor::parse(&self.driver.domain_xml(name).await?)
    }

    async fn write_metadata<T: serde::Serialize>(
        &self,
        vm: &str,
        key: &str,
        fragment: &T,
    ) -> Result<()> {
        let xml = fragment_to_xml(fragment)?;
        self.driver
            .set_domain_metadata(vm, METADATA_NAMESPACE, key, Some(&xml))
            .await
    }

    async fn read_access(&self, vm: &str) -> AccessMetadata {
        match self
            .driver
            .domain_metadata(vm, METADATA_NAMESPACE, METADATA_KEY_ACCESS)
            .await
        {
            Ok(Some(xml)) => fragment_from_xml(&xml).unwrap_or_default(),
            _ => AccessMetadata::default(),
        }
    }

    // --- collection ops ---------------------------------------------------

    pub async fn list(&self) -> Result<Vec<String>> {
        self.driver.list_domains().await
    }

    /// Create a VM from a template. Returns the task id; the task message
    /// is the VM name.
    #[instrument(skip(self, params), fields(template = %params.template))]
    pub async fn create(self: &Arc<Self>, params: VmCreateParams) -> Result<u64> {
        let template = self.templates.get(&params.template).await?;
        template.validate(&self.caps)?;

        let name = match params.name {
            Some(name) => {
                if name.is_empty() {
                    return Err(EngineError::InvalidParameter(
                        "VM name must not be empty".to_string(),
                    ));
                }
                name
            }
            None => {
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", template.name, &suffix[..8])
            }
        };
        if self.name_taken(&name).await? {
            return Err(EngineError::InvalidParameter(format!(
                "VM name '{name}' is already in use"
            )));
        }

        let model = self.clone();
        let vm_name = name.clone();
        let task = self
            .tasks
            .spawn(vms_target(&name), async move {
                model.create_task(vm_name, template).await
            })
            .await;
        Ok(task)
    }

    async fn create_task(
        &self,
        name: String,
        template: crate::templates::VmTemplate,
    ) -> Result<String> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let mut rollback = RollbackContext::new();

        let mut volumes = Vec::new();
        for (i, disk) in template.disks.iter().enumerate() {
            let pool_state = self.driver.pool_state(&disk.pool).await?;
            if pool_state.kind.is_read_only() {
                // LUN pools expose pre-existing volumes; nothing to provision.
                continue;
            }
            let spec = verdin_hypervisor::VolumeSpec {
                name: format!("{name}-{i}.img"),
                capacity: disk.size_gib * 1024 * 1024 * 1024,
                format: disk.format.clone(),
            };
            let record = match self.storage.create_volume(&disk.pool, &spec).await {
                Ok(r) => r,
                Err(e) => {
                    rollback.rollback().await;
                    return Err(e);
                }
            };
            let driver = self.driver.clone();
            let pool = disk.pool.clone();
            let vol = spec.name.clone();
            rollback.push("delete provisioned volume", move || async move {
                if let Err(e) = driver.delete_volume(&pool, &vol).await {
                    warn!(error = %e, "volume cleanup failed");
                }
            });
            volumes.push(record);
        }

        let descriptor = template.render_descriptor(&name, &uuid, &volumes);
        let xml = match descriptor.to_xml() {
            Ok(x) => x,
            Err(e) => {
                rollback.rollback().await;
                return Err(e);
            }
        };
        if let Err(e) = self.driver.define_domain(&xml).await {
            rollback.rollback().await;
            return Err(e);
        }
        {
            let driver = self.driver.clone();
            let vm = name.clone();
            rollback.push("undefine domain", move || async move {
                if let Err(e) = driver.undefine_domain(&vm).await {
                    warn!(error = %e, "undefine cleanup failed");
                }
            });
        }

        for record in &volumes {
            if let Err(e) = self.store.volume_add_user(&record.path, &name).await {
                warn!(error = %e, "failed to record volume holder");
            }
        }

        if let (Some(distro), Some(version)) = (&template.os_distro, &template.os_version) {
            let os = OsMetadata { distro: distro.clone(), version: version.clone() };
            if let Err(e) = self.write_metadata(&name, METADATA_KEY_OS, &os).await {
                rollback.rollback().await;
                return Err(e);
            }
        }
        let display = NameMetadata { value: name.clone() };
        if let Err(e) = self.write_metadata(&name, METADATA_KEY_NAME, &display).await {
            rollback.rollback().await;
            return Err(e);
        }

        if let Some(icon) = &template.icon {
            // Bookkeeping only; a failure here never fails the create.
            if let Err(e) = self
                .store
                .put(KIND_VM, &uuid, serde_json::json!({ "icon": icon }))
                .await
            {
                warn!(error = %e, "failed to store VM icon");
            }
        }

        rollback.commit();
        info!(vm = %name, "VM created");
        Ok(name)
    }

    /// Clone a shut-off VM. Returns the task id; the task message is the
    /// clone's name.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn clone_vm(self: &Arc<Self>, name: &str) -> Result<u64> {
        let info = self.driver.domain_info(name).await?;
        if info.state != DomainState::Shutoff {
            return Err(EngineError::InvalidOperation(format!(
                "only shut-off VMs can be cloned; '{name}' is {}",
                info.state
            )));
        }
        let clone_name = self.next_clone_name(name).await?;
        let model = self.clone();
        let src = name.to_string();
        let dest = clone_name.clone();
        let task = self
            .tasks
            .spawn(vms_target(&clone_name), async move {
                model.clone_task(src, dest).await
            })
            .await;
        Ok(task)
    }

    /// `<base>-clone-N`, where base strips an existing `-clone-N` suffix.
    async fn next_clone_name(&self, name: &str) -> Result<String> {
        let base = match name.rfind("-clone-") {
            Some(pos) if name[pos + 7..].chars().all(|c| c.is_ascii_digit())
                && !name[pos + 7..].is_empty() =>
            {
                &name[..pos]
            }
            _ => name,
        };
        for n in 1..=1000u32 {
            let candidate = format!("{base}-clone-{n}");
            if !self.name_taken(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(EngineError::OperationFailed {
            op: "clone",
            cause: format!("no free clone name for '{name}'"),
        })
    }

    async fn clone_task(&self, src: String, dest: String) -> Result<String> {
        let mut descriptor = self.descriptor(&src).await?;
        let src_uuid = self.driver.domain_uuid(&src).await?;
        let new_uuid = uuid::Uuid::new_v4().to_string();
        descriptor.name = dest.clone();
        descriptor.uuid = Some(new_uuid.clone());

        // Fresh MACs, collision-checked against the old and new sets.
        let mut seen: Vec<String> =
            descriptor.mac_addresses().iter().map(|m| m.to_string()).collect();
        for iface in descriptor.devices.interfaces.iter_mut() {
            if let Some(mac) = iface.mac.as_mut() {
                let fresh = loop {
                    let candidate = generate_mac_address();
                    if !seen.iter().any(|m| *m == candidate) {
                        break candidate;
                    }
                };
                seen.push(fresh.clone());
                mac.address = fresh;
            }
        }

        let mut rollback = RollbackContext::new();

        let disk_paths: Vec<String> =
            descriptor.disk_paths().iter().map(|p| p.to_string()).collect();
        for (i, path) in disk_paths.iter().enumerate() {
            let src_vol = match self.storage.volume_by_path(path).await {
                Ok(v) => v,
                // Unmanaged path; the clone shares it.
                Err(EngineError::NotFound { .. }) => continue,
                Err(e) => {
                    rollback.rollback().await;
                    return Err(e);
                }
            };
            let dest_name = format!("{dest}-{i}.img");
            let cloned = match self
                .storage
                .clone_volume(&src_vol.pool, &src_vol.name, &dest_name)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    rollback.rollback().await;
                    return Err(e);
                }
            };
            {
                let driver = self.driver.clone();
                let pool = cloned.pool.clone();
                let vol = cloned.name.clone();
                rollback.push("delete cloned volume", move || async move {
                    if let Err(e) = driver.delete_volume(&pool, &vol).await {
                        warn!(error = %e, "cloned volume cleanup failed");
                    }
                });
            }
            for disk in descriptor.devices.disks.iter_mut() {
                if disk.source_path() == Some(path.as_str()) {
                    if let Some(source) = disk.source.as_mut() {
                        if source.file.is_some() {
                            source.file = Some(cloned.path.clone());
                        } else {
                            source.dev = Some(cloned.path.clone());
                        }
                    }
                }
            }
        }

        let xml = match descriptor.to_xml() {
            Ok(x) => x,
            Err(e) => {
                rollback.rollback().await;
                return Err(e);
            }
        };
        if let Err(e) = self.driver.define_domain(&xml).await {
            rollback.rollback().await;
            return Err(e);
        }
        {
            let driver = self.driver.clone();
            let vm = dest.clone();
            rollback.push("undefine clone", move || async move {
                if let Err(e) = driver.undefine_domain(&vm).await {
                    warn!(error = %e, "clone undefine cleanup failed");
                }
            });
        }

        for path in descriptor.disk_paths() {
            if let Err(e) = self.store.volume_add_user(path, &dest).await {
                warn!(error = %e, "failed to record volume holder");
            }
        }

        // Carry OS and access metadata over; the display name is the clone's.
        for key in [METADATA_KEY_OS, METADATA_KEY_ACCESS] {
            match self.driver.domain_metadata(&src, METADATA_NAMESPACE, key).await {
                Ok(Some(xml)) => {
                    if let Err(e) = self
                        .driver
                        .set_domain_metadata(&dest, METADATA_NAMESPACE, key, Some(&xml))
                        .await
                    {
                        rollback.rollback().await;
                        return Err(e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    rollback.rollback().await;
                    return Err(e);
                }
            }
        }
        let display = NameMetadata { value: dest.clone() };
        if let Err(e) = self.write_metadata(&dest, METADATA_KEY_NAME, &display).await {
            rollback.rollback().await;
            return Err(e);
        }

        if let Some(icon) = self.store.get(KIND_VM, &src_uuid).await {
            if let Err(e) = self.store.put(KIND_VM, &new_uuid, icon).await {
                warn!(error = %e, "failed to copy VM icon");
            } else {
                let store = self.store.clone();
                let uuid = new_uuid.clone();
                rollback.push("remove cloned icon", move || async move {
                    if let Err(e) = store.delete(KIND_VM, &uuid).await {
                        warn!(error = %e, "icon cleanup failed");
                    }
                });
            }
        }

        rollback.commit();
        info!(src = %src, dest = %dest, "VM cloned");
        Ok(dest)
    }

    // --- update -----------------------------------------------------------

    /// Update a VM. Returns the (possibly new) name.
    #[instrument(skip(self, params), fields(vm = %name))]
    pub async fn update(&self, name: &str, params: &Map<String, Value>) -> Result<String> {
        const OFFLINE_ONLY: [&str; 1] = ["name"];
        const ALWAYS: [&str; 5] = ["cpus", "memory", "graphics", "users", "groups"];
        for key in params.keys() {
            if !OFFLINE_ONLY.contains(&key.as_str()) && !ALWAYS.contains(&key.as_str()) {
                return Err(EngineError::InvalidParameter(format!(
                    "unknown update parameter '{key}'"
                )));
            }
        }

        let lock = self.vm_lock(name);
        let _guard = lock.lock().await;

        if !self.driver.domain_exists(name).await? {
            return Err(EngineError::not_found("VM", name));
        }
        let info = self.driver.domain_info(name).await?;
        let running = info.state.is_running();
        let descriptor = self.descriptor(name).await?;

        // Validation phase: every check runs before any side effect.
        let new_name = match params.get("name") {
            Some(v) => {
                let s = v.as_str().ok_or_else(|| {
                    EngineError::InvalidParameter("name must be a string".to_string())
                })?;
                if s.is_empty() {
                    return Err(EngineError::InvalidParameter(
                        "name must not be empty".to_string(),
                    ));
                }
                if running {
                    return Err(EngineError::InvalidOperation(
                        "renaming requires the VM to be shut off".to_string(),
                    ));
                }
                if s != name && self.name_taken(s).await? {
                    return Err(EngineError::InvalidParameter(format!(
                        "VM name '{s}' is already in use"
                    )));
                }
                if s == name { None } else { Some(s.to_string()) }
            }
            None => None,
        };

        let cpu_action = match params.get("cpus") {
            Some(v) => self.plan_cpus(v, &descriptor, running, info.vcpus)?,
            None => CpuAction::Noop,
        };
        let memory_action = match params.get("memory") {
            Some(v) => self.plan_memory(v, &descriptor, running)?,
            None => MemoryAction::Noop,
        };
        let graphics_change = match params.get("graphics") {
            Some(v) => Some(Self::parse_graphics(v, &descriptor)?),
            None => None,
        };
        let access = match (params.get("users"), params.get("groups")) {
            (None, None) => None,
            (users_param, groups_param) => {
                // A one-sided update keeps the other list as stored; only
                // the caller-supplied entries are validated against the
                // host catalog.
                let current = self.read_access(name).await;
                let users = match users_param {
                    Some(v) => {
                        let users = Self::string_list(v, "users")?;
                        for user in &users {
                            if !self.identity.user_exists(user).await? {
                                return Err(EngineError::InvalidParameter(format!(
                                    "user '{user}' does not exist on this host"
                                )));
                            }
                        }
                        users
                    }
                    None => current.users,
                };
                let groups = match groups_param {
                    Some(v) => {
                        let groups = Self::string_list(v, "groups")?;
                        for group in &groups {
                            if !self.identity.group_exists(group).await? {
                                return Err(EngineError::InvalidParameter(format!(
                                    "group '{group}' does not exist on this host"
                                )));
                            }
                        }
                        groups
                    }
                    None => current.groups,
                };
                Some(AccessMetadata { users, groups })
            }
        };

        // Execution phase.
        if let Some(access) = access {
            self.write_metadata(name, METADATA_KEY_ACCESS, &access).await?;
        }

        if let Some((password, valid_to)) = graphics_change {
            self.apply_graphics(name, running, password, valid_to).await?;
        }

        match cpu_action {
            CpuAction::Noop => {}
            CpuAction::StaticSet(count) => {
                let mut updated = self.descriptor(name).await?;
                DescriptorField::VcpuCount.set(&mut updated, &count.to_string())?;
                self.driver.redefine_domain(&updated.to_xml()?).await?;
            }
            CpuAction::HotPlug { target, add } => {
                for id in add {
                    let socket = CpuSocketDevice { id };
                    self.driver
                        .attach_device(name, &device_to_xml(&socket)?, LIVE_ONLY)
                        .await?;
                }
                self.finish_cpu_change(name, target).await?;
            }
            CpuAction::HotUnplug { target, remove } => {
                for id in remove {
                    let socket = CpuSocketDevice { id };
                    self.driver
                        .detach_device(name, &device_to_xml(&socket)?, LIVE_ONLY)
                        .await?;
                }
                self.finish_cpu_change(name, target).await?;
            }
        }

        match memory_action {
            MemoryAction::Noop => {}
            MemoryAction::StaticSet(mib) => {
                let mut updated = self.descriptor(name).await?;
                updated.set_memory_mib(mib);
                self.driver.redefine_domain(&updated.to_xml()?).await?;
            }
            MemoryAction::HotAdd { target_mib, dimms } => {
                for _ in 0..dimms {
                    let dimm = MemoryDevice::dimm_1gib();
                    self.driver
                        .attach_device(
                            name,
                            &device_to_xml(&dimm)?,
                            DeviceFlags::for_state(true),
                        )
                        .await?;
                }
                // Re-derive currentMemory in the persistent descriptor so
                // the next boot keeps the hot-added memory.
                let mut updated = self.descriptor(name).await?;
                updated.current_memory = Some(SizedElement::kib(target_mib * 1024));
                self.driver.redefine_domain(&updated.to_xml()?).await?;
            }
        }

        if let Some(new_name) = new_name {
            self.rename(name, &new_name).await?;
            info!(old = %name, new = %new_name, "VM renamed");
            return Ok(new_name);
        }
        Ok(name.to_string())
    }

    fn string_list(value: &Value, what: &str) -> Result<Vec<String>> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        EngineError::InvalidParameter(format!(
                            "{what} must be a list of strings"
                        ))
                    })
                })
                .collect(),
            _ => Err(EngineError::InvalidParameter(format!(
                "{what} must be a list of strings"
            ))),
        }
    }

    fn parse_graphics(
        value: &Value,
        descriptor: &DomainDescriptor,
    ) -> Result<(Option<String>, Option<i64>)> {
        let obj = value.as_object().ok_or_else(|| {
            EngineError::InvalidParameter("graphics must be an object".to_string())
        })?;
        if descriptor.primary_graphics().is_none() {
            return Err(EngineError::InvalidOperation(
                "VM has no graphics device".to_string(),
            ));
        }
        let mut password = None;
        let mut valid_to = None;
        for (key, v) in obj {
            match key.as_str() {
                "password" => {
                    password = Some(
                        v.as_str()
                            .ok_or_else(|| {
                                EngineError::InvalidParameter(
                                    "graphics password must be a string".to_string(),
                                )
                            })?
                            .to_string(),
                    )
                }
                "password_valid_to" => {
                    valid_to = Some(v.as_i64().ok_or_else(|| {
                        EngineError::InvalidParameter(
                            "password_valid_to must be seconds".to_string(),
                        )
                    })?)
                }
                other => {
                    return Err(EngineError::InvalidParameter(format!(
                        "unknown graphics parameter '{other}'"
                    )))
                }
            }
        }
        Ok((password, valid_to))
    }

    async fn apply_graphics(
        &self,
        name: &str,
        running: bool,
        password: Option<String>,
        valid_to: Option<i64>,
    ) -> Result<()> {
        let mut descriptor = self.descriptor(name).await?;
        if let Some(password) = &password {
            DescriptorField::GraphicsPassword.set(&mut descriptor, password)?;
        }
        if let Some(seconds) = valid_to {
            let expiry = (chrono::Utc::now() + chrono::Duration::seconds(seconds))
                .format("%Y-%m-%dT%H:%M:%S")
                .to_string();
            DescriptorField::GraphicsPasswordValidTo.set(&mut descriptor, &expiry)?;
        }
        if running {
            let graphics: &GraphicsDevice = descriptor
                .primary_graphics()
                .ok_or_else(|| {
                    EngineError::InvalidOperation("VM has no graphics device".to_string())
                })?;
            self.driver
                .update_device(
                    name,
                    &device_to_xml(graphics)?,
                    DeviceFlags::for_state(true),
                )
                .await
        } else {
            self.driver.redefine_domain(&descriptor.to_xml()?).await
        }
    }

    fn plan_cpus(
        &self,
        value: &Value,
        descriptor: &DomainDescriptor,
        running: bool,
        current: u32,
    ) -> Result<CpuAction> {
        let n = value
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                EngineError::InvalidParameter(
                    "cpus must be a positive integer".to_string(),
                )
            })? as u32;
        if n > self.caps.max_vcpus {
            return Err(EngineError::InvalidParameter(format!(
                "cpus {n} exceeds the host maximum of {}",
                self.caps.max_vcpus
            )));
        }
        let topology = descriptor.topology();
        if running {
            if n == current {
                return Ok(CpuAction::Noop);
            }
            let Some(topology) = topology else {
                return Err(EngineError::InvalidOperation(
                    "changing cpus on a running VM requires an explicit CPU topology"
                        .to_string(),
                ));
            };
            let per_socket = topology.vcpus_per_socket();
            let delta = n as i64 - current as i64;
            if delta.unsigned_abs() % per_socket as u64 != 0 {
                return Err(EngineError::InvalidParameter(format!(
                    "cpu changes on this VM go in whole sockets of {per_socket} vcpus"
                )));
            }
            let sockets = (delta.unsigned_abs() / per_socket as u64) as u32;
            if delta > 0 {
                let start = descriptor
                    .devices
                    .cpu_sockets
                    .iter()
                    .map(|s| s.id + 1)
                    .max()
                    .unwrap_or(topology.sockets);
                Ok(CpuAction::HotPlug {
                    target: n,
                    add: (start..start + sockets).collect(),
                })
            } else {
                let mut ids: Vec<u32> =
                    descriptor.devices.cpu_sockets.iter().map(|s| s.id).collect();
                if (sockets as usize) > ids.len() {
                    return Err(EngineError::InvalidOperation(
                        "cannot unplug more sockets than were hot-added".to_string(),
                    ));
                }
                ids.sort_unstable_by(|a, b| b.cmp(a));
                ids.truncate(sockets as usize);
                Ok(CpuAction::HotUnplug { target: n, remove: ids })
            }
        } else {
            match topology {
                Some(topology) => {
                    if n == topology.total_vcpus() {
                        Ok(CpuAction::Noop)
                    } else {
                        Err(EngineError::InvalidParameter(format!(
                            "cpus must match the CPU topology ({} vcpus)",
                            topology.total_vcpus()
                        )))
                    }
                }
                None => {
                    if n == descriptor.vcpu.count {
                        Ok(CpuAction::Noop)
                    } else {
                        Ok(CpuAction::StaticSet(n))
                    }
                }
            }
        }
    }

    /// Sync the live vcpu count, then rewrite the persistent descriptor:
    /// new count, transient socket devices dropped so the next boot does
    /// not race the socket driver.
    async fn finish_cpu_change(&self, name: &str, target: u32) -> Result<()> {
        self.driver.set_vcpus_live(name, target).await?;
        let mut updated = self.descriptor(name).await?;
        updated.vcpu.count = target;
        updated.vcpu.current = None;
        updated.devices.cpu_sockets.clear();
        self.driver.redefine_domain(&updated.to_xml()?).await
    }

    fn plan_memory(
        &self,
        value: &Value,
        descriptor: &DomainDescriptor,
        running: bool,
    ) -> Result<MemoryAction> {
        let mib = value
            .as_u64()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                EngineError::InvalidParameter(
                    "memory must be a positive number of MiB".to_string(),
                )
            })?;
        if let Some(max) = &descriptor.max_memory {
            if mib * 1024 > max.value {
                return Err(EngineError::InvalidParameter(format!(
                    "memory {mib} MiB exceeds the hotplug ceiling of {} MiB",
                    max.value / 1024
                )));
            }
        }
        let current_mib = descriptor
            .current_memory
            .as_ref()
            .map(|m| m.value)
            .unwrap_or(descriptor.memory.value)
            / 1024;
        if mib == current_mib {
            return Ok(MemoryAction::Noop);
        }
        if !running {
            return Ok(MemoryAction::StaticSet(mib));
        }
        if mib < current_mib {
            return Err(EngineError::InvalidOperation(
                "memory can only grow while the VM is running".to_string(),
            ));
        }
        if !self.caps.mem_hotplug_support {
            return Err(EngineError::InvalidOperation(
                "this host does not support memory hotplug".to_string(),
            ));
        }
        let delta = mib - current_mib;
        if delta % DIMM_MIB != 0 {
            return Err(EngineError::InvalidParameter(format!(
                "live memory changes go in {DIMM_MIB} MiB modules"
            )));
        }
        let dimms = (delta / DIMM_MIB) as u32;
        let slots = descriptor.max_memory.as_ref().map(|m| m.slots).unwrap_or(0);
        let used = descriptor.devices.memory_devices.len() as u32;
        if used + dimms > slots {
            return Err(EngineError::InvalidOperation(format!(
                "not enough free memory slots ({} used of {slots})",
                used
            )));
        }
        Ok(MemoryAction::HotAdd { target_mib: mib, dimms })
    }

    // --- rename -----------------------------------------------------------

    fn snapshot_depth(snapshots: &[SnapshotRecord]) -> HashMap<String, usize> {
        let parents: HashMap<&str, Option<&str>> = snapshots
            .iter()
            .map(|s| (s.name.as_str(), s.parent.as_deref()))
            .collect();
        let mut depths = HashMap::new();
        for snap in snapshots {
            let mut depth = 0;
            let mut cursor = snap.parent.as_deref();
            while let Some(parent) = cursor {
                depth += 1;
                cursor = parents.get(parent).copied().flatten();
                if depth > snapshots.len() {
                    break;
                }
            }
            depths.insert(snap.name.clone(), depth);
        }
        depths
    }

    async fn restore_domain(
        &self,
        descriptor: &DomainDescriptor,
        metadata: &[(String, String)],
        snapshots: &[SnapshotRecord],
    ) {
        let name = descriptor.name.clone();
        match descriptor.to_xml() {
            Ok(xml) => {
                if let Err(e) = self.driver.define_domain(&xml).await {
                    warn!(vm = %name, error = %e, "failed to restore domain");
                    return;
                }
            }
            Err(e) => {
                warn!(vm = %name, error = %e, "failed to restore domain");
                return;
            }
        }
        for (key, xml) in metadata {
            if let Err(e) = self
                .driver
                .set_domain_metadata(&name, METADATA_NAMESPACE, key, Some(xml))
                .await
            {
                warn!(vm = %name, error = %e, "failed to restore metadata");
            }
        }
        let depths = Self::snapshot_depth(snapshots);
        let mut ordered: Vec<&SnapshotRecord> = snapshots.iter().collect();
        ordered.sort_by_key(|s| depths.get(&s.name).copied().unwrap_or(0));
        for snap in ordered {
            if let Err(e) = self
                .driver
                .redefine_snapshot(&name, &snap.xml, snap.current)
                .await
            {
                warn!(vm = %name, snapshot = %snap.name, error = %e, "failed to restore snapshot");
            }
        }
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_descriptor = self.descriptor(old).await?;

        let mut metadata = Vec::new();
        for key in [METADATA_KEY_OS, METADATA_KEY_NAME, METADATA_KEY_ACCESS] {
            if let Some(xml) = self
                .driver
                .domain_metadata(old, METADATA_NAMESPACE, key)
                .await?
            {
                metadata.push((key.to_string(), xml));
            }
        }

        let snapshots = match self.driver.list_snapshots(old).await {
            Ok(s) => s,
            Err(EngineError::Unsupported(_)) => {
                warn!(vm = %old, "driver lacks snapshot support, rename proceeds without them");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        // Detach the snapshot metadata from the old name, deepest first.
        let depths = Self::snapshot_depth(&snapshots);
        let mut bottom_up: Vec<&SnapshotRecord> = snapshots.iter().collect();
        bottom_up.sort_by_key(|s| std::cmp::Reverse(depths.get(&s.name).copied().unwrap_or(0)));
        for snap in &bottom_up {
            self.driver
                .delete_snapshot(old, &snap.name, false, true)
                .await?;
        }

        self.driver.undefine_domain(old).await?;

        let mut renamed = old_descriptor.clone();
        renamed.name = new.to_string();
        if let Err(e) = self.driver.define_domain(&renamed.to_xml()?).await {
            self.restore_domain(&old_descriptor, &metadata, &snapshots).await;
            return Err(e);
        }

        for (key, xml) in &metadata {
            if key == METADATA_KEY_NAME {
                continue;
            }
            if let Err(e) = self
                .driver
                .set_domain_metadata(new, METADATA_NAMESPACE, key, Some(xml))
                .await
            {
                warn!(vm = %new, error = %e, "failed to carry metadata across rename");
            }
        }
        let display = NameMetadata { value: new.to_string() };
        if let Err(e) = self.write_metadata(new, METADATA_KEY_NAME, &display).await {
            warn!(vm = %new, error = %e, "failed to write display name");
        }

        // Parents before children, preserving the current marker.
        let mut top_down: Vec<&SnapshotRecord> = snapshots.iter().collect();
        top_down.sort_by_key(|s| depths.get(&s.name).copied().unwrap_or(0));
        for snap in top_down {
            if let Err(e) = self
                .driver
                .redefine_snapshot(new, &snap.xml, snap.current)
                .await
            {
                // Unwind: drop the half-renamed domain, restore the old one.
                let new_snaps = self.driver.list_snapshots(new).await.unwrap_or_default();
                for s in &new_snaps {
                    if let Err(e2) =
                        self.driver.delete_snapshot(new, &s.name, false, true).await
                    {
                        warn!(error = %e2, "failed to drop snapshot during unwind");
                    }
                }
                if let Err(e2) = self.driver.undefine_domain(new).await {
                    warn!(error = %e2, "failed to drop renamed domain during unwind");
                }
                self.restore_domain(&old_descriptor, &metadata, &snapshots).await;
                return Err(e);
            }
        }
        Ok(())
    }

    // --- delete -----------------------------------------------------------

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let lock = self.vm_lock(name);
        let _guard = lock.lock().await;

        if !self.driver.is_persistent(name).await? {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is a transient VM and cannot be deleted"
            )));
        }
        let info = self.driver.domain_info(name).await?;
        if info.state != DomainState::Shutoff {
            self.driver.destroy_domain(name).await?;
        }
        let uuid = self.driver.domain_uuid(name).await?;
        let descriptor = self.descriptor(name).await?;
        let disk_paths: Vec<String> =
            descriptor.disk_paths().iter().map(|p| p.to_string()).collect();

        match self.driver.list_snapshots(name).await {
            Ok(snapshots) => {
                let depths = Self::snapshot_depth(&snapshots);
                let mut bottom_up: Vec<&SnapshotRecord> = snapshots.iter().collect();
                bottom_up.sort_by_key(|s| {
                    std::cmp::Reverse(depths.get(&s.name).copied().unwrap_or(0))
                });
                for snap in bottom_up {
                    self.driver
                        .delete_snapshot(name, &snap.name, false, false)
                        .await?;
                }
            }
            Err(EngineError::Unsupported(_)) => {
                warn!(vm = %name, "driver lacks snapshot support, skipping snapshot cleanup");
            }
            Err(e) => return Err(e),
        }

        self.driver.undefine_domain(name).await?;

        // Best effort from here on.
        for path in disk_paths {
            if let Err(e) = self.store.volume_remove_user(&path, name).await {
                warn!(error = %e, "failed to clear volume holder");
            }
            let record = match self.driver.volume_by_path(&path).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            if !self.store.volume_used_by(&path).await.is_empty() {
                continue;
            }
            match self.driver.pool_state(&record.pool).await {
                Ok(state) if !state.kind.is_read_only() => {
                    if let Err(e) =
                        self.driver.delete_volume(&record.pool, &record.name).await
                    {
                        warn!(volume = %record.name, error = %e, "failed to delete volume");
                    }
                }
                _ => {}
            }
        }
        for kind in [KIND_VM, KIND_SCREENSHOT] {
            if let Err(e) = self.store.delete(kind, &uuid).await {
                warn!(error = %e, "failed to drop object store entry");
            }
        }
        info!(vm = %name, "VM deleted");
        Ok(())
    }

    // --- lifecycle verbs --------------------------------------------------

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn start(&self, name: &str) -> Result<()> {
        let info = self.driver.domain_info(name).await?;
        if info.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is already running"
            )));
        }
        let descriptor = self.descriptor(name).await?;
        for iso in descriptor.cdrom_iso_paths() {
            if let Err(e) = self.host.ensure_readable(iso).await {
                warn!(path = %iso, error = %e, "could not grant ISO read access");
            }
        }
        self.driver.start_domain(name).await
    }

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn poweroff(&self, name: &str) -> Result<()> {
        let info = self.driver.domain_info(name).await?;
        if info.state == DomainState::Shutoff {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is already shut off"
            )));
        }
        let uuid = self.driver.domain_uuid(name).await?;
        self.driver.destroy_domain(name).await?;
        self.stats.reset(&uuid).await;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn shutdown(&self, name: &str) -> Result<()> {
        let info = self.driver.domain_info(name).await?;
        if info.state == DomainState::Shutoff {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is already shut off"
            )));
        }
        self.driver.shutdown_domain(name).await
    }

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn reset(&self, name: &str) -> Result<()> {
        let info = self.driver.domain_info(name).await?;
        if info.state == DomainState::Shutoff {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is shut off and cannot be reset"
            )));
        }
        self.driver.reset_domain(name).await
    }

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn suspend(&self, name: &str) -> Result<()> {
        let info = self.driver.domain_info(name).await?;
        if !info.state.is_running() {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is {}, only running VMs can be suspended",
                info.state
            )));
        }
        self.driver.suspend_domain(name).await
    }

    #[instrument(skip(self), fields(vm = %name))]
    pub async fn resume(&self, name: &str) -> Result<()> {
        let info = self.driver.domain_info(name).await?;
        if info.state != DomainState::Paused {
            return Err(EngineError::InvalidOperation(format!(
                "'{name}' is {}, only paused VMs can be resumed",
                info.state
            )));
        }
        self.driver.resume_domain(name).await
    }

    // --- lookup -----------------------------------------------------------

    /// Refresh the stats baseline for one VM without assembling a full view.
    pub async fn refresh_stats(&self, name: &str) -> Result<VmStats> {
        let info = self.driver.domain_info(name).await?;
        let uuid = self.driver.domain_uuid(name).await?;
        self.stats.refresh(&uuid, name, &info).await
    }

    pub async fn lookup(&self, name: &str) -> Result<VmView> {
        let info = self.driver.domain_info(name).await?;
        let uuid = self.driver.domain_uuid(name).await?;
        let persistent = self.driver.is_persistent(name).await?;
        let descriptor = self.descriptor(name).await?;
        let running = info.state.is_running();

        let access = self.read_access(name).await;
        let os: Option<OsMetadata> = match self
            .driver
            .domain_metadata(name, METADATA_NAMESPACE, METADATA_KEY_OS)
            .await
        {
            Ok(Some(xml)) => fragment_from_xml(&xml).ok(),
            _ => None,
        };
        let icon = self
            .store
            .get(KIND_VM, &uuid)
            .await
            .and_then(|v| v.get("icon").and_then(|i| i.as_str()).map(str::to_string));

        let graphics = descriptor.primary_graphics().map(|g| GraphicsView {
            kind: g.kind.clone(),
            listen: g.listen.clone(),
            port: if running { g.port.filter(|p| *p >= 0) } else { None },
            password: g.password.clone(),
            password_valid_to: g.password_valid_to.clone(),
        });

        let screenshot = if running && descriptor.has_video() {
            match self.driver.screenshot(name).await {
                Ok(bytes) => {
                    if let Err(e) = self
                        .store
                        .put(
                            KIND_SCREENSHOT,
                            &uuid,
                            serde_json::json!({
                                "taken_at": chrono::Utc::now().timestamp()
                            }),
                        )
                        .await
                    {
                        warn!(error = %e, "failed to record screenshot");
                    }
                    Some(bytes)
                }
                Err(e) => {
                    warn!(vm = %name, error = %e, "screenshot failed");
                    None
                }
            }
        } else {
            None
        };

        let stats = self.stats.refresh(&uuid, name, &info).await?;

        Ok(VmView {
            name: name.to_string(),
            state: info.state.as_str().to_string(),
            uuid,
            persistent,
            memory_mib: info.memory_kib / 1024,
            cpus: info.vcpus,
            users: access.users,
            groups: access.groups,
            os_distro: os.as_ref().map(|o| o.distro.clone()),
            os_version: os.map(|o| o.version),
            icon,
            graphics,
            screenshot,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use verdin_hypervisor::descriptor::{
        CpuElement, CpuTopology, Devices, MaxMemoryElement, OsMetadata, VcpuElement,
    };
    use verdin_hypervisor::{MockDriver, PoolKind};

    use crate::host::StaticHost;
    use crate::tasks::TaskStatus;
    use crate::templates::{TemplateDisk, VmTemplate};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn template(pool: &str) -> VmTemplate {
        VmTemplate {
            name: "fedora".to_string(),
            cpus: 1,
            topology: None,
            memory_mib: 512,
            max_memory_mib: None,
            disks: vec![TemplateDisk {
                pool: pool.to_string(),
                size_gib: 1,
                format: "qcow2".to_string(),
            }],
            cdrom: None,
            iso_stream: false,
            graphics: "vnc".to_string(),
            networks: Vec::new(),
            os_distro: Some("fedora".to_string()),
            os_version: Some("40".to_string()),
            icon: None,
        }
    }

    async fn build(driver: Arc<MockDriver>, pool: &str) -> Arc<VmsModel> {
        let caps = verdin_hypervisor::Capabilities::probe(driver.as_ref(), "x86_64").await;
        let store = Arc::new(ObjectStore::in_memory());
        let templates = Arc::new(TemplateCatalog::new());
        templates.add(template(pool)).await;
        let host = Arc::new(StaticHost::default());
        VmsModel::new(driver.clone(), store, templates, host.clone(), host, caps, "default")
    }

    async fn setup() -> (Arc<MockDriver>, Arc<VmsModel>) {
        let driver = Arc::new(MockDriver::new());
        let model = build(driver.clone(), "default").await;
        (driver, model)
    }

    fn descriptor(name: &str) -> DomainDescriptor {
        DomainDescriptor {
            virt_type: "kvm".to_string(),
            name: name.to_string(),
            uuid: None,
            memory: SizedElement::kib(1024 * 1024),
            current_memory: Some(SizedElement::kib(1024 * 1024)),
            max_memory: Some(MaxMemoryElement {
                slots: 4,
                unit: "KiB".to_string(),
                value: 8 * 1024 * 1024,
            }),
            vcpu: VcpuElement::new(2),
            cpu: None,
            os: None,
            devices: Devices {
                graphics: vec![GraphicsDevice::vnc()],
                ..Default::default()
            },
        }
    }

    async fn define(driver: &MockDriver, desc: &DomainDescriptor) {
        driver.define_domain(&desc.to_xml().unwrap()).await.unwrap();
    }

    async fn create_vm(model: &Arc<VmsModel>, name: &str) {
        let task = model
            .create(VmCreateParams {
                name: Some(name.to_string()),
                template: "fedora".to_string(),
            })
            .await
            .unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Finished);
    }

    fn params(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    // --- create -----------------------------------------------------------

    #[tokio::test]
    async fn create_provisions_volume_and_metadata() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;

        assert!(driver.domain_exists("vm1").await.unwrap());
        assert_eq!(driver.list_volumes("default").await.unwrap(), vec!["vm1-0.img"]);
        let view = model.lookup("vm1").await.unwrap();
        assert_eq!(view.state, "shutoff");
        assert_eq!(view.os_distro.as_deref(), Some("fedora"));
        let graphics = view.graphics.unwrap();
        assert_eq!(graphics.kind, "vnc");
        assert!(graphics.port.is_none(), "port is only exposed while running");
    }

    #[tokio::test]
    async fn create_generates_name_from_template() {
        let (driver, model) = setup().await;
        let task = model
            .create(VmCreateParams { name: None, template: "fedora".to_string() })
            .await
            .unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Finished);
        assert!(record.message.starts_with("fedora-"));
        assert!(driver.domain_exists(&record.message).await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let (_driver, model) = setup().await;
        create_vm(&model, "vm1").await;
        let err = model
            .create(VmCreateParams {
                name: Some("vm1".to_string()),
                template: "fedora".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn failed_create_leaves_no_volumes_behind() {
        let (driver, model) = setup().await;
        driver.fail_next_define();
        let task = model
            .create(VmCreateParams {
                name: Some("vm1".to_string()),
                template: "fedora".to_string(),
            })
            .await
            .unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(!driver.domain_exists("vm1").await.unwrap());
        assert!(driver.list_volumes("default").await.unwrap().is_empty());
    }

    // --- update: validation -----------------------------------------------

    #[tokio::test]
    async fn unknown_update_param_leaves_descriptor_untouched() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        let before = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap())
            .unwrap()
            .checksum();

        let err = model
            .update("vm1", &params(&[("bogus", json!(1)), ("cpus", json!(4))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));

        let after = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap())
            .unwrap()
            .checksum();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn users_are_validated_against_host_catalog() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        let err = model
            .update("vm1", &params(&[("users", json!(["ghost"]))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));

        model
            .update(
                "vm1",
                &params(&[("users", json!(["admin"])), ("groups", json!(["kvm"]))]),
            )
            .await
            .unwrap();
        let view = model.lookup("vm1").await.unwrap();
        assert_eq!(view.users, vec!["admin"]);
        assert_eq!(view.groups, vec!["kvm"]);
    }

    #[tokio::test]
    async fn one_sided_access_update_keeps_the_other_list() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        model
            .update(
                "vm1",
                &params(&[("users", json!(["admin"])), ("groups", json!(["kvm"]))]),
            )
            .await
            .unwrap();

        model.update("vm1", &params(&[("users", json!(["root"]))])).await.unwrap();
        let view = model.lookup("vm1").await.unwrap();
        assert_eq!(view.users, vec!["root"]);
        assert_eq!(view.groups, vec!["kvm"], "groups survive a users-only update");

        model.update("vm1", &params(&[("groups", json!(["root"]))])).await.unwrap();
        let view = model.lookup("vm1").await.unwrap();
        assert_eq!(view.users, vec!["root"], "users survive a groups-only update");
        assert_eq!(view.groups, vec!["root"]);
    }

    // --- update: cpus -----------------------------------------------------

    #[tokio::test]
    async fn offline_cpus_must_match_topology() {
        let (driver, model) = setup().await;
        let mut desc = descriptor("vm1");
        desc.cpu = Some(CpuElement {
            mode: None,
            topology: Some(CpuTopology { sockets: 1, cores: 2, threads: 1 }),
        });
        define(&driver, &desc).await;

        let err = model
            .update("vm1", &params(&[("cpus", json!(4))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
        // Matching the topology is a no-op, not an error.
        model.update("vm1", &params(&[("cpus", json!(2))])).await.unwrap();
    }

    #[tokio::test]
    async fn offline_cpus_without_topology_rewrites_count() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        model.update("vm1", &params(&[("cpus", json!(4))])).await.unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert_eq!(desc.vcpu.count, 4);
    }

    #[tokio::test]
    async fn live_cpu_changes_go_in_whole_sockets() {
        let (driver, model) = setup().await;
        let mut desc = descriptor("vm1");
        desc.vcpu = VcpuElement::new(4);
        desc.cpu = Some(CpuElement {
            mode: None,
            topology: Some(CpuTopology { sockets: 2, cores: 2, threads: 1 }),
        });
        define(&driver, &desc).await;
        driver.start_domain("vm1").await.unwrap();

        let err = model
            .update("vm1", &params(&[("cpus", json!(5))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));

        model.update("vm1", &params(&[("cpus", json!(6))])).await.unwrap();
        let info = driver.domain_info("vm1").await.unwrap();
        assert_eq!(info.vcpus, 6);
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert_eq!(desc.vcpu.count, 6);
        assert!(desc.vcpu.current.is_none());
        assert!(
            desc.devices.cpu_sockets.is_empty(),
            "socket devices are transient and dropped from the stored descriptor"
        );
    }

    #[tokio::test]
    async fn live_cpu_unplug_removes_highest_socket_first() {
        let (driver, model) = setup().await;
        let mut desc = descriptor("vm1");
        desc.vcpu = VcpuElement::new(8);
        desc.cpu = Some(CpuElement {
            mode: None,
            topology: Some(CpuTopology { sockets: 2, cores: 2, threads: 1 }),
        });
        desc.devices.cpu_sockets =
            vec![CpuSocketDevice { id: 2 }, CpuSocketDevice { id: 3 }];
        define(&driver, &desc).await;
        driver.start_domain("vm1").await.unwrap();

        model.update("vm1", &params(&[("cpus", json!(6))])).await.unwrap();
        assert_eq!(driver.domain_info("vm1").await.unwrap().vcpus, 6);
    }

    #[tokio::test]
    async fn live_cpu_unplug_cannot_exceed_hot_added_sockets() {
        let (driver, model) = setup().await;
        let mut desc = descriptor("vm1");
        desc.vcpu = VcpuElement::new(8);
        desc.cpu = Some(CpuElement {
            mode: None,
            topology: Some(CpuTopology { sockets: 2, cores: 2, threads: 1 }),
        });
        desc.devices.cpu_sockets =
            vec![CpuSocketDevice { id: 2 }, CpuSocketDevice { id: 3 }];
        define(&driver, &desc).await;
        driver.start_domain("vm1").await.unwrap();

        let err = model
            .update("vm1", &params(&[("cpus", json!(2))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    // --- update: memory ---------------------------------------------------

    #[tokio::test]
    async fn live_memory_grows_in_gib_modules() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        driver.start_domain("vm1").await.unwrap();

        let err = model
            .update("vm1", &params(&[("memory", json!(1536))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));

        model.update("vm1", &params(&[("memory", json!(3072))])).await.unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert_eq!(desc.devices.memory_devices.len(), 2);
        assert_eq!(
            driver.domain_info("vm1").await.unwrap().memory_kib,
            3072 * 1024,
            "currentMemory is re-derived after the DIMMs land"
        );

        let err = model
            .update("vm1", &params(&[("memory", json!(2048))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)), "no live shrink");
    }

    #[tokio::test]
    async fn memory_cannot_exceed_hotplug_ceiling() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        let err = model
            .update("vm1", &params(&[("memory", json!(16384))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn offline_memory_is_a_static_rewrite() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        model.update("vm1", &params(&[("memory", json!(2048))])).await.unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        assert_eq!(desc.memory_mib(), 2048);
        assert!(desc.devices.memory_devices.is_empty());
    }

    // --- update: graphics -------------------------------------------------

    #[tokio::test]
    async fn graphics_password_lands_in_descriptor() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        model
            .update(
                "vm1",
                &params(&[(
                    "graphics",
                    json!({ "password": "tiger", "password_valid_to": 60 }),
                )]),
            )
            .await
            .unwrap();
        let desc = DomainDescriptor::parse(&driver.domain_xml("vm1").await.unwrap()).unwrap();
        let graphics = desc.primary_graphics().unwrap();
        assert_eq!(graphics.password.as_deref(), Some("tiger"));
        assert!(graphics.password_valid_to.is_some());
    }

    // --- rename -----------------------------------------------------------

    #[tokio::test]
    async fn rename_carries_snapshots_and_metadata() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        let os = OsMetadata { distro: "fedora".to_string(), version: "40".to_string() };
        driver
            .set_domain_metadata(
                "vm1",
                METADATA_NAMESPACE,
                METADATA_KEY_OS,
                Some(&fragment_to_xml(&os).unwrap()),
            )
            .await
            .unwrap();
        driver.create_snapshot("vm1", "base").await.unwrap();
        driver.create_snapshot("vm1", "work").await.unwrap();

        let new_name = model
            .update("vm1", &params(&[("name", json!("vm2"))]))
            .await
            .unwrap();
        assert_eq!(new_name, "vm2");
        assert!(!driver.domain_exists("vm1").await.unwrap());

        let snaps = driver.list_snapshots("vm2").await.unwrap();
        assert_eq!(snaps.len(), 2);
        let work = snaps.iter().find(|s| s.name == "work").unwrap();
        assert_eq!(work.parent.as_deref(), Some("base"));
        assert!(work.current, "current marker survives the rename");

        let os_xml = driver
            .domain_metadata("vm2", METADATA_NAMESPACE, METADATA_KEY_OS)
            .await
            .unwrap();
        assert!(os_xml.unwrap().contains("fedora"));
        let display = driver
            .domain_metadata("vm2", METADATA_NAMESPACE, METADATA_KEY_NAME)
            .await
            .unwrap()
            .unwrap();
        let display: NameMetadata = fragment_from_xml(&display).unwrap();
        assert_eq!(display.value, "vm2");
    }

    #[tokio::test]
    async fn failed_rename_restores_the_original() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        driver.create_snapshot("vm1", "base").await.unwrap();
        driver.fail_next_define();

        let err = model
            .update("vm1", &params(&[("name", json!("vm2"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OperationFailed { .. }));
        assert!(driver.domain_exists("vm1").await.unwrap());
        assert!(!driver.domain_exists("vm2").await.unwrap());
        let snaps = driver.list_snapshots("vm1").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].current);
    }

    #[tokio::test]
    async fn rename_requires_shutoff() {
        let (driver, model) = setup().await;
        define(&driver, &descriptor("vm1")).await;
        driver.start_domain("vm1").await.unwrap();
        let err = model
            .update("vm1", &params(&[("name", json!("vm2"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    // --- clone ------------------------------------------------------------

    #[tokio::test]
    async fn clone_copies_volumes_and_regenerates_identity() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;

        let task = model.clone_vm("vm1").await.unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Finished);
        assert_eq!(record.message, "vm1-clone-1");

        assert!(driver.domain_exists("vm1-clone-1").await.unwrap());
        let volumes = driver.list_volumes("default").await.unwrap();
        assert!(volumes.contains(&"vm1-clone-1-0.img".to_string()));
        assert_ne!(
            driver.domain_uuid("vm1").await.unwrap(),
            driver.domain_uuid("vm1-clone-1").await.unwrap()
        );
        // Cloning the clone strips the old suffix instead of stacking.
        let task = model.clone_vm("vm1-clone-1").await.unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.message, "vm1-clone-2");
    }

    #[tokio::test]
    async fn clone_refuses_running_source() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;
        driver.start_domain("vm1").await.unwrap();
        let err = model.clone_vm("vm1").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn clone_falls_back_to_default_pool() {
        let driver = Arc::new(MockDriver::new());
        // Source pool barely fits the original volume; the copy cannot.
        driver.add_pool("small", PoolKind::Dir, GIB + GIB / 2).await;
        let model = build(driver.clone(), "small").await;
        create_vm(&model, "vm1").await;

        let task = model.clone_vm("vm1").await.unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Finished);
        assert!(driver
            .volume_record("default", "vm1-clone-1-0.img")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn failed_clone_leaves_no_orphans() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;
        driver.fail_next_volume_create();

        let task = model.clone_vm("vm1").await.unwrap();
        let record = model.tasks().wait(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(!driver.domain_exists("vm1-clone-1").await.unwrap());
        assert_eq!(driver.list_volumes("default").await.unwrap(), vec!["vm1-0.img"]);
    }

    // --- delete -----------------------------------------------------------

    #[tokio::test]
    async fn delete_removes_domain_and_exclusive_volumes() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;
        driver.start_domain("vm1").await.unwrap();

        model.delete("vm1").await.unwrap();
        assert!(!driver.domain_exists("vm1").await.unwrap());
        assert!(driver.list_volumes("default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_keeps_shared_volumes() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;
        let path = "/var/lib/verdin/pools/default/vm1-0.img";
        model.store.volume_add_user(path, "vm2").await.unwrap();
        let view = model.storage().lookup_volume("default", "vm1-0.img").await.unwrap();
        assert_eq!(view.used_by, vec!["vm1", "vm2"]);

        model.delete("vm1").await.unwrap();
        assert!(!driver.domain_exists("vm1").await.unwrap());
        assert!(driver.volume_record("default", "vm1-0.img").await.is_ok());
        assert_eq!(model.store.volume_used_by(path).await, vec!["vm2"]);
    }

    #[tokio::test]
    async fn delete_tolerates_missing_snapshot_support() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;
        driver.disable_snapshots();
        model.delete("vm1").await.unwrap();
        assert!(!driver.domain_exists("vm1").await.unwrap());
    }

    // --- lifecycle and concurrency ----------------------------------------

    #[tokio::test]
    async fn lifecycle_verbs_enforce_state() {
        let (driver, model) = setup().await;
        create_vm(&model, "vm1").await;

        assert!(model.resume("vm1").await.is_err());
        model.start("vm1").await.unwrap();
        assert!(model.start("vm1").await.is_err());
        model.suspend("vm1").await.unwrap();
        assert!(model.suspend("vm1").await.is_err());
        model.resume("vm1").await.unwrap();
        model.shutdown("vm1").await.unwrap();
        assert_eq!(
            driver.domain_info("vm1").await.unwrap().state,
            DomainState::Shutoff
        );
        assert!(model.poweroff("vm1").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_updates_serialize_per_vm() {
        let (_driver, model) = setup().await;
        create_vm(&model, "vm1").await;

        let a = {
            let model = model.clone();
            tokio::spawn(async move {
                model.update("vm1", &params(&[("users", json!(["admin"]))])).await
            })
        };
        let b = {
            let model = model.clone();
            tokio::spawn(async move {
                model.update("vm1", &params(&[("groups", json!(["kvm"]))])).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let view = model.lookup("vm1").await.unwrap();
        // The updates serialize and each one-sided write carries the other
        // list forward, so both land regardless of order.
        assert_eq!(view.users, vec!["admin"]);
        assert_eq!(view.groups, vec!["kvm"]);
    }
}
