//! Driver abstraction.
//!
//! `VirtDriver` is the seam between the engine and whatever actually runs
//! the guests. The in-memory [`crate::mock::MockDriver`] implements it for
//! tests and development; the `libvirt` feature adds a real backend.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    BlockCounters, DeviceFlags, DomainInfo, InterfaceCounters, PoolState,
    SnapshotRecord, VolumeRecord, VolumeSpec,
};

/// Hypervisor driver interface.
///
/// Domains are addressed by name throughout; the engine guarantees names
/// are unique. Device fragments and snapshot definitions cross this
/// boundary as XML strings so driver-specific detail stays out of the
/// engine.
#[async_trait]
pub trait VirtDriver: Send + Sync {
    // --- domain inventory -------------------------------------------------

    /// Names of all defined domains, running or not.
    async fn list_domains(&self) -> Result<Vec<String>>;

    async fn domain_exists(&self, name: &str) -> Result<bool>;

    /// Define a new persistent domain from its descriptor XML.
    async fn define_domain(&self, xml: &str) -> Result<()>;

    /// Overwrite the persistent definition of an existing domain. The
    /// descriptor's name selects the domain; the running state, snapshots
    /// and metadata are untouched.
    async fn redefine_domain(&self, xml: &str) -> Result<()>;

    /// Remove the persistent definition. The domain must be shut off.
    async fn undefine_domain(&self, name: &str) -> Result<()>;

    /// Current descriptor XML. For running domains this reflects the live
    /// configuration.
    async fn domain_xml(&self, name: &str) -> Result<String>;

    async fn domain_uuid(&self, name: &str) -> Result<String>;

    async fn domain_info(&self, name: &str) -> Result<DomainInfo>;

    async fn is_persistent(&self, name: &str) -> Result<bool>;

    // --- lifecycle --------------------------------------------------------

    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Hard power-off.
    async fn destroy_domain(&self, name: &str) -> Result<()>;

    /// Graceful ACPI shutdown request; returns once the request is sent.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Hard reset without a full stop/start cycle.
    async fn reset_domain(&self, name: &str) -> Result<()>;

    async fn suspend_domain(&self, name: &str) -> Result<()>;

    async fn resume_domain(&self, name: &str) -> Result<()>;

    // --- devices ----------------------------------------------------------

    async fn attach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags)
        -> Result<()>;

    async fn detach_device(&self, name: &str, device_xml: &str, flags: DeviceFlags)
        -> Result<()>;

    /// Update an existing device in place (CD-ROM media change).
    async fn update_device(&self, name: &str, device_xml: &str, flags: DeviceFlags)
        -> Result<()>;

    /// Live vCPU count change on a running domain.
    async fn set_vcpus_live(&self, name: &str, count: u32) -> Result<()>;

    // --- metadata ---------------------------------------------------------

    /// Fetch a metadata fragment by key under the given namespace.
    /// `Ok(None)` when the key has never been written.
    async fn domain_metadata(&self, name: &str, namespace: &str, key: &str)
        -> Result<Option<String>>;

    /// Store (or overwrite) a metadata fragment. `None` removes the key.
    async fn set_domain_metadata(
        &self,
        name: &str,
        namespace: &str,
        key: &str,
        fragment_xml: Option<&str>,
    ) -> Result<()>;

    // --- snapshots --------------------------------------------------------

    /// All snapshots of a domain. Drivers without snapshot support return
    /// `EngineError::Unsupported`.
    async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotRecord>>;

    async fn create_snapshot(&self, name: &str, snapshot_name: &str) -> Result<()>;

    /// Re-register a snapshot from its stored definition, optionally marking
    /// it current. Used to carry snapshot trees across a rename.
    async fn redefine_snapshot(&self, name: &str, xml: &str, current: bool) -> Result<()>;

    /// Delete a snapshot. With `children` the whole subtree goes; with
    /// `metadata_only` the on-disk state is left alone.
    async fn delete_snapshot(
        &self,
        name: &str,
        snapshot_name: &str,
        children: bool,
        metadata_only: bool,
    ) -> Result<()>;

    // --- stats ------------------------------------------------------------

    async fn interface_counters(&self, name: &str, dev: &str) -> Result<InterfaceCounters>;

    async fn block_counters(&self, name: &str, dev: &str) -> Result<BlockCounters>;

    /// PPM screenshot of the primary display.
    async fn screenshot(&self, name: &str) -> Result<Vec<u8>>;

    // --- host capabilities ------------------------------------------------

    /// Maximum vCPUs the hypervisor supports per guest.
    async fn hypervisor_max_vcpus(&self) -> Result<u32>;

    /// Whether the hypervisor accepts memory device hot-add.
    async fn supports_memory_hotplug(&self) -> Result<bool>;

    /// Remote display protocols the host can stream.
    async fn stream_protocols(&self) -> Result<Vec<String>>;

    // --- storage pools and volumes ---------------------------------------

    async fn list_pools(&self) -> Result<Vec<String>>;

    async fn pool_state(&self, pool: &str) -> Result<PoolState>;

    async fn list_volumes(&self, pool: &str) -> Result<Vec<String>>;

    async fn volume_record(&self, pool: &str, volume: &str) -> Result<VolumeRecord>;

    /// Look a volume up by its path, across all pools.
    async fn volume_by_path(&self, path: &str) -> Result<VolumeRecord>;

    async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeRecord>;

    /// Copy an existing volume into `dest_pool` under a new name.
    async fn clone_volume(
        &self,
        src_pool: &str,
        src_volume: &str,
        dest_pool: &str,
        dest_name: &str,
    ) -> Result<VolumeRecord>;

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()>;
}
