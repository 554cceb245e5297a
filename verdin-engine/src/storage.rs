//! Storage volume coordinator.
//!
//! Sits between the engine and the driver's pool/volume calls: enforces
//! the read-only pool rules, applies the clone pool fallback policy, and
//! keeps the object store's used-by lists in step with attachments.

use std::sync::Arc;

use tracing::{info, instrument};

use verdin_hypervisor::error::{EngineError, Result};
use verdin_hypervisor::{PoolState, VirtDriver, VolumeRecord, VolumeSpec};

use crate::objstore::ObjectStore;

/// A volume plus the VMs currently holding it.
#[derive(Debug, Clone)]
pub struct VolumeView {
    pub record: VolumeRecord,
    pub used_by: Vec<String>,
}

pub struct StorageCoordinator {
    driver: Arc<dyn VirtDriver>,
    store: Arc<ObjectStore>,
    default_pool: String,
}

impl StorageCoordinator {
    pub fn new(
        driver: Arc<dyn VirtDriver>,
        store: Arc<ObjectStore>,
        default_pool: impl Into<String>,
    ) -> Self {
        Self { driver, store, default_pool: default_pool.into() }
    }

    pub fn default_pool(&self) -> &str {
        &self.default_pool
    }

    async fn writable_pool(&self, pool: &str) -> Result<PoolState> {
        let state = self.driver.pool_state(pool).await?;
        if !state.active {
            return Err(EngineError::InvalidOperation(format!(
                "pool '{pool}' is not active"
            )));
        }
        if state.kind.is_read_only() {
            return Err(EngineError::InvalidOperation(format!(
                "pool '{pool}' ({}) cannot host created volumes",
                state.kind
            )));
        }
        Ok(state)
    }

    /// Where a clone of a volume from `src_pool` should land.
    ///
    /// SCSI-family sources go straight to the default pool. Otherwise the
    /// source pool is preferred when it has room, the default pool is the
    /// fallback, and with room in neither the clone is refused.
    pub async fn choose_clone_pool(&self, src_pool: &str, needed: u64) -> Result<String> {
        let src = self.driver.pool_state(src_pool).await?;
        if src.kind.is_read_only() {
            return Ok(self.default_pool.clone());
        }
        if src.available >= needed {
            return Ok(src_pool.to_string());
        }
        if src_pool != self.default_pool {
            let default = self.driver.pool_state(&self.default_pool).await?;
            if !default.kind.is_read_only() && default.available >= needed {
                return Ok(self.default_pool.clone());
            }
        }
        Err(EngineError::InvalidOperation(format!(
            "no pool has {needed} bytes free for a clone of a volume in '{src_pool}'"
        )))
    }

    #[instrument(skip(self, spec), fields(pool = %pool, volume = %spec.name))]
    pub async fn create_volume(&self, pool: &str, spec: &VolumeSpec) -> Result<VolumeRecord> {
        let state = self.writable_pool(pool).await?;
        if state.available < spec.capacity {
            return Err(EngineError::InvalidOperation(format!(
                "pool '{pool}' has {} bytes free, volume needs {}",
                state.available, spec.capacity
            )));
        }
        self.driver.create_volume(pool, spec).await
    }

    /// Clone a volume, choosing the destination pool per the fallback
    /// policy. Synchronous; callers wanting progress wrap it in a task.
    #[instrument(skip(self), fields(src = %src_volume, dest = %dest_name))]
    pub async fn clone_volume(
        &self,
        src_pool: &str,
        src_volume: &str,
        dest_name: &str,
    ) -> Result<VolumeRecord> {
        let src = self.driver.volume_record(src_pool, src_volume).await?;
        let dest_pool = self.choose_clone_pool(src_pool, src.capacity).await?;
        let record = self
            .driver
            .clone_volume(src_pool, src_volume, &dest_pool, dest_name)
            .await?;
        info!(
            src = %src_volume,
            dest_pool = %dest_pool,
            dest = %dest_name,
            "volume cloned"
        );
        Ok(record)
    }

    pub async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        self.writable_pool(pool).await?;
        let record = self.driver.volume_record(pool, volume).await?;
        let holders = self.store.volume_used_by(&record.path).await;
        if !holders.is_empty() {
            return Err(EngineError::InvalidOperation(format!(
                "volume '{volume}' is in use by {}",
                holders.join(", ")
            )));
        }
        self.driver.delete_volume(pool, volume).await
    }

    pub async fn lookup_volume(&self, pool: &str, volume: &str) -> Result<VolumeView> {
        let record = self.driver.volume_record(pool, volume).await?;
        let used_by = self.store.volume_used_by(&record.path).await;
        Ok(VolumeView { record, used_by })
    }

    pub async fn volume_by_path(&self, path: &str) -> Result<VolumeRecord> {
        self.driver.volume_by_path(path).await
    }

    /// Number of VMs holding the volume at `path`.
    pub async fn ref_count(&self, path: &str) -> usize {
        self.store.volume_used_by(path).await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdin_hypervisor::{MockDriver, PoolKind};

    const GIB: u64 = 1024 * 1024 * 1024;

    async fn setup() -> (Arc<MockDriver>, StorageCoordinator) {
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(ObjectStore::in_memory());
        let coordinator = StorageCoordinator::new(driver.clone(), store, "default");
        (driver, coordinator)
    }

    #[tokio::test]
    async fn scsi_source_goes_to_default() {
        let (driver, coordinator) = setup().await;
        driver.add_pool("luns", PoolKind::Iscsi, 0).await;
        let pool = coordinator.choose_clone_pool("luns", GIB).await.unwrap();
        assert_eq!(pool, "default");
    }

    #[tokio::test]
    async fn source_pool_preferred_when_it_fits() {
        let (driver, coordinator) = setup().await;
        driver.add_pool("fast", PoolKind::Dir, 10 * GIB).await;
        let pool = coordinator.choose_clone_pool("fast", GIB).await.unwrap();
        assert_eq!(pool, "fast");
    }

    #[tokio::test]
    async fn default_is_fallback_then_failure() {
        let (driver, coordinator) = setup().await;
        driver.add_pool("tiny", PoolKind::Dir, GIB / 2).await;
        let pool = coordinator.choose_clone_pool("tiny", GIB).await.unwrap();
        assert_eq!(pool, "default");

        // 200 GiB fits nowhere.
        let err = coordinator
            .choose_clone_pool("tiny", 200 * GIB)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn delete_refuses_held_volume() {
        let (driver, coordinator) = setup().await;
        let spec = VolumeSpec { name: "a.img".into(), capacity: GIB, format: "qcow2".into() };
        let record = coordinator.create_volume("default", &spec).await.unwrap();
        coordinator
            .store
            .volume_add_user(&record.path, "vm1")
            .await
            .unwrap();
        let err = coordinator.delete_volume("default", "a.img").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
        assert_eq!(coordinator.ref_count(&record.path).await, 1);

        coordinator
            .store
            .volume_remove_user(&record.path, "vm1")
            .await
            .unwrap();
        coordinator.delete_volume("default", "a.img").await.unwrap();
        assert!(driver.volume_record("default", "a.img").await.is_err());
    }

    #[tokio::test]
    async fn create_checks_capacity_up_front() {
        let (_driver, coordinator) = setup().await;
        let spec = VolumeSpec {
            name: "big.img".into(),
            capacity: 500 * GIB,
            format: "qcow2".into(),
        };
        let err = coordinator.create_volume("default", &spec).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
    }
}
