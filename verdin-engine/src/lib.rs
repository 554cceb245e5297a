//! # Verdin Engine
//!
//! The management layer proper: VM lifecycle and updates, storage volume
//! coordination, device attachment, templates, runtime stats and the async
//! task registry. Everything runs against the [`verdin_hypervisor`] driver
//! abstraction, so the whole engine works unchanged on the mock driver.
//!
//! [`vms::VmsModel`] is the root object; it owns the other pieces and is
//! what a serving layer would wire its routes to.

pub mod devices;
pub mod host;
pub mod objstore;
pub mod rollback;
pub mod stats;
pub mod storage;
pub mod tasks;
pub mod templates;
pub mod vms;

pub use devices::DevicesModel;
pub use objstore::ObjectStore;
pub use stats::{StatsTracker, VmStats};
pub use storage::StorageCoordinator;
pub use tasks::{TaskManager, TaskRecord, TaskStatus};
pub use templates::{TemplateCatalog, VmTemplate};
pub use vms::{VmCreateParams, VmView, VmsModel};
