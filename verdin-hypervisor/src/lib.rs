//! # Verdin Hypervisor
//!
//! Driver layer for the Verdin VM manager: the `VirtDriver` trait, the
//! typed domain descriptor, the host capability probe, and two driver
//! implementations.
//!
//! ## Drivers
//!
//! - `MockDriver` - in-memory, always available, used in tests and on
//!   hosts without a hypervisor
//! - `LibvirtDriver` - real libvirt/QEMU backend, behind the `libvirt`
//!   feature
//!
//! ## Example
//!
//! ```rust
//! use verdin_hypervisor::{MockDriver, VirtDriver};
//!
//! # async fn demo() -> verdin_hypervisor::Result<()> {
//! let driver = MockDriver::new();
//! let domains = driver.list_domains().await?;
//! assert!(domains.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod caps;
pub mod descriptor;
pub mod error;
pub mod mock;
pub mod traits;
pub mod types;

#[cfg(feature = "libvirt")]
pub mod libvirt;

pub use caps::Capabilities;
pub use error::{EngineError, Result};
pub use mock::MockDriver;
pub use traits::VirtDriver;
pub use types::{
    BlockCounters, DeviceFlags, DomainInfo, DomainState, InterfaceCounters, PoolKind,
    PoolState, SnapshotRecord, VolumeRecord, VolumeSpec,
};

#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtDriver;
