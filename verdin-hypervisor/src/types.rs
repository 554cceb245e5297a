//! Shared driver-facing types.

use serde::{Deserialize, Serialize};

/// Domain run state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Map a raw driver state code. Unknown codes report as `NoState`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => DomainState::Running,
            2 => DomainState::Blocked,
            3 => DomainState::Paused,
            4 => DomainState::Shutdown,
            5 => DomainState::Shutoff,
            6 => DomainState::Crashed,
            7 => DomainState::PmSuspended,
            _ => DomainState::NoState,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Blocked)
    }
}

impl std::fmt::Display for DomainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of a domain's runtime numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub vcpus: u32,
    /// Cumulative guest CPU time in nanoseconds.
    pub cpu_time_ns: u64,
}

/// Where a device change applies.
///
/// `live` touches the running guest, `persistent` the stored descriptor.
/// For a running domain both are set so the change survives the next boot;
/// for a stopped one only the descriptor can change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFlags {
    pub live: bool,
    pub persistent: bool,
}

impl DeviceFlags {
    pub fn for_state(running: bool) -> Self {
        Self { live: running, persistent: true }
    }

    pub const PERSISTENT_ONLY: DeviceFlags = DeviceFlags { live: false, persistent: true };
}

/// One snapshot in a domain's snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    /// Parent snapshot name; `None` for roots.
    pub parent: Option<String>,
    /// Whether this is the domain's current snapshot.
    pub current: bool,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Full snapshot definition, opaque to the engine.
    pub xml: String,
}

/// Storage pool backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Dir,
    Netfs,
    Logical,
    Scsi,
    Iscsi,
    Mpath,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Dir => "dir",
            PoolKind::Netfs => "netfs",
            PoolKind::Logical => "logical",
            PoolKind::Scsi => "scsi",
            PoolKind::Iscsi => "iscsi",
            PoolKind::Mpath => "mpath",
        }
    }

    /// Pools whose volumes the engine must never create or delete.
    pub fn is_read_only(&self) -> bool {
        matches!(self, PoolKind::Scsi | PoolKind::Iscsi | PoolKind::Mpath)
    }

    /// Whether new volumes for clones may land here. SCSI-family pools
    /// expose pre-existing LUNs, not allocatable space.
    pub fn supports_volume_create(&self) -> bool {
        !self.is_read_only()
    }
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PoolKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dir" => Ok(PoolKind::Dir),
            "netfs" => Ok(PoolKind::Netfs),
            "logical" => Ok(PoolKind::Logical),
            "scsi" => Ok(PoolKind::Scsi),
            "iscsi" => Ok(PoolKind::Iscsi),
            "mpath" => Ok(PoolKind::Mpath),
            other => Err(format!("unknown pool type '{other}'")),
        }
    }
}

/// Storage pool status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub name: String,
    pub kind: PoolKind,
    pub capacity: u64,
    pub available: u64,
    pub active: bool,
}

/// One storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub pool: String,
    pub path: String,
    pub capacity: u64,
    pub allocation: u64,
    pub format: String,
}

/// Parameters for creating a fresh volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity: u64,
    pub format: String,
}

/// Network interface counters, cumulative since domain start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Block device counters, cumulative since domain start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounters {
    pub rd_bytes: u64,
    pub wr_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_map() {
        assert_eq!(DomainState::from_code(1), DomainState::Running);
        assert_eq!(DomainState::from_code(5), DomainState::Shutoff);
        assert_eq!(DomainState::from_code(42), DomainState::NoState);
        assert_eq!(DomainState::Running.as_str(), "running");
    }

    #[test]
    fn readonly_pools() {
        assert!(PoolKind::Iscsi.is_read_only());
        assert!(PoolKind::Mpath.is_read_only());
        assert!(!PoolKind::Dir.is_read_only());
        assert!(PoolKind::Netfs.supports_volume_create());
    }
}
