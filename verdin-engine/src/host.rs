//! Host facade.
//!
//! Two small traits keep host-OS details out of the engine: `HostOps` for
//! filesystem and architecture queries, `HostIdentity` for the user/group
//! catalog backing access-metadata validation. The unix implementations
//! shell out or read the standard files; the in-memory ones serve tests.

use async_trait::async_trait;
use tracing::{debug, warn};

use verdin_hypervisor::error::{EngineError, Result};

#[async_trait]
pub trait HostOps: Send + Sync {
    /// Host machine architecture (`x86_64`, `ppc64le`, ...).
    fn arch(&self) -> &str;

    /// Make `path` readable by the hypervisor user. Used for CD-ROM ISO
    /// sources before boot.
    async fn ensure_readable(&self, path: &str) -> Result<()>;
}

#[async_trait]
pub trait HostIdentity: Send + Sync {
    async fn user_exists(&self, name: &str) -> Result<bool>;
    async fn group_exists(&self, name: &str) -> Result<bool>;
}

/// Real host implementation.
pub struct UnixHost {
    arch: String,
    hypervisor_user: String,
}

impl UnixHost {
    pub fn new(hypervisor_user: impl Into<String>) -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            hypervisor_user: hypervisor_user.into(),
        }
    }
}

impl Default for UnixHost {
    fn default() -> Self {
        Self::new("qemu")
    }
}

#[async_trait]
impl HostOps for UnixHost {
    fn arch(&self) -> &str {
        &self.arch
    }

    async fn ensure_readable(&self, path: &str) -> Result<()> {
        let entry = format!("u:{}:r", self.hypervisor_user);
        let output = tokio::process::Command::new("setfacl")
            .args(["--modify", &entry, path])
            .output()
            .await
            .map_err(|e| EngineError::failed("setfacl", e))?;
        if !output.status.success() {
            // Not every filesystem supports ACLs; the guest may still boot.
            warn!(
                path = %path,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "setfacl failed"
            );
        } else {
            debug!(path = %path, user = %self.hypervisor_user, "granted read access");
        }
        Ok(())
    }
}

#[async_trait]
impl HostIdentity for UnixHost {
    async fn user_exists(&self, name: &str) -> Result<bool> {
        entry_exists("/etc/passwd", name).await
    }

    async fn group_exists(&self, name: &str) -> Result<bool> {
        entry_exists("/etc/group", name).await
    }
}

async fn entry_exists(file: &str, name: &str) -> Result<bool> {
    let content = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| EngineError::failed("identity lookup", e))?;
    Ok(content
        .lines()
        .filter_map(|l| l.split(':').next())
        .any(|n| n == name))
}

/// Fixed catalog for tests.
pub struct StaticHost {
    pub arch: String,
    pub users: Vec<String>,
    pub groups: Vec<String>,
}

impl Default for StaticHost {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            users: vec!["root".to_string(), "admin".to_string()],
            groups: vec!["root".to_string(), "kvm".to_string()],
        }
    }
}

#[async_trait]
impl HostOps for StaticHost {
    fn arch(&self) -> &str {
        &self.arch
    }

    async fn ensure_readable(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl HostIdentity for StaticHost {
    async fn user_exists(&self, name: &str) -> Result<bool> {
        Ok(self.users.iter().any(|u| u == name))
    }

    async fn group_exists(&self, name: &str) -> Result<bool> {
        Ok(self.groups.iter().any(|g| g == name))
    }
}
