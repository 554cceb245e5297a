//! Named descriptor fields.
//!
//! The engine's update path works off a fixed table of editable fields
//! rather than free-form paths: each request key maps to one
//! [`DescriptorField`], and anything outside the table is rejected before
//! the descriptor is touched.

use crate::error::{EngineError, Result};

use super::{DomainDescriptor, SizedElement};

/// A descriptor field the engine is allowed to edit offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorField {
    /// `./name`
    Name,
    /// `./vcpu` text
    VcpuCount,
    /// `./memory` in KiB
    MemoryKib,
    /// `./currentMemory` in KiB
    CurrentMemoryKib,
    /// `./devices/graphics/@passwd`
    GraphicsPassword,
    /// `./devices/graphics/@passwdValidTo`
    GraphicsPasswordValidTo,
}

impl DescriptorField {
    /// The element path this field edits, mirroring the descriptor layout.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Name => "./name",
            Self::VcpuCount => "./vcpu",
            Self::MemoryKib => "./memory",
            Self::CurrentMemoryKib => "./currentMemory",
            Self::GraphicsPassword => "./devices/graphics/@passwd",
            Self::GraphicsPasswordValidTo => "./devices/graphics/@passwdValidTo",
        }
    }

    /// Read the field's current value as a string, if present.
    pub fn get(&self, desc: &DomainDescriptor) -> Option<String> {
        match self {
            Self::Name => Some(desc.name.clone()),
            Self::VcpuCount => Some(desc.vcpu.count.to_string()),
            Self::MemoryKib => Some(desc.memory.value.to_string()),
            Self::CurrentMemoryKib => {
                desc.current_memory.as_ref().map(|m| m.value.to_string())
            }
            Self::GraphicsPassword => {
                desc.primary_graphics().and_then(|g| g.password.clone())
            }
            Self::GraphicsPasswordValidTo => desc
                .primary_graphics()
                .and_then(|g| g.password_valid_to.clone()),
        }
    }

    /// Write the field. Numeric fields validate their input here so the
    /// descriptor never holds a half-applied value.
    pub fn set(&self, desc: &mut DomainDescriptor, value: &str) -> Result<()> {
        match self {
            Self::Name => {
                desc.name = value.to_string();
            }
            Self::VcpuCount => {
                let count = parse_positive(value, "vcpu count")?;
                desc.vcpu.count = count as u32;
            }
            Self::MemoryKib => {
                let kib = parse_positive(value, "memory")?;
                desc.memory = SizedElement::kib(kib);
            }
            Self::CurrentMemoryKib => {
                let kib = parse_positive(value, "current memory")?;
                desc.current_memory = Some(SizedElement::kib(kib));
            }
            Self::GraphicsPassword => {
                let graphics = desc.primary_graphics_mut().ok_or_else(|| {
                    EngineError::InvalidOperation(
                        "VM has no graphics device".to_string(),
                    )
                })?;
                if value.is_empty() {
                    graphics.password = None;
                } else {
                    graphics.password = Some(value.to_string());
                }
            }
            Self::GraphicsPasswordValidTo => {
                let graphics = desc.primary_graphics_mut().ok_or_else(|| {
                    EngineError::InvalidOperation(
                        "VM has no graphics device".to_string(),
                    )
                })?;
                graphics.password_valid_to = Some(value.to_string());
            }
        }
        Ok(())
    }
}

fn parse_positive(value: &str, what: &str) -> Result<u64> {
    let n: u64 = value.parse().map_err(|_| {
        EngineError::InvalidParameter(format!("{what} must be a positive integer, got '{value}'"))
    })?;
    if n == 0 {
        return Err(EngineError::InvalidParameter(format!(
            "{what} must be greater than zero"
        )));
    }
    Ok(n)
}
