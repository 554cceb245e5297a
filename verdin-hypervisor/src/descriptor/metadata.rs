//! Engine-owned metadata fragments.
//!
//! Besides the descriptor proper, each domain carries a small metadata block
//! under a private namespace. The fragments here never influence how the
//! driver runs the guest; they record bookkeeping the engine wants persisted
//! alongside the domain (OS hints, access control, display name). Each
//! fragment lives under its own key so they can be rewritten independently.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Namespace URI for all engine metadata fragments.
pub const METADATA_NAMESPACE: &str = "urn:verdin:1.0";

/// Metadata key for [`OsMetadata`].
pub const METADATA_KEY_OS: &str = "os";
/// Metadata key for [`AccessMetadata`].
pub const METADATA_KEY_ACCESS: &str = "access";
/// Metadata key for [`NameMetadata`].
pub const METADATA_KEY_NAME: &str = "name";

/// `<os distro='...' version='...'/>` - guest OS hint recorded at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "os")]
pub struct OsMetadata {
    #[serde(rename = "@distro")]
    pub distro: String,
    #[serde(rename = "@version")]
    pub version: String,
}

/// `<access><user>..</user><group>..</group></access>` - users and groups
/// allowed to manage the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "access")]
pub struct AccessMetadata {
    #[serde(rename = "user", default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
    #[serde(rename = "group", default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// `<name>..</name>` - display name decoupled from the domain name, kept
/// across renames of the underlying domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "name")]
pub struct NameMetadata {
    #[serde(rename = "$text")]
    pub value: String,
}

/// Serialize a metadata fragment to the XML the driver stores verbatim.
pub fn fragment_to_xml<T: Serialize>(fragment: &T) -> Result<String> {
    quick_xml::se::to_string(fragment)
        .map_err(|e| EngineError::failed("metadata serialize", e))
}

/// Parse a stored metadata fragment.
pub fn fragment_from_xml<'de, T: Deserialize<'de>>(xml: &'de str) -> Result<T> {
    quick_xml::de::from_str(xml).map_err(|e| EngineError::failed("metadata parse", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_fragment_round_trip() {
        let os = OsMetadata { distro: "fedora".to_string(), version: "40".to_string() };
        let xml = fragment_to_xml(&os).unwrap();
        assert!(xml.contains("distro=\"fedora\""));
        let parsed: OsMetadata = fragment_from_xml(&xml).unwrap();
        assert_eq!(parsed, os);
    }

    #[test]
    fn access_fragment_lists_users_and_groups() {
        let access = AccessMetadata {
            users: vec!["alice".to_string(), "bob".to_string()],
            groups: vec!["ops".to_string()],
        };
        let xml = fragment_to_xml(&access).unwrap();
        let parsed: AccessMetadata = fragment_from_xml(&xml).unwrap();
        assert_eq!(parsed.users.len(), 2);
        assert_eq!(parsed.groups, vec!["ops"]);
    }

    #[test]
    fn empty_access_round_trips() {
        let access = AccessMetadata::default();
        let xml = fragment_to_xml(&access).unwrap();
        let parsed: AccessMetadata = fragment_from_xml(&xml).unwrap();
        assert!(parsed.users.is_empty() && parsed.groups.is_empty());
    }
}
