//! Install manifest model.
//!
//! An install manifest (`install.json`) is a shipped, signed description of
//! the targets a device should run. It is decoded only after its signature
//! and certificate chain have been verified; see [`crate::trust`].

use std::collections::HashSet;
use std::path::Path;

use machina_core::{MachinaError, Result};
use serde::{Deserialize, Serialize};

/// Newest install manifest schema version this engine understands.
pub const CURRENT_MANIFEST_VERSION: u32 = 1;

/// Shipped image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Iso,
    Zap,
}

impl Default for ImageType {
    fn default() -> Self {
        Self::Zap
    }
}

/// Storage driver the targets are imported into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Atomfs,
}

impl Default for StorageType {
    fn default() -> Self {
        Self::Atomfs
    }
}

/// Update merge policy.
///
/// A full update replaces every existing target; a partial update replaces
/// same-named targets and leaves the rest of the system untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    #[serde(rename = "partial")]
    Partial,
    #[serde(rename = "complete")]
    Full,
}

impl Default for UpdateType {
    fn default() -> Self {
        Self::Partial
    }
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Partial => write!(f, "partial"),
            Self::Full => write!(f, "complete"),
        }
    }
}

/// How a target is run once installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Hostfs,
    Container,
    FsOnly,
}

/// Target network mode. Only host networking is supported right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Host,
    None,
}

impl Default for NetworkType {
    fn default() -> Self {
        Self::None
    }
}

/// Network configuration for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetNetwork {
    #[serde(rename = "type")]
    pub net_type: NetworkType,
}

/// One installable unit named within a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Name of the target, unique within a manifest
    pub service_name: String,
    /// Image repository path used to locate the image
    #[serde(default)]
    pub imagepath: String,
    /// Image version tag
    pub version: String,
    pub service_type: ServiceType,
    #[serde(default)]
    pub network: TargetNetwork,
    /// Namespace group; empty or "none" means no identifier mapping
    #[serde(default)]
    pub nsgroup: String,
    /// Content digest of the image's layer blob (`sha256:<hex>`)
    pub digest: String,
    /// Byte size of that blob
    pub size: i64,
}

impl Target {
    /// Whether this target requires a uid/gid identifier-map allocation.
    pub fn needs_idmap(&self) -> bool {
        !self.nsgroup.is_empty() && self.nsgroup != "none"
    }
}

/// A shipped, signed install manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallManifest {
    pub version: u32,
    #[serde(default)]
    pub image_type: ImageType,
    pub product: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub update_type: UpdateType,
    #[serde(default)]
    pub storage_type: StorageType,
}

impl InstallManifest {
    /// Decode a manifest from raw JSON bytes without any trust checks.
    ///
    /// Callers that need a trusted manifest go through
    /// [`crate::trust::verify_manifest`] instead.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MachinaError::MalformedData(format!("undecodable install manifest: {e}")))
    }

    /// Decode a manifest from a file on disk without any trust checks.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    /// Structural validation: schema version, product, and per-target checks.
    pub fn validate(&self) -> Result<()> {
        if self.product.is_empty() {
            return Err(MachinaError::Policy("manifest must specify a product".into()));
        }

        if self.version < 1 || self.version > CURRENT_MANIFEST_VERSION {
            return Err(MachinaError::Policy(format!(
                "unsupported install manifest version: {} (supported: 1..={})",
                self.version, CURRENT_MANIFEST_VERSION
            )));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            target_valid(target)?;
            if !seen.insert(target.service_name.as_str()) {
                return Err(MachinaError::Policy(format!(
                    "duplicate target name {:?} in manifest",
                    target.service_name
                )));
            }
        }

        Ok(())
    }
}

fn target_valid(target: &Target) -> Result<()> {
    if target.service_name.is_empty() {
        return Err(MachinaError::Policy(
            "target field 'service_name' cannot be empty".into(),
        ));
    }
    if target.version.is_empty() {
        return Err(MachinaError::Policy(format!(
            "target {} cannot have an empty version",
            target.service_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target(name: &str) -> Target {
        Target {
            service_name: name.to_string(),
            imagepath: "machina/images".to_string(),
            version: "1.0.0".to_string(),
            service_type: ServiceType::Hostfs,
            network: TargetNetwork::default(),
            nsgroup: "none".to_string(),
            digest: "sha256:aaa".to_string(),
            size: 1_048_576,
        }
    }

    fn sample_manifest() -> InstallManifest {
        InstallManifest {
            version: 1,
            image_type: ImageType::Zap,
            product: "de6c82c5-2e01-4c92-949b-a6545d30fc06".to_string(),
            targets: vec![sample_target("hostfs")],
            update_type: UpdateType::Full,
            storage_type: StorageType::Atomfs,
        }
    }

    #[test]
    fn test_decode_install_json() {
        let json = r#"{
            "version": 1,
            "image_type": "zap",
            "product": "de6c82c5-2e01-4c92-949b-a6545d30fc06",
            "update_type": "complete",
            "storage_type": "atomfs",
            "targets": [{
                "service_name": "hostfs",
                "imagepath": "machina/images",
                "version": "1.0.0",
                "service_type": "hostfs",
                "network": {"type": "none"},
                "nsgroup": "none",
                "digest": "sha256:aaa",
                "size": 1048576
            }]
        }"#;
        let manifest = InstallManifest::from_slice(json.as_bytes()).unwrap();
        assert_eq!(manifest.update_type, UpdateType::Full);
        assert_eq!(manifest.targets.len(), 1);
        assert_eq!(manifest.targets[0].service_name, "hostfs");
        assert_eq!(manifest.targets[0].network.net_type, NetworkType::None);
        manifest.validate().unwrap();
    }

    #[test]
    fn test_update_type_defaults_to_partial() {
        let json = r#"{"version": 1, "product": "p", "targets": []}"#;
        let manifest = InstallManifest::from_slice(json.as_bytes()).unwrap();
        assert_eq!(manifest.update_type, UpdateType::Partial);
    }

    #[test]
    fn test_undecodable_manifest_is_malformed() {
        let err = InstallManifest::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, MachinaError::MalformedData(_)));
    }

    #[test]
    fn test_validate_empty_product() {
        let mut manifest = sample_manifest();
        manifest.product.clear();
        assert!(matches!(
            manifest.validate().unwrap_err(),
            MachinaError::Policy(_)
        ));
    }

    #[test]
    fn test_validate_unsupported_version() {
        let mut manifest = sample_manifest();
        manifest.version = CURRENT_MANIFEST_VERSION + 1;
        assert!(manifest.validate().is_err());

        manifest.version = 0;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_empty_target_name() {
        let mut manifest = sample_manifest();
        manifest.targets[0].service_name.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_empty_target_version() {
        let mut manifest = sample_manifest();
        manifest.targets[0].version.clear();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_target_names() {
        let mut manifest = sample_manifest();
        manifest.targets.push(sample_target("hostfs"));
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_needs_idmap() {
        let mut target = sample_target("svc");
        assert!(!target.needs_idmap());

        target.nsgroup = String::new();
        assert!(!target.needs_idmap());

        target.nsgroup = "ran".to_string();
        assert!(target.needs_idmap());
    }

    #[test]
    fn test_unknown_network_type_rejected() {
        let json = r#"{
            "version": 1,
            "product": "p",
            "targets": [{
                "service_name": "svc",
                "version": "1.0",
                "service_type": "container",
                "network": {"type": "bridge"},
                "digest": "sha256:aaa",
                "size": 1
            }]
        }"#;
        assert!(InstallManifest::from_slice(json.as_bytes()).is_err());
    }

    #[test]
    fn test_update_type_wire_names() {
        assert_eq!(serde_json::to_string(&UpdateType::Full).unwrap(), "\"complete\"");
        assert_eq!(serde_json::to_string(&UpdateType::Partial).unwrap(), "\"partial\"");
    }
}
