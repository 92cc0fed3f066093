use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Device configuration for install/update operations.
///
/// Describes where persisted system state lives and which trust anchor
/// install manifests are verified against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Directory holding the persisted system manifest and install files
    pub config_dir: PathBuf,

    /// Directory under which the content-addressed image store is kept
    pub store_dir: PathBuf,

    /// Path to the manifest CA certificate (trust anchor)
    pub ca_path: PathBuf,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/config"),
            store_dir: PathBuf::from("/image-store"),
            ca_path: PathBuf::from("/factory/secure/manifestCA.pem"),
        }
    }
}

impl MachineConfig {
    /// Build a configuration from explicit paths.
    pub fn new(
        config_dir: impl Into<PathBuf>,
        store_dir: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            store_dir: store_dir.into(),
            ca_path: ca_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let cfg = MachineConfig::default();
        assert_eq!(cfg.config_dir, PathBuf::from("/config"));
        assert_eq!(cfg.store_dir, PathBuf::from("/image-store"));
        assert_eq!(cfg.ca_path, PathBuf::from("/factory/secure/manifestCA.pem"));
    }

    #[test]
    fn test_explicit_paths() {
        let cfg = MachineConfig::new("/tmp/config", "/tmp/store", "/tmp/ca.pem");
        assert_eq!(cfg.store_dir, PathBuf::from("/tmp/store"));
    }
}
