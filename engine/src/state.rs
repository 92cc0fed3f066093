//! Persistent system state and target reconciliation.
//!
//! The system manifest (`manifest.json` under the config dir) records which
//! targets the device currently runs, which signed install manifest each one
//! came from, and the uid/gid identifier-map allocations handed out to
//! namespace groups. Reconciliation merges a verified set of incoming
//! targets into that state according to the update type.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use machina_core::{MachinaError, Result};
use oci_spec::image::{ImageConfiguration, ImageManifest};
use serde::{Deserialize, Serialize};

use crate::manifest::{InstallManifest, Target, UpdateType};
use crate::storage::BlobStore;

/// First host id handed out to a namespace group.
pub const IDMAP_BASE: i64 = 100_000;
/// Host ids reserved per namespace group.
pub const IDMAP_RANGE: i64 = 65_536;

/// A uid/gid range allocation for one namespace group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapSet {
    /// Namespace group name
    #[serde(rename = "idmap-name")]
    pub name: String,
    /// First host id of the group's range
    pub hostid: i64,
}

/// A target as recorded in the system manifest.
///
/// `source` names the install manifest the target came from, by manifest
/// digest hex; the full target definition is re-read from that staged
/// manifest on load. `raw` is only meaningful within a single
/// reconciliation pass and is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysTarget {
    pub name: String,
    /// Digest hex of the install manifest this target came from
    pub source: String,
    #[serde(skip)]
    pub raw: Option<Target>,
}

impl SysTarget {
    /// Record `target` as coming from the install manifest named by
    /// `source` (a digest hex).
    pub fn new(target: Target, source: &str) -> Self {
        Self {
            name: target.service_name.clone(),
            source: source.to_string(),
            raw: Some(target),
        }
    }

    /// The resolved target definition.
    pub fn raw(&self) -> Result<&Target> {
        self.raw.as_ref().ok_or_else(|| {
            MachinaError::State(format!("target {} has no resolved definition", self.name))
        })
    }

    /// The OCI image manifest of the target's image, read out of the blob
    /// store on demand.
    pub fn image_manifest(&self, store: &BlobStore) -> Result<ImageManifest> {
        store.target_manifest(self.raw()?)
    }

    /// The OCI image configuration of the target's image, when the image
    /// carries one. Read out of the blob store on demand.
    pub fn image_config(&self, store: &BlobStore) -> Result<Option<ImageConfiguration>> {
        store.target_config(self.raw()?)
    }
}

/// The device's persistent system manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysManifest {
    #[serde(default)]
    pub uidmaps: Vec<IdmapSet>,
    #[serde(default)]
    pub targets: Vec<SysTarget>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SysManifest {
    /// Look up a target by name.
    pub fn target(&self, name: &str) -> Option<&SysTarget> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Look up a namespace group's allocation.
    pub fn idmap(&self, group: &str) -> Option<&IdmapSet> {
        self.uidmaps.iter().find(|m| m.name == group)
    }
}

/// Merge verified incoming targets into the existing system manifest.
///
/// A full update replaces the entire target list and releases the
/// identifier-map allocations of groups no longer referenced; a group that
/// persists across the update keeps its range. A partial update keeps
/// every existing target not named in the incoming set, carries all
/// existing allocations forward by group name, and requires prior state
/// to exist.
pub fn merge_targets(
    old: Option<&SysManifest>,
    new: Vec<SysTarget>,
    update_type: UpdateType,
) -> Result<SysManifest> {
    let targets = match update_type {
        UpdateType::Full => new,
        UpdateType::Partial => {
            let old = old.ok_or_else(|| {
                MachinaError::Policy(
                    "partial update requested but no system manifest exists".into(),
                )
            })?;
            let replaced: HashSet<&str> = new.iter().map(|t| t.name.as_str()).collect();
            let mut targets: Vec<SysTarget> = old
                .targets
                .iter()
                .filter(|t| !replaced.contains(t.name.as_str()))
                .cloned()
                .collect();
            targets.extend(new);
            targets
        }
    };

    let mut referenced = HashSet::new();
    for target in &targets {
        let raw = target.raw()?;
        if raw.needs_idmap() {
            referenced.insert(raw.nsgroup.clone());
        }
    }

    // An allocated range is never moved while its group persists; full
    // updates only release the ranges of groups that are gone.
    let carried: Vec<IdmapSet> = match (update_type, old) {
        (UpdateType::Full, Some(old)) => old
            .uidmaps
            .iter()
            .filter(|m| referenced.contains(&m.name))
            .cloned()
            .collect(),
        (UpdateType::Full, None) => Vec::new(),
        (UpdateType::Partial, old) => old
            .map(|o| o.uidmaps.clone())
            .unwrap_or_default(),
    };

    let uidmaps = allocate_idmaps(carried, &targets)?;

    tracing::info!(
        update_type = %update_type,
        targets = targets.len(),
        idmap_groups = uidmaps.len(),
        "Merged targets into system manifest"
    );

    Ok(SysManifest {
        uidmaps,
        targets,
        updated_at: Some(Utc::now()),
    })
}

/// Extend `existing` allocations to cover every namespace group referenced
/// by `targets`. New groups get the lowest free base at
/// `IDMAP_BASE + k * IDMAP_RANGE`.
fn allocate_idmaps(existing: Vec<IdmapSet>, targets: &[SysTarget]) -> Result<Vec<IdmapSet>> {
    let mut maps = existing;

    for target in targets {
        let raw = target.raw()?;
        if !raw.needs_idmap() {
            continue;
        }
        if maps.iter().any(|m| m.name == raw.nsgroup) {
            continue;
        }

        let used: HashSet<i64> = maps.iter().map(|m| m.hostid).collect();
        let mut base = IDMAP_BASE;
        while used.contains(&base) {
            base += IDMAP_RANGE;
        }

        tracing::debug!(group = %raw.nsgroup, hostid = base, "Allocated identifier map");
        maps.push(IdmapSet {
            name: raw.nsgroup.clone(),
            hostid: base,
        });
    }

    Ok(maps)
}

/// On-disk system state under the config dir.
///
/// Layout:
/// ```text
/// <config>/manifest.json                 current system manifest
/// <config>/manifests/<hex>.json          staged install manifests
/// <config>/manifests/<hex>.json.signed   their detached signatures
/// <config>/manifests/<hex>.pem           their signing certificates
/// ```
pub struct SystemState {
    config_dir: PathBuf,
}

impl SystemState {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.config_dir.join("manifest.json")
    }

    /// Directory holding staged install manifests and their trust artifacts.
    pub fn manifests_dir(&self) -> PathBuf {
        self.config_dir.join("manifests")
    }

    /// Load the system manifest, resolving each target's definition from
    /// its staged install manifest. Returns `Ok(None)` if the device has
    /// never been installed.
    pub fn load(&self) -> Result<Option<SysManifest>> {
        let path = self.manifest_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut manifest: SysManifest = serde_json::from_slice(&bytes).map_err(|e| {
            MachinaError::State(format!("undecodable system manifest at {path:?}: {e}"))
        })?;

        for target in &mut manifest.targets {
            target.raw = Some(self.resolve_target(&target.name, &target.source)?);
        }

        Ok(Some(manifest))
    }

    /// Read a target's definition out of its staged install manifest.
    fn resolve_target(&self, name: &str, source: &str) -> Result<Target> {
        let path = self.manifests_dir().join(format!("{source}.json"));
        let staged = InstallManifest::from_file(&path).map_err(|e| {
            MachinaError::State(format!("missing staged manifest for target {name}: {e}"))
        })?;
        staged
            .targets
            .into_iter()
            .find(|t| t.service_name == name)
            .ok_or_else(|| {
                MachinaError::State(format!(
                    "staged manifest {source} does not define target {name}"
                ))
            })
    }

    /// Persist the system manifest atomically: write a sibling file, then
    /// rename over the old one.
    pub fn persist(&self, manifest: &SysManifest) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.manifest_path();
        let tmp = self.config_dir.join("manifest.json.new");

        let bytes = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(path = %path.display(), "Persisted system manifest");
        Ok(())
    }

    /// Stage a verified install manifest and its trust artifacts so that
    /// targets can be re-resolved on later loads.
    pub fn stage(
        &self,
        digest_hex: &str,
        manifest_bytes: &[u8],
        cert_bytes: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let dir = self.manifests_dir();
        std::fs::create_dir_all(&dir)?;

        std::fs::write(dir.join(format!("{digest_hex}.json")), manifest_bytes)?;
        std::fs::write(dir.join(format!("{digest_hex}.json.signed")), signature)?;
        std::fs::write(dir.join(format!("{digest_hex}.pem")), cert_bytes)?;

        Ok(())
    }
}
