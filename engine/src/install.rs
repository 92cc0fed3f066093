//! Install and update orchestration.
//!
//! [`Machine`] ties the pipeline together: fetch an install bundle from a
//! registry, verify it against the provisioned CA, import and
//! content-verify every target image, stage the manifest, and merge the
//! result into the persistent system state. Nothing is persisted until
//! every earlier step has succeeded.

use machina_core::{MachinaError, MachineConfig, Result};
use x509_cert::Certificate;

use crate::manifest::UpdateType;
use crate::registry::{RegistryClient, RegistryRef};
use crate::source::ImportSource;
use crate::state::{merge_targets, SysManifest, SysTarget, SystemState};
use crate::storage::{BlobStore, Storage};
use crate::trust;

/// Whether a bundle is being applied to a fresh device or a running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Install,
    Update,
}

/// The update type an operation actually merges with.
///
/// An install always replaces everything, so a manifest shipped with a
/// partial update type cannot initialize a device.
fn effective_update_type(op: Operation, declared: UpdateType) -> Result<UpdateType> {
    match (op, declared) {
        (Operation::Install, UpdateType::Partial) => Err(MachinaError::Policy(
            "cannot install from a partial-update manifest".into(),
        )),
        (Operation::Install, UpdateType::Full) => Ok(UpdateType::Full),
        (Operation::Update, declared) => Ok(declared),
    }
}

/// A device with a config dir, an image store, and a provisioned CA.
pub struct Machine {
    config: MachineConfig,
    state: SystemState,
    storage: Box<dyn Storage>,
    ca: Certificate,
}

impl Machine {
    /// Open a machine with the default blob store backend.
    pub fn open(config: MachineConfig) -> Result<Self> {
        let storage = Box::new(BlobStore::new(&config.store_dir));
        Self::with_storage(config, storage)
    }

    /// Open a machine with a caller-supplied storage backend.
    pub fn with_storage(config: MachineConfig, storage: Box<dyn Storage>) -> Result<Self> {
        let ca = trust::certificate_from_file(&config.ca_path)?;
        let state = SystemState::new(&config.config_dir);
        Ok(Self {
            config,
            state,
            storage,
            ca,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// The current system manifest, if the device has been installed.
    pub fn current(&self) -> Result<Option<SysManifest>> {
        self.state.load()
    }

    /// Initialize the device from a signed install bundle in a registry.
    pub async fn install(&self, reference: &str) -> Result<SysManifest> {
        let reference = RegistryRef::parse(reference)?;
        let client = RegistryClient::connect(&reference.addr).await?;
        let source = ImportSource::fetch(&client, &reference).await?;
        self.apply(&client, &source, Operation::Install).await
    }

    /// Apply a signed update bundle from a registry.
    pub async fn update(&self, reference: &str) -> Result<SysManifest> {
        let reference = RegistryRef::parse(reference)?;
        let client = RegistryClient::connect(&reference.addr).await?;
        let source = ImportSource::fetch(&client, &reference).await?;
        self.apply(&client, &source, Operation::Update).await
    }

    /// Initialize the device from a bundle already on disk.
    ///
    /// Used by installer media, where the bundle was copied rather than
    /// fetched; target images must already be importable from `client`.
    pub async fn install_from_source(
        &self,
        client: &RegistryClient,
        source: &ImportSource,
    ) -> Result<SysManifest> {
        self.apply(client, source, Operation::Install).await
    }

    /// Apply an update bundle already on disk.
    pub async fn update_from_source(
        &self,
        client: &RegistryClient,
        source: &ImportSource,
    ) -> Result<SysManifest> {
        self.apply(client, source, Operation::Update).await
    }

    async fn apply(
        &self,
        client: &RegistryClient,
        source: &ImportSource,
        op: Operation,
    ) -> Result<SysManifest> {
        let manifest_bytes = source.manifest_bytes()?;
        let cert_bytes = source.cert_bytes()?;
        let signature = source.signature_bytes()?;

        let manifest =
            trust::verify_manifest(&manifest_bytes, &cert_bytes, &signature, &self.ca)?;
        let update_type = effective_update_type(op, manifest.update_type)?;

        let old = match op {
            Operation::Install => None,
            Operation::Update => Some(self.state.load()?.ok_or_else(|| {
                MachinaError::Policy("no system manifest exists; install first".into())
            })?),
        };

        for target in &manifest.targets {
            self.storage.import_target(client, target).await?;
            self.storage.verify_target(target).await?;
        }

        self.state.stage(
            &source.digest_hex,
            &manifest_bytes,
            &cert_bytes,
            &signature,
        )?;

        let new_targets: Vec<SysTarget> = manifest
            .targets
            .iter()
            .map(|t| SysTarget::new(t.clone(), &source.digest_hex))
            .collect();
        let merged = merge_targets(old.as_ref(), new_targets, update_type)?;
        self.state.persist(&merged)?;

        tracing::info!(
            product = %manifest.product,
            targets = merged.targets.len(),
            update_type = %update_type,
            "Applied install bundle"
        );

        Ok(merged)
    }
}
