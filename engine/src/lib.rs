//! Machina Engine - manifest trust & reconciliation pipeline.
//!
//! This crate implements the client-side trust logic for installing and
//! updating a container-image-based OS: fetching a signed install
//! description and its supporting artifacts from an OCI registry,
//! verifying it against a certificate authority, content-verifying every
//! referenced image, and merging the result into persistent device state.

pub mod identity;
pub mod install;
pub mod manifest;
pub mod publish;
pub mod registry;
pub mod source;
pub mod state;
pub mod storage;
pub mod trust;

// Re-export common types
pub use identity::{DeviceIdentity, TrustDir};
pub use install::Machine;
pub use manifest::{
    ImageType, InstallManifest, NetworkType, ServiceType, StorageType, Target, TargetNetwork,
    UpdateType, CURRENT_MANIFEST_VERSION,
};
pub use publish::{collect_targets, ImportFile, ImportTarget, Publisher};
pub use registry::{PublishedManifest, ReferrerPolicy, RegistryClient, RegistryRef, ResolvedImage};
pub use source::ImportSource;
pub use state::{merge_targets, IdmapSet, SysManifest, SysTarget, SystemState};
pub use storage::{BlobStore, Storage};

/// Machina engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Artifact type under which the manifest signing certificate is published.
pub const ARTIFACT_TYPE_CERT: &str = "vnd.machine.pubkeycrt";

/// Artifact type under which the detached manifest signature is published.
pub const ARTIFACT_TYPE_SIGNATURE: &str = "vnd.machine.signature";
