//! Target image storage.
//!
//! Imported images land in a content-addressed blob store keyed by their
//! layer digest. Import is idempotent: a blob that is already present and
//! verifies is never fetched again. Every blob is re-hashed after download
//! and on demand, so corruption is always reported as a content mismatch
//! rather than surfacing later as undefined behavior.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use machina_core::{MachinaError, Result};
use oci_spec::image::{ImageConfiguration, ImageManifest};
use sha2::{Digest, Sha256};

use crate::manifest::Target;
use crate::registry::{drop_hash_alg, RegistryClient};

/// Media type of the OCI 1.1 empty config blob. Images published
/// artifact-style carry it in place of a real configuration.
const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";

/// Where verified target images are imported to and checked against.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a target's layer blob into local storage. Idempotent by
    /// digest.
    async fn import_target(&self, client: &RegistryClient, target: &Target) -> Result<()>;

    /// Re-hash a stored target and compare against its recorded digest and
    /// size.
    async fn verify_target(&self, target: &Target) -> Result<()>;
}

/// SHA-256 and byte size of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<(String, i64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut size: i64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as i64;
    }
    Ok((format!("sha256:{}", hex::encode(hasher.finalize())), size))
}

/// Content-addressed blob store rooted at a directory.
///
/// Blobs live at `<root>/blobs/sha256/<hex>`.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path a blob with the given `sha256:<hex>` digest is stored at.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = drop_hash_alg(digest);
        self.root.join("blobs").join("sha256").join(hex)
    }

    /// Path the OCI image manifest for the image whose layer has the given
    /// digest is stored at.
    pub fn manifest_path(&self, layer_digest: &str) -> PathBuf {
        let hex = drop_hash_alg(layer_digest);
        self.root.join("manifests").join(format!("{hex}.json"))
    }

    /// The stored OCI image manifest of a target's image.
    pub fn target_manifest(&self, target: &Target) -> Result<ImageManifest> {
        let path = self.manifest_path(&target.digest);
        let bytes = std::fs::read(&path).map_err(|e| {
            MachinaError::State(format!(
                "no stored image manifest for target {}: {e}",
                target.service_name
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            MachinaError::MalformedData(format!("undecodable image manifest at {path:?}: {e}"))
        })
    }

    /// The stored OCI image configuration of a target's image, when it has
    /// one. Images published with the empty artifact-style config resolve
    /// to `None`.
    pub fn target_config(&self, target: &Target) -> Result<Option<ImageConfiguration>> {
        let manifest = self.target_manifest(target)?;
        let config = manifest.config();
        if config.media_type().to_string() == MEDIA_TYPE_EMPTY {
            return Ok(None);
        }

        let bytes = std::fs::read(self.blob_path(config.digest()))?;
        let parsed = serde_json::from_slice(&bytes).map_err(|e| {
            MachinaError::MalformedData(format!(
                "undecodable image config for target {}: {e}",
                target.service_name
            ))
        })?;
        Ok(Some(parsed))
    }

    /// Fetch and store the image manifest and config blob of a target so
    /// later loads can resolve them without registry access. The canonical
    /// publish tags every image copy by its layer digest hex, which is the
    /// reference used here.
    async fn store_metadata(&self, client: &RegistryClient, target: &Target) -> Result<()> {
        let reference = drop_hash_alg(&target.digest);
        let bytes = client.fetch_manifest(&target.imagepath, reference).await?;
        let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(|e| {
            MachinaError::MalformedData(format!(
                "undecodable image manifest for target {}: {e}",
                target.service_name
            ))
        })?;

        let config = manifest.config();
        let config_dest = self.blob_path(config.digest());
        if !config_dest.exists() {
            if let Some(parent) = config_dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            client
                .fetch_blob(&target.imagepath, config.digest(), &config_dest)
                .await?;
        }

        let path = self.manifest_path(&target.digest);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &bytes)?;
        Ok(())
    }

    fn check(&self, target: &Target) -> Result<()> {
        let path = self.blob_path(&target.digest);
        let (digest, size) = sha256_file(&path)?;
        if digest != target.digest || size != target.size {
            return Err(MachinaError::ContentMismatch {
                target: target.service_name.clone(),
                expected: format!("{} ({} bytes)", target.digest, target.size),
                actual: format!("{digest} ({size} bytes)"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for BlobStore {
    async fn import_target(&self, client: &RegistryClient, target: &Target) -> Result<()> {
        let dest = self.blob_path(&target.digest);

        if dest.exists() {
            match self.check(target) {
                Ok(()) => {
                    tracing::debug!(target = %target.service_name, "Target already imported");
                    if !self.manifest_path(&target.digest).exists() {
                        self.store_metadata(client, target).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    // Stale or corrupt copy; refetch it.
                    tracing::warn!(target = %target.service_name, error = %e, "Refetching stored blob");
                    std::fs::remove_file(&dest)?;
                }
            }
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Blobs are addressed by digest; the tag plays no part here.
        client
            .fetch_blob(&target.imagepath, &target.digest, &dest)
            .await?;
        self.check(target)?;
        self.store_metadata(client, target).await?;

        tracing::info!(
            target = %target.service_name,
            digest = %target.digest,
            size = target.size,
            "Imported target"
        );
        Ok(())
    }

    async fn verify_target(&self, target: &Target) -> Result<()> {
        self.check(target)
    }
}
