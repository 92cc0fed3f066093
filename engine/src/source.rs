//! Install source bundles.
//!
//! An [`ImportSource`] is a locally staged trio of files: the raw install
//! manifest, its signing certificate, and its detached signature. Bundles
//! fetched from a registry live in an operation-scoped temp dir that is
//! removed when the source is dropped, on every exit path.

use std::path::{Path, PathBuf};

use machina_core::Result;

use crate::registry::{drop_hash_alg, RegistryClient, RegistryRef};
use crate::storage::sha256_file;
use crate::{ARTIFACT_TYPE_CERT, ARTIFACT_TYPE_SIGNATURE};

const MANIFEST_FILE: &str = "install.json";
const CERT_FILE: &str = "manifestCert.pem";
const SIGNATURE_FILE: &str = "install.json.signed";

/// A staged install manifest with its trust artifacts.
pub struct ImportSource {
    pub manifest_path: PathBuf,
    pub cert_path: PathBuf,
    pub signature_path: PathBuf,
    /// SHA-256 hex of the raw manifest bytes; used to name staged copies
    pub digest_hex: String,
    // Owns the fetch workdir so it is cleaned up when the source drops.
    _workdir: Option<tempfile::TempDir>,
}

impl ImportSource {
    /// Fetch an install bundle from a registry.
    ///
    /// Resolves the reference, downloads the manifest's single layer blob,
    /// and fetches the certificate and signature artifacts linked to the
    /// manifest via the referrers relationship.
    pub async fn fetch(client: &RegistryClient, reference: &RegistryRef) -> Result<Self> {
        let resolved = client.resolve(reference).await?;
        let workdir = tempfile::tempdir()?;

        let manifest_path = workdir.path().join(MANIFEST_FILE);
        let cert_path = workdir.path().join(CERT_FILE);
        let signature_path = workdir.path().join(SIGNATURE_FILE);

        client
            .fetch_blob(&resolved.name, &resolved.layer_digest, &manifest_path)
            .await?;
        client
            .fetch_artifact(
                &resolved.name,
                &resolved.manifest_digest,
                ARTIFACT_TYPE_CERT,
                &cert_path,
            )
            .await?;
        client
            .fetch_artifact(
                &resolved.name,
                &resolved.manifest_digest,
                ARTIFACT_TYPE_SIGNATURE,
                &signature_path,
            )
            .await?;

        tracing::debug!(reference = %reference, "Fetched install bundle");

        Ok(Self {
            manifest_path,
            cert_path,
            signature_path,
            digest_hex: drop_hash_alg(&resolved.layer_digest).to_string(),
            _workdir: Some(workdir),
        })
    }

    /// Build a source from files already on disk. Nothing is cleaned up on
    /// drop.
    pub fn from_files(manifest: &Path, cert: &Path, signature: &Path) -> Result<Self> {
        let (digest, _) = sha256_file(manifest)?;
        Ok(Self {
            manifest_path: manifest.to_path_buf(),
            cert_path: cert.to_path_buf(),
            signature_path: signature.to_path_buf(),
            digest_hex: drop_hash_alg(&digest).to_string(),
            _workdir: None,
        })
    }

    pub fn manifest_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.manifest_path)?)
    }

    pub fn cert_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.cert_path)?)
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.signature_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("install.json");
        let cert = dir.path().join("cert.pem");
        let sig = dir.path().join("install.json.signed");
        std::fs::write(&manifest, b"{}").unwrap();
        std::fs::write(&cert, b"cert").unwrap();
        std::fs::write(&sig, b"sig").unwrap();

        let source = ImportSource::from_files(&manifest, &cert, &sig).unwrap();
        assert_eq!(source.manifest_bytes().unwrap(), b"{}");
        assert_eq!(source.cert_bytes().unwrap(), b"cert");
        assert_eq!(source.signature_bytes().unwrap(), b"sig");
        assert_eq!(
            source.digest_hex,
            hex::encode(Sha256::digest(b"{}"))
        );

        // Local files survive the source being dropped.
        drop(source);
        assert!(manifest.exists());
    }

    #[test]
    fn test_from_files_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(ImportSource::from_files(&missing, &missing, &missing).is_err());
    }
}
