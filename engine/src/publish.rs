//! Build-side publishing.
//!
//! The publisher turns an import file (a YAML description of the targets a
//! product ships) into a signed install bundle in a destination registry:
//! it copies every target image in under the canonical content-addressed
//! name, records the resulting layer digests and sizes, pushes the install
//! manifest as a single-layer image, and attaches the signing certificate
//! and detached signature as referrer artifacts. Any failure aborts the
//! whole publish; no partial manifest is ever produced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use machina_core::{MachinaError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::manifest::{
    InstallManifest, ServiceType, Target, TargetNetwork, UpdateType, CURRENT_MANIFEST_VERSION,
};
use crate::registry::{drop_hash_alg, PublishedManifest, RegistryClient, RegistryRef};
use crate::trust;
use crate::{ARTIFACT_TYPE_CERT, ARTIFACT_TYPE_SIGNATURE};

/// Media type of the install manifest layer blob.
const MEDIA_TYPE_INSTALL: &str = "application/vnd.machine.install.v1+json";
/// Media type of copied target image layers.
const MEDIA_TYPE_IMAGE_LAYER: &str = "application/octet-stream";
/// Repository target images are published under, addressed by digest.
const CANONICAL_REPO: &str = "machina/images";

const OCI_REF_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// One target entry in an import file.
///
/// `source` is either a registry reference or an `oci:<dir>:<tag>` local
/// layout reference. A declared `digest`/`size`, when present, must match
/// what the source actually resolves to before anything is copied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportTarget {
    pub service_name: String,
    /// Where the image is copied from
    pub source: String,
    /// Repository path used by `collect`; defaults to the source
    /// repository path
    #[serde(default)]
    pub imagepath: String,
    pub version: String,
    pub service_type: ServiceType,
    #[serde(default)]
    pub network: TargetNetwork,
    #[serde(default)]
    pub nsgroup: String,
    /// Expected layer digest (`sha256:<hex>`); checked when non-empty
    #[serde(default)]
    pub digest: String,
    /// Expected layer size; checked when positive
    #[serde(default)]
    pub size: i64,
}

/// A product's publish description, read from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFile {
    pub version: u32,
    pub product: String,
    #[serde(default)]
    pub update_type: UpdateType,
    #[serde(default)]
    pub targets: Vec<ImportTarget>,
}

impl ImportFile {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes)
            .map_err(|e| MachinaError::MalformedData(format!("undecodable import file: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }
}

/// Where an import target's image comes from.
enum ImageSource {
    /// Local OCI image layout: `oci:<dir>:<tag>`
    Layout { dir: PathBuf, tag: String },
    Registry(RegistryRef),
}

fn parse_source(source: &str) -> Result<ImageSource> {
    if let Some(rest) = source.strip_prefix("oci:") {
        let (dir, tag) = rest.rsplit_once(':').ok_or_else(|| {
            MachinaError::MalformedData(format!(
                "failed parsing layout reference: no ':' tag in {source:?}"
            ))
        })?;
        if dir.is_empty() || tag.is_empty() {
            return Err(MachinaError::MalformedData(format!(
                "incomplete layout reference {source:?}"
            )));
        }
        return Ok(ImageSource::Layout {
            dir: PathBuf::from(dir),
            tag: tag.to_string(),
        });
    }
    Ok(ImageSource::Registry(RegistryRef::parse(source)?))
}

/// Read the single layer blob of a tagged image out of a local OCI layout.
fn layout_layer(dir: &Path, tag: &str) -> Result<Vec<u8>> {
    let index_bytes = std::fs::read(dir.join("index.json"))?;
    let index: ImageIndex = serde_json::from_slice(&index_bytes).map_err(|e| {
        MachinaError::MalformedData(format!("undecodable layout index in {dir:?}: {e}"))
    })?;

    let descriptor = index
        .manifests()
        .iter()
        .find(|d| {
            d.annotations()
                .as_ref()
                .and_then(|a| a.get(OCI_REF_ANNOTATION))
                .is_some_and(|name| name == tag)
        })
        .ok_or_else(|| {
            MachinaError::MalformedData(format!("no image tagged {tag:?} in layout {dir:?}"))
        })?;

    let blob = |digest: &str| dir.join("blobs").join("sha256").join(drop_hash_alg(digest));

    let manifest_bytes = std::fs::read(blob(descriptor.digest()))?;
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
        MachinaError::MalformedData(format!("undecodable layout manifest in {dir:?}: {e}"))
    })?;

    match manifest.layers().as_slice() {
        [layer] => Ok(std::fs::read(blob(layer.digest()))?),
        layers => Err(MachinaError::MalformedData(format!(
            "{} layers found in layout image {tag:?}, expected exactly one",
            layers.len()
        ))),
    }
}

/// Resolve a source to its layer bytes. Registry clients are cached per
/// address across a publish run.
async fn resolve_layer(
    source: &str,
    clients: &mut HashMap<String, RegistryClient>,
) -> Result<Vec<u8>> {
    match parse_source(source)? {
        ImageSource::Layout { dir, tag } => layout_layer(&dir, &tag),
        ImageSource::Registry(reference) => {
            if !clients.contains_key(&reference.addr) {
                clients.insert(
                    reference.addr.clone(),
                    RegistryClient::connect(&reference.addr).await?,
                );
            }
            let client = &clients[&reference.addr];
            let resolved = client.resolve(&reference).await?;

            let workdir = tempfile::tempdir()?;
            let blob_path = workdir.path().join("layer");
            client
                .fetch_blob(&resolved.name, &resolved.layer_digest, &blob_path)
                .await?;
            Ok(std::fs::read(&blob_path)?)
        }
    }
}

/// The repository path recorded for a `collect` copy.
fn collect_imagepath(entry: &ImportTarget) -> Result<String> {
    if !entry.imagepath.is_empty() {
        return Ok(entry.imagepath.clone());
    }
    match parse_source(&entry.source)? {
        ImageSource::Registry(reference) => Ok(reference.name),
        ImageSource::Layout { .. } => Err(MachinaError::MalformedData(format!(
            "target {} needs an explicit imagepath for a layout source",
            entry.service_name
        ))),
    }
}

/// Digest and size of a resolved layer, gated against what the import
/// file declares. Nothing is pushed until this passes.
fn pin_layer(entry: &ImportTarget, layer: &[u8]) -> Result<(String, i64)> {
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(layer)));
    let size = layer.len() as i64;
    check_declared(entry, &digest, size)?;
    Ok((digest, size))
}

/// Check a resolved layer against the digests the import file declares.
fn check_declared(entry: &ImportTarget, digest: &str, size: i64) -> Result<()> {
    if (!entry.digest.is_empty() && entry.digest != digest)
        || (entry.size > 0 && entry.size != size)
    {
        return Err(MachinaError::ContentMismatch {
            target: entry.service_name.clone(),
            expected: format!("{} ({} bytes)", entry.digest, entry.size),
            actual: format!("{digest} ({size} bytes)"),
        });
    }
    Ok(())
}

/// Copy every target image named by `import` into the destination registry
/// under `<imagepath>:<version>` and return the fully pinned target list.
pub async fn collect_targets(import: &ImportFile, dest: &RegistryClient) -> Result<Vec<Target>> {
    let mut clients = HashMap::new();
    let mut targets = Vec::with_capacity(import.targets.len());

    for entry in &import.targets {
        let layer = resolve_layer(&entry.source, &mut clients).await?;
        let imagepath = collect_imagepath(entry)?;
        let (digest, size) = pin_layer(entry, &layer)?;

        dest.push_image(&imagepath, &entry.version, &layer, MEDIA_TYPE_IMAGE_LAYER)
            .await?;

        tracing::debug!(
            target = %entry.service_name,
            image = %format!("{imagepath}:{}", entry.version),
            digest = %digest,
            "Collected image"
        );

        targets.push(pinned_target(entry, imagepath, digest, size));
    }

    Ok(targets)
}

fn pinned_target(entry: &ImportTarget, imagepath: String, digest: String, size: i64) -> Target {
    Target {
        service_name: entry.service_name.clone(),
        imagepath,
        version: entry.version.clone(),
        service_type: entry.service_type,
        network: entry.network,
        nsgroup: entry.nsgroup.clone(),
        digest,
        size,
    }
}

/// Every published target must carry the digest and size pinned during
/// collection; a manifest naming content it cannot pin is never signed.
fn ensure_integrity(targets: &[Target]) -> Result<()> {
    for target in targets {
        if target.digest.is_empty() || target.size <= 0 {
            return Err(MachinaError::Policy(format!(
                "target {} has no content digest or size; refusing to publish",
                target.service_name
            )));
        }
    }
    Ok(())
}

/// Signs and publishes install bundles.
pub struct Publisher {
    key_path: PathBuf,
    cert_path: PathBuf,
}

impl Publisher {
    /// A publisher using the given PKCS#8 PEM signing key and its
    /// certificate.
    pub fn new(key_path: impl Into<PathBuf>, cert_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            cert_path: cert_path.into(),
        }
    }

    /// Publish a signed install bundle under `name:tag` at the destination.
    ///
    /// Target images land under the canonical content-addressed name
    /// `machina/images:<digest-hex>`, so a device can later fetch them by
    /// digest alone.
    pub async fn publish(
        &self,
        import: &ImportFile,
        dest: &RegistryClient,
        name: &str,
        tag: &str,
    ) -> Result<PublishedManifest> {
        let mut clients = HashMap::new();
        let mut targets = Vec::with_capacity(import.targets.len());

        for entry in &import.targets {
            let layer = resolve_layer(&entry.source, &mut clients).await?;
            let (digest, size) = pin_layer(entry, &layer)?;

            dest.push_image(
                CANONICAL_REPO,
                drop_hash_alg(&digest),
                &layer,
                MEDIA_TYPE_IMAGE_LAYER,
            )
            .await?;

            targets.push(pinned_target(entry, CANONICAL_REPO.to_string(), digest, size));
        }

        ensure_integrity(&targets)?;

        let manifest = InstallManifest {
            version: CURRENT_MANIFEST_VERSION,
            image_type: Default::default(),
            product: import.product.clone(),
            targets,
            update_type: import.update_type,
            storage_type: Default::default(),
        };
        manifest.validate()?;
        let manifest_bytes = serde_json::to_vec(&manifest)?;

        let (pushed, _, _) = dest
            .push_image(name, tag, &manifest_bytes, MEDIA_TYPE_INSTALL)
            .await?;

        let cert = std::fs::read(&self.cert_path)?;
        dest.push_artifact(name, &pushed.digest, pushed.size, ARTIFACT_TYPE_CERT, &cert)
            .await?;

        let signature = trust::sign_manifest_with_key_file(&manifest_bytes, &self.key_path)?;
        dest.push_artifact(
            name,
            &pushed.digest,
            pushed.size,
            ARTIFACT_TYPE_SIGNATURE,
            &signature,
        )
        .await?;

        tracing::info!(
            product = %import.product,
            name,
            tag,
            digest = %pushed.digest,
            "Published install bundle"
        );

        Ok(pushed)
    }
}
