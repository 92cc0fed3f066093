//! OCI distribution protocol client.
//!
//! Talks the raw distribution endpoints (`/v2/<name>/manifests`,
//! `/v2/<name>/referrers`, `/v2/<name>/blobs`) over HTTP. TLS and
//! registry authentication are a transport concern handled outside the
//! engine; the registries this client targets are reached in the clear
//! on a trusted network and every payload is content-verified after
//! download.

use std::path::Path;

use futures::StreamExt;
use machina_core::{MachinaError, Result};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::reference::{drop_scheme_prefix, RegistryRef};

/// Media type for OCI image manifests.
const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type and canonical content of the OCI 1.1 empty config blob.
const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";
const EMPTY_CONFIG: &[u8] = b"{}";

/// Selection policy when a referrers query returns more than one match.
///
/// The distribution spec allows several artifacts of the same type to refer
/// to one manifest. Whether the right behavior is to take the first or to
/// probe each candidate against the CA is an open question; for now the
/// default takes the first and warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferrerPolicy {
    /// Take the first matching referrer, warning if there were several.
    #[default]
    First,
    /// Treat more than one matching referrer as an error.
    RequireSingle,
}

/// A reference resolved against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Repository name
    pub name: String,
    /// Version tag
    pub tag: String,
    /// Digest of the image manifest, from the Docker-Content-Digest header
    pub manifest_digest: String,
    /// Byte size of the image manifest, from the Content-Length header
    pub manifest_size: i64,
    /// Digest of the manifest's single layer blob
    pub layer_digest: String,
    /// Byte size of that blob
    pub layer_size: i64,
}

/// Result of a successful manifest push.
#[derive(Debug, Clone)]
pub struct PublishedManifest {
    /// Repository name the manifest was pushed under
    pub name: String,
    /// Tag or digest reference it was pushed as
    pub reference: String,
    /// Content digest of the pushed manifest
    pub digest: String,
    /// Byte size of the pushed manifest
    pub size: i64,
}

/// Client for one OCI distribution registry.
pub struct RegistryClient {
    http: reqwest::Client,
    /// Registry address, e.g. "10.0.2.2:5000"
    addr: String,
    referrer_policy: ReferrerPolicy,
}

impl RegistryClient {
    /// Client for the given address without probing it.
    ///
    /// `base` may be a full reference (`10.0.2.2:5000/machine/install:1.0`)
    /// or a bare address; only the address part is used.
    pub fn new(base: &str) -> Self {
        let base = drop_scheme_prefix(base);
        let addr = match base.split_once('/') {
            Some((addr, _)) => addr,
            None => base,
        };

        Self {
            http: reqwest::Client::new(),
            addr: addr.to_string(),
            referrer_policy: ReferrerPolicy::default(),
        }
    }

    /// Connect to a registry, checking the `/v2/` endpoint answers.
    pub async fn connect(base: &str) -> Result<Self> {
        let client = Self::new(base);

        let url = format!("{}/v2/", client.base_url());
        let resp = client.get(&url).await?;
        expect_ok(&url, resp.status())?;

        Ok(client)
    }

    /// Override the referrer selection policy.
    pub fn with_referrer_policy(mut self, policy: ReferrerPolicy) -> Self {
        self.referrer_policy = policy;
        self
    }

    /// Registry address this client talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.http.get(url).send().await.map_err(|e| MachinaError::Registry {
            url: url.to_string(),
            message: format!("failed connecting: {e}"),
        })
    }

    /// Resolve a reference to its manifest digest/size and single layer blob.
    ///
    /// The registry must answer with a `Docker-Content-Digest` header;
    /// without it there is no way to address the result, so its absence is
    /// fatal. The manifest must carry exactly one layer descriptor.
    pub async fn resolve(&self, reference: &RegistryRef) -> Result<ResolvedImage> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(),
            reference.name,
            reference.tag
        );

        let resp = self
            .http
            .get(&url)
            .header("Accept", MEDIA_TYPE_MANIFEST)
            .send()
            .await
            .map_err(|e| MachinaError::Registry {
                url: url.clone(),
                message: format!("failed connecting: {e}"),
            })?;
        expect_ok(&url, resp.status())?;

        let manifest_digest = header_string(&resp, "Docker-Content-Digest").ok_or_else(|| {
            MachinaError::MalformedData(format!("no Docker-Content-Digest received from {url}"))
        })?;
        let manifest_size: i64 = header_string(&resp, "Content-Length")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                MachinaError::MalformedData(format!("no Content-Length received from {url}"))
            })?;

        let body = resp.bytes().await.map_err(|e| MachinaError::Registry {
            url: url.clone(),
            message: format!("failed reading body: {e}"),
        })?;
        let manifest: ImageManifest = serde_json::from_slice(&body).map_err(|e| {
            MachinaError::MalformedData(format!("failed parsing manifest from {url}: {e}"))
        })?;

        let layer = single_layer(&manifest, &url)?;

        tracing::debug!(
            reference = %reference,
            digest = %manifest_digest,
            layer = %layer.digest(),
            "Resolved registry reference"
        );

        Ok(ResolvedImage {
            name: reference.name.clone(),
            tag: reference.tag.clone(),
            manifest_digest,
            manifest_size,
            layer_digest: layer.digest().to_string(),
            layer_size: layer.size(),
        })
    }

    /// Download a blob to `dest`.
    ///
    /// Streams into `<dest>.part` and renames on completion; the partial
    /// file is removed if the download fails, so nothing lingers at either
    /// path.
    pub async fn fetch_blob(&self, name: &str, digest: &str, dest: &Path) -> Result<()> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url(), name, digest);
        let resp = self.get(&url).await?;
        expect_ok(&url, resp.status())?;

        download_to(resp.bytes_stream(), dest, &url).await
    }

    /// Fetch the raw bytes of the manifest at `name:reference`.
    pub async fn fetch_manifest(&self, name: &str, reference: &str) -> Result<Vec<u8>> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url(), name, reference);
        let resp = self
            .http
            .get(&url)
            .header("Accept", MEDIA_TYPE_MANIFEST)
            .send()
            .await
            .map_err(|e| MachinaError::Registry {
                url: url.clone(),
                message: format!("failed connecting: {e}"),
            })?;
        expect_ok(&url, resp.status())?;

        let body = resp.bytes().await.map_err(|e| MachinaError::Registry {
            url: url.clone(),
            message: format!("failed reading body: {e}"),
        })?;
        Ok(body.to_vec())
    }

    /// Query the referrers endpoint for artifacts of `artifact_type` linked
    /// to `digest`. An empty result set is an error: the artifact was never
    /// published.
    pub async fn referrers(
        &self,
        name: &str,
        digest: &str,
        artifact_type: &str,
    ) -> Result<ImageIndex> {
        let url = format!(
            "{}/v2/{}/referrers/{}?artifactType={}",
            self.base_url(),
            name,
            digest,
            artifact_type
        );
        let resp = self.get(&url).await?;
        expect_ok(&url, resp.status())?;

        let body = resp.bytes().await.map_err(|e| MachinaError::Registry {
            url: url.clone(),
            message: format!("failed reading body: {e}"),
        })?;
        let index: ImageIndex = serde_json::from_slice(&body).map_err(|e| {
            MachinaError::MalformedData(format!("failed parsing referrers list from {url}: {e}"))
        })?;

        if index.manifests().is_empty() {
            return Err(MachinaError::Registry {
                url,
                message: format!("no referrer published for artifact type {artifact_type:?}"),
            });
        }

        Ok(index)
    }

    /// Fetch a referrer artifact's payload to `dest`.
    ///
    /// Two hops: the referrer descriptor points at an artifact manifest,
    /// whose single layer blob is the payload.
    pub async fn fetch_artifact(
        &self,
        name: &str,
        subject_digest: &str,
        artifact_type: &str,
        dest: &Path,
    ) -> Result<()> {
        let index = self.referrers(name, subject_digest, artifact_type).await?;
        let referrer = select_referrer(self.referrer_policy, index.manifests())?;

        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(),
            name,
            referrer.digest()
        );
        let body = self.fetch_manifest(name, referrer.digest().as_str()).await?;
        let manifest: ImageManifest = serde_json::from_slice(&body).map_err(|e| {
            MachinaError::MalformedData(format!("failed parsing artifact manifest from {url}: {e}"))
        })?;
        let layer = single_layer(&manifest, &url)?;

        self.fetch_blob(name, layer.digest(), dest).await
    }

    /// Upload a blob, returning its digest and size.
    ///
    /// Uploading a blob the registry already has is a no-op on its side,
    /// which keeps the publish path idempotent.
    pub async fn push_blob(&self, name: &str, data: &[u8]) -> Result<(String, i64)> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));

        let start_url = format!("{}/v2/{}/blobs/uploads/", self.base_url(), name);
        let resp = self
            .http
            .post(&start_url)
            .send()
            .await
            .map_err(|e| MachinaError::Registry {
                url: start_url.clone(),
                message: format!("failed starting blob upload: {e}"),
            })?;
        if resp.status().as_u16() != 202 {
            return Err(MachinaError::Registry {
                url: start_url,
                message: format!("bad status code starting blob upload: {}", resp.status()),
            });
        }

        let location = header_string(&resp, "Location").ok_or_else(|| {
            MachinaError::MalformedData(format!("no Location header received from {start_url}"))
        })?;
        let location = if location.starts_with('/') {
            format!("{}{}", self.base_url(), location)
        } else {
            location
        };
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{location}{sep}digest={digest}");

        let resp = self
            .http
            .put(&put_url)
            .header("Content-Type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| MachinaError::Registry {
                url: put_url.clone(),
                message: format!("failed uploading blob: {e}"),
            })?;
        if !resp.status().is_success() {
            return Err(MachinaError::Registry {
                url: put_url,
                message: format!("bad status code uploading blob: {}", resp.status()),
            });
        }

        Ok((digest, data.len() as i64))
    }

    /// Push a manifest under `reference` (a tag or a digest).
    pub async fn push_manifest(
        &self,
        name: &str,
        reference: &str,
        body: &[u8],
    ) -> Result<PublishedManifest> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(body)));
        let url = format!("{}/v2/{}/manifests/{}", self.base_url(), name, reference);

        let resp = self
            .http
            .put(&url)
            .header("Content-Type", MEDIA_TYPE_MANIFEST)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| MachinaError::Registry {
                url: url.clone(),
                message: format!("failed pushing manifest: {e}"),
            })?;
        if !resp.status().is_success() {
            return Err(MachinaError::Registry {
                url,
                message: format!("bad status code pushing manifest: {}", resp.status()),
            });
        }

        tracing::info!(name, reference, digest = %digest, "Pushed manifest");

        Ok(PublishedManifest {
            name: name.to_string(),
            reference: reference.to_string(),
            digest,
            size: body.len() as i64,
        })
    }

    /// Push `layer` as a single-layer image under `name:reference`.
    ///
    /// Returns the pushed manifest along with the layer's digest and size.
    pub async fn push_image(
        &self,
        name: &str,
        reference: &str,
        layer: &[u8],
        layer_media_type: &str,
    ) -> Result<(PublishedManifest, String, i64)> {
        let (layer_digest, layer_size) = self.push_blob(name, layer).await?;
        let (config_digest, config_size) = self.push_blob(name, EMPTY_CONFIG).await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "config": {
                "mediaType": MEDIA_TYPE_EMPTY,
                "digest": config_digest,
                "size": config_size,
            },
            "layers": [{
                "mediaType": layer_media_type,
                "digest": layer_digest,
                "size": layer_size,
            }],
        });
        let body = serde_json::to_vec(&manifest)?;

        let pushed = self.push_manifest(name, reference, &body).await?;
        Ok((pushed, layer_digest, layer_size))
    }

    /// Publish `payload` as an artifact linked to a subject manifest via the
    /// referrers relationship.
    ///
    /// Pushes the payload blob and the empty config blob, then a manifest
    /// carrying `artifact_type` and a `subject` descriptor, addressed by its
    /// own digest.
    pub async fn push_artifact(
        &self,
        name: &str,
        subject_digest: &str,
        subject_size: i64,
        artifact_type: &str,
        payload: &[u8],
    ) -> Result<PublishedManifest> {
        let (payload_digest, payload_size) = self.push_blob(name, payload).await?;
        let (config_digest, config_size) = self.push_blob(name, EMPTY_CONFIG).await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "artifactType": artifact_type,
            "config": {
                "mediaType": MEDIA_TYPE_EMPTY,
                "digest": config_digest,
                "size": config_size,
            },
            "layers": [{
                "mediaType": "application/octet-stream",
                "digest": payload_digest,
                "size": payload_size,
            }],
            "subject": {
                "mediaType": MEDIA_TYPE_MANIFEST,
                "digest": subject_digest,
                "size": subject_size,
            },
        });
        let body = serde_json::to_vec(&manifest)?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));

        self.push_manifest(name, &digest, &body).await
    }
}

/// Stream chunks into `<dest>.part`, then rename onto `dest`.
///
/// A failed or interrupted stream removes the partial file before the
/// error is returned.
async fn download_to<S, B, E>(stream: S, dest: &Path, url: &str) -> Result<()>
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    let part = std::path::PathBuf::from(part);

    let written = write_stream(stream, &part, url).await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e);
    }

    tokio::fs::rename(&part, dest).await?;
    Ok(())
}

async fn write_stream<S, B, E>(mut stream: S, path: &Path, url: &str) -> Result<()>
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| MachinaError::Registry {
            url: url.to_string(),
            message: format!("failed streaming blob: {e}"),
        })?;
        file.write_all(chunk.as_ref()).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Require exactly one layer descriptor in a manifest.
fn single_layer<'a>(manifest: &'a ImageManifest, url: &str) -> Result<&'a Descriptor> {
    match manifest.layers().as_slice() {
        [layer] => Ok(layer),
        [] => Err(MachinaError::MalformedData(format!(
            "no layers found in the manifest at {url}"
        ))),
        layers => Err(MachinaError::MalformedData(format!(
            "{} layers found in the manifest at {url}, expected exactly one",
            layers.len()
        ))),
    }
}

/// Apply the referrer selection policy to a non-empty candidate list.
fn select_referrer(policy: ReferrerPolicy, manifests: &[Descriptor]) -> Result<&Descriptor> {
    match (policy, manifests) {
        (_, [single]) => Ok(single),
        (ReferrerPolicy::First, [first, ..]) => {
            tracing::warn!(
                candidates = manifests.len(),
                chosen = %first.digest(),
                "Multiple referrers found, using the first one"
            );
            Ok(first)
        }
        (ReferrerPolicy::RequireSingle, candidates) => Err(MachinaError::MalformedData(format!(
            "{} referrers found where exactly one was required",
            candidates.len()
        ))),
        (_, []) => Err(MachinaError::MalformedData(
            "empty referrer candidate list".into(),
        )),
    }
}

fn expect_ok(url: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.as_u16() == 200 {
        Ok(())
    } else {
        Err(MachinaError::Registry {
            url: url.to_string(),
            message: format!("bad status code: {status}"),
        })
    }
}

fn header_string(resp: &reqwest::Response, key: &str) -> Option<String> {
    resp.headers()
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(digest: &str) -> Descriptor {
        serde_json::from_value(serde_json::json!({
            "mediaType": MEDIA_TYPE_MANIFEST,
            "digest": digest,
            "size": 123,
        }))
        .unwrap()
    }

    fn manifest_with_layers(layers: usize) -> ImageManifest {
        let layer_list: Vec<_> = (0..layers)
            .map(|i| {
                serde_json::json!({
                    "mediaType": "application/octet-stream",
                    "digest": format!("sha256:{i:064}"),
                    "size": 10,
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": MEDIA_TYPE_EMPTY,
                "digest": "sha256:4444444444444444444444444444444444444444444444444444444444444444",
                "size": 2,
            },
            "layers": layer_list,
        }))
        .unwrap()
    }

    #[test]
    fn test_single_layer_ok() {
        let manifest = manifest_with_layers(1);
        let layer = single_layer(&manifest, "http://x/").unwrap();
        assert_eq!(layer.size(), 10);
    }

    #[test]
    fn test_zero_layers_is_malformed() {
        let manifest = manifest_with_layers(0);
        let err = single_layer(&manifest, "http://x/").unwrap_err();
        assert!(matches!(err, MachinaError::MalformedData(_)));
    }

    #[test]
    fn test_multiple_layers_is_malformed() {
        let manifest = manifest_with_layers(2);
        assert!(single_layer(&manifest, "http://x/").is_err());
    }

    #[test]
    fn test_select_referrer_single() {
        let candidates = vec![descriptor("sha256:aaa")];
        let chosen = select_referrer(ReferrerPolicy::First, &candidates).unwrap();
        assert_eq!(chosen.digest(), "sha256:aaa");

        let chosen = select_referrer(ReferrerPolicy::RequireSingle, &candidates).unwrap();
        assert_eq!(chosen.digest(), "sha256:aaa");
    }

    #[test]
    fn test_select_referrer_first_of_many() {
        let candidates = vec![descriptor("sha256:aaa"), descriptor("sha256:bbb")];
        let chosen = select_referrer(ReferrerPolicy::First, &candidates).unwrap();
        assert_eq!(chosen.digest(), "sha256:aaa");
    }

    #[test]
    fn test_select_referrer_require_single_rejects_many() {
        let candidates = vec![descriptor("sha256:aaa"), descriptor("sha256:bbb")];
        assert!(select_referrer(ReferrerPolicy::RequireSingle, &candidates).is_err());
    }

    #[tokio::test]
    async fn test_download_streams_then_renames() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");

        let chunks: Vec<std::result::Result<&[u8], String>> =
            vec![Ok(b"squash"), Ok(b"fs image")];
        download_to(futures::stream::iter(chunks), &dest, "http://x/")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"squashfs image");
        assert!(!dir.path().join("blob.part").exists());
    }

    #[tokio::test]
    async fn test_interrupted_download_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");

        let chunks: Vec<std::result::Result<&[u8], String>> =
            vec![Ok(b"squash"), Err("connection reset".to_string())];
        let err = download_to(futures::stream::iter(chunks), &dest, "http://x/")
            .await
            .unwrap_err();

        assert!(matches!(err, MachinaError::Registry { .. }));
        assert!(!dest.exists());
        assert!(!dir.path().join("blob.part").exists());
    }

    #[test]
    fn test_expect_ok() {
        assert!(expect_ok("http://x/", reqwest::StatusCode::OK).is_ok());
        let err = expect_ok("http://x/v2/", reqwest::StatusCode::NOT_FOUND).unwrap_err();
        match err {
            MachinaError::Registry { url, message } => {
                assert_eq!(url, "http://x/v2/");
                assert!(message.contains("404"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
