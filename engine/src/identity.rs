//! Device identity provisioning.
//!
//! Per-device certificates live in a keystore under the user data dir:
//!
//! ```text
//! <data>/machina/trust/keys/<keyset>/
//!     device-ca/cert.pem, privkey.pem      keyset device CA
//!     manifest/<project>/
//!         uuid                             product UUID
//!         devices/<uuid>/cert.pem,
//!                  privkey.pem             issued device identities
//! ```
//!
//! Adding a device issues a fresh ECDSA P-256 keypair and a certificate
//! signed by the keyset's device CA, with subject
//! `PID:<product-uuid> SN:<device-uuid>`.

use std::path::{Path, PathBuf};

use machina_core::{MachinaError, Result};
use rcgen::{CertificateParams, DnType, KeyPair};
use uuid::Uuid;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "privkey.pem";
const UUID_FILE: &str = "uuid";

/// An issued device identity.
#[derive(Debug)]
pub struct DeviceIdentity {
    pub uuid: Uuid,
    pub cert_pem: String,
    /// Directory the certificate and key were written to
    pub dir: PathBuf,
}

/// The on-disk trust keystore.
pub struct TrustDir {
    root: PathBuf,
}

impl TrustDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The per-user default keystore, `<data>/machina/trust`.
    pub fn default_location() -> Result<Self> {
        let data = dirs::data_dir()
            .ok_or_else(|| MachinaError::Identity("no user data directory".into()))?;
        Ok(Self::new(data.join("machina").join("trust")))
    }

    fn keyset_dir(&self, keyset: &str) -> PathBuf {
        self.root.join("keys").join(keyset)
    }

    fn project_dir(&self, keyset: &str, project: &str) -> PathBuf {
        self.keyset_dir(keyset).join("manifest").join(project)
    }

    /// Names of the known keysets.
    pub fn keysets(&self) -> Result<Vec<String>> {
        list_dirs(&self.root.join("keys"))
    }

    /// Projects under a keyset.
    pub fn projects(&self, keyset: &str) -> Result<Vec<String>> {
        list_dirs(&self.keyset_dir(keyset).join("manifest"))
    }

    /// Device UUIDs issued under a project.
    pub fn devices(&self, keyset: &str, project: &str) -> Result<Vec<String>> {
        list_dirs(&self.project_dir(keyset, project).join("devices"))
    }

    /// Issue a new device identity under a project.
    ///
    /// The keyset's device CA and the project's `uuid` file must already be
    /// provisioned. A partially written device dir is removed on failure.
    pub fn add_device(
        &self,
        keyset: &str,
        project: &str,
        uuid: Option<Uuid>,
    ) -> Result<DeviceIdentity> {
        let project_dir = self.project_dir(keyset, project);
        let product = std::fs::read_to_string(project_dir.join(UUID_FILE)).map_err(|_| {
            MachinaError::Identity(format!(
                "project {keyset}/{project} has no provisioned product UUID"
            ))
        })?;
        let product = product.trim().to_string();

        let ca_dir = self.keyset_dir(keyset).join("device-ca");
        let ca_cert_pem = std::fs::read_to_string(ca_dir.join(CERT_FILE)).map_err(|_| {
            MachinaError::Identity(format!("keyset {keyset} has no device CA certificate"))
        })?;
        let ca_key_pem = std::fs::read_to_string(ca_dir.join(KEY_FILE))
            .map_err(|_| MachinaError::Identity(format!("keyset {keyset} has no device CA key")))?;

        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        let device_dir = project_dir.join("devices").join(uuid.to_string());
        if device_dir.exists() {
            return Err(MachinaError::Identity(format!(
                "device {uuid} already exists in {keyset}/{project}"
            )));
        }

        let (cert_pem, key_pem) = issue_device_cert(&ca_cert_pem, &ca_key_pem, &product, &uuid)?;

        std::fs::create_dir_all(&device_dir)?;
        if let Err(e) = write_identity(&device_dir, &cert_pem, &key_pem) {
            let _ = std::fs::remove_dir_all(&device_dir);
            return Err(e);
        }

        tracing::info!(%uuid, keyset, project, "Issued device identity");

        Ok(DeviceIdentity {
            uuid,
            cert_pem,
            dir: device_dir,
        })
    }
}

fn write_identity(dir: &Path, cert_pem: &str, key_pem: &str) -> Result<()> {
    std::fs::write(dir.join(CERT_FILE), cert_pem)?;
    std::fs::write(dir.join(KEY_FILE), key_pem)?;
    Ok(())
}

/// Generate a device keypair and certificate signed by the device CA.
fn issue_device_cert(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    product: &str,
    uuid: &Uuid,
) -> Result<(String, String)> {
    let ca_key = KeyPair::from_pem(ca_key_pem)
        .map_err(|e| MachinaError::Identity(format!("unusable device CA key: {e}")))?;
    let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| MachinaError::Identity(format!("unusable device CA certificate: {e}")))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| MachinaError::Identity(format!("failed rebuilding CA issuer: {e}")))?;

    let device_key = KeyPair::generate()
        .map_err(|e| MachinaError::Identity(format!("failed generating device key: {e}")))?;
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| MachinaError::Identity(format!("failed building device cert: {e}")))?;
    params
        .distinguished_name
        .push(DnType::CommonName, format!("PID:{product} SN:{uuid}"));

    let cert = params
        .signed_by(&device_key, &ca_cert, &ca_key)
        .map_err(|e| MachinaError::Identity(format!("failed signing device cert: {e}")))?;

    Ok((cert.pem(), device_key.serialize_pem()))
}

/// Sorted names of the subdirectories of `dir`; empty if it is missing.
fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
