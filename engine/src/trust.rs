//! Manifest signing and verification.
//!
//! An install manifest ships with two companion artifacts: the signing
//! certificate and a detached ECDSA P-256/SHA-256 signature over the raw
//! manifest bytes. Verification runs in a fixed order: the certificate is
//! chained to the product CA first, then the signature is checked with the
//! certificate's public key, and only then are the bytes decoded as JSON.
//! Untrusted bytes never reach the decoder.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use machina_core::{MachinaError, Result};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use x509_cert::Certificate;

use crate::manifest::InstallManifest;

const ECDSA_WITH_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// Convert a single PEM block to DER bytes.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    BASE64
        .decode(body.trim())
        .map_err(|e| MachinaError::MalformedData(format!("invalid PEM body: {e}")))
}

/// Parse a certificate from PEM or raw DER bytes.
pub fn parse_certificate(bytes: &[u8]) -> Result<Certificate> {
    let der;
    let bytes = if bytes.starts_with(b"-----BEGIN") {
        let pem = std::str::from_utf8(bytes)
            .map_err(|e| MachinaError::MalformedData(format!("non-UTF-8 PEM: {e}")))?;
        der = pem_to_der(pem)?;
        der.as_slice()
    } else {
        bytes
    };

    Certificate::from_der(bytes)
        .map_err(|e| MachinaError::MalformedData(format!("undecodable certificate: {e}")))
}

/// Load a certificate from a file on disk (PEM or DER).
pub fn certificate_from_file(path: &Path) -> Result<Certificate> {
    let bytes = std::fs::read(path)?;
    parse_certificate(&bytes)
}

/// P-256 verifying key from a certificate's SubjectPublicKeyInfo.
fn public_key(cert: &Certificate) -> Result<VerifyingKey> {
    let point = cert
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| {
            MachinaError::MalformedData("certificate public key is not byte-aligned".into())
        })?;
    VerifyingKey::from_sec1_bytes(point)
        .map_err(|e| MachinaError::MalformedData(format!("unusable certificate public key: {e}")))
}

/// Check that `cert` was issued and signed by `ca` and is within its
/// validity window.
pub fn verify_cert_chain(cert: &Certificate, ca: &Certificate) -> Result<()> {
    if cert.tbs_certificate.issuer != ca.tbs_certificate.subject {
        return Err(MachinaError::Verification(format!(
            "certificate issuer {} does not match CA subject {}",
            cert.tbs_certificate.issuer, ca.tbs_certificate.subject
        )));
    }

    let validity = &cert.tbs_certificate.validity;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| MachinaError::Other(format!("system clock before epoch: {e}")))?;
    if now < validity.not_before.to_unix_duration() {
        return Err(MachinaError::Verification(
            "certificate is not yet valid".into(),
        ));
    }
    if now > validity.not_after.to_unix_duration() {
        return Err(MachinaError::Verification("certificate has expired".into()));
    }

    if cert.signature_algorithm.oid != ECDSA_WITH_SHA256 {
        return Err(MachinaError::Verification(format!(
            "unsupported certificate signature algorithm {}",
            cert.signature_algorithm.oid
        )));
    }

    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| MachinaError::MalformedData(format!("unencodable certificate body: {e}")))?;
    let sig_bytes = cert.signature.as_bytes().ok_or_else(|| {
        MachinaError::MalformedData("certificate signature is not byte-aligned".into())
    })?;
    let signature = Signature::from_der(sig_bytes).map_err(|e| {
        MachinaError::MalformedData(format!("undecodable certificate signature: {e}"))
    })?;

    public_key(ca)?
        .verify(&tbs, &signature)
        .map_err(|_| MachinaError::Verification("certificate not signed by the CA".into()))
}

/// Check a detached DER-encoded ECDSA signature over `data`.
pub fn verify_signature(cert: &Certificate, data: &[u8], signature: &[u8]) -> Result<()> {
    let signature = Signature::from_der(signature)
        .map_err(|e| MachinaError::MalformedData(format!("undecodable signature: {e}")))?;
    public_key(cert)?
        .verify(data, &signature)
        .map_err(|_| MachinaError::Verification("manifest signature does not verify".into()))
}

/// Verify a shipped manifest end to end and decode it.
///
/// `cert_bytes` is the shipped signing certificate (PEM or DER),
/// `signature` the detached DER signature over `manifest_bytes`, and `ca`
/// the locally provisioned product CA. Returns the decoded, structurally
/// validated manifest only if every check passes.
pub fn verify_manifest(
    manifest_bytes: &[u8],
    cert_bytes: &[u8],
    signature: &[u8],
    ca: &Certificate,
) -> Result<InstallManifest> {
    let cert = parse_certificate(cert_bytes)?;
    verify_cert_chain(&cert, ca)?;
    verify_signature(&cert, manifest_bytes, signature)?;

    let manifest = InstallManifest::from_slice(manifest_bytes)?;
    manifest.validate()?;

    tracing::debug!(
        product = %manifest.product,
        targets = manifest.targets.len(),
        "Verified install manifest"
    );

    Ok(manifest)
}

/// Sign `data` with a PKCS#8 PEM private key, producing a detached DER
/// ECDSA P-256/SHA-256 signature.
pub fn sign_manifest(data: &[u8], key_pem: &str) -> Result<Vec<u8>> {
    let key = SigningKey::from_pkcs8_pem(key_pem)
        .map_err(|e| MachinaError::MalformedData(format!("undecodable signing key: {e}")))?;
    let signature: Signature = key.sign(data);
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Sign `data` with a PKCS#8 PEM private key stored at `key_path`.
pub fn sign_manifest_with_key_file(data: &[u8], key_path: &Path) -> Result<Vec<u8>> {
    let pem = std::fs::read_to_string(key_path)?;
    sign_manifest(data, &pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{date_time_ymd, BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    struct TestPki {
        ca_cert_pem: String,
        leaf_cert_pem: String,
        leaf_key_pem: String,
    }

    fn make_pki() -> TestPki {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(vec![]).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Machina Test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec![]).unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "manifest signer");
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        TestPki {
            ca_cert_pem: ca_cert.pem(),
            leaf_cert_pem: leaf_cert.pem(),
            leaf_key_pem: leaf_key.serialize_pem(),
        }
    }

    fn manifest_json() -> Vec<u8> {
        br#"{
            "version": 1,
            "product": "de6c82c5-2e01-4c92-949b-a6545d30fc06",
            "update_type": "complete",
            "targets": [{
                "service_name": "hostfs",
                "imagepath": "machina/images",
                "version": "1.0.0",
                "service_type": "hostfs",
                "nsgroup": "none",
                "digest": "sha256:aaa",
                "size": 1048576
            }]
        }"#
        .to_vec()
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let pki = make_pki();
        let ca = parse_certificate(pki.ca_cert_pem.as_bytes()).unwrap();
        let data = manifest_json();

        let sig = sign_manifest(&data, &pki.leaf_key_pem).unwrap();
        let manifest =
            verify_manifest(&data, pki.leaf_cert_pem.as_bytes(), &sig, &ca).unwrap();
        assert_eq!(manifest.product, "de6c82c5-2e01-4c92-949b-a6545d30fc06");
        assert_eq!(manifest.targets.len(), 1);
    }

    #[test]
    fn test_tampered_manifest_fails() {
        let pki = make_pki();
        let ca = parse_certificate(pki.ca_cert_pem.as_bytes()).unwrap();
        let data = manifest_json();
        let sig = sign_manifest(&data, &pki.leaf_key_pem).unwrap();

        let mut tampered = data.clone();
        let idx = tampered.len() / 2;
        tampered[idx] ^= 0x01;

        let err = verify_manifest(&tampered, pki.leaf_cert_pem.as_bytes(), &sig, &ca)
            .unwrap_err();
        assert!(matches!(err, MachinaError::Verification(_)), "{err}");
    }

    #[test]
    fn test_cert_from_wrong_ca_fails() {
        let pki = make_pki();
        let other = make_pki();
        let wrong_ca = parse_certificate(other.ca_cert_pem.as_bytes()).unwrap();
        let data = manifest_json();
        let sig = sign_manifest(&data, &pki.leaf_key_pem).unwrap();

        let err = verify_manifest(&data, pki.leaf_cert_pem.as_bytes(), &sig, &wrong_ca)
            .unwrap_err();
        assert!(matches!(err, MachinaError::Verification(_)), "{err}");
    }

    #[test]
    fn test_expired_cert_fails() {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(vec![]).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "Machina Test CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec![]).unwrap();
        leaf_params.not_before = date_time_ymd(1990, 1, 1);
        leaf_params.not_after = date_time_ymd(1991, 1, 1);
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let ca = parse_certificate(ca_cert.pem().as_bytes()).unwrap();
        let leaf = parse_certificate(leaf_cert.pem().as_bytes()).unwrap();
        let err = verify_cert_chain(&leaf, &ca).unwrap_err();
        assert!(matches!(err, MachinaError::Verification(_)), "{err}");
    }

    #[test]
    fn test_tampered_certificate_fails() {
        let pki = make_pki();
        let ca = parse_certificate(pki.ca_cert_pem.as_bytes()).unwrap();
        let data = manifest_json();
        let sig = sign_manifest(&data, &pki.leaf_key_pem).unwrap();

        // Flip one character in the base64 body of the shipped cert.
        let mut cert = pki.leaf_cert_pem.into_bytes();
        let idx = cert.len() / 2;
        cert[idx] = if cert[idx] == b'A' { b'B' } else { b'A' };

        assert!(verify_manifest(&data, &cert, &sig, &ca).is_err());
    }

    #[test]
    fn test_garbage_signature_is_malformed() {
        let pki = make_pki();
        let cert = parse_certificate(pki.leaf_cert_pem.as_bytes()).unwrap();
        let err = verify_signature(&cert, b"data", b"not a der signature").unwrap_err();
        assert!(matches!(err, MachinaError::MalformedData(_)));
    }

    #[test]
    fn test_pem_to_der_rejects_garbage() {
        assert!(pem_to_der("-----BEGIN X-----\n!!!\n-----END X-----\n").is_err());
    }

    #[test]
    fn test_untrusted_bytes_never_decoded() {
        // An unsigned manifest with valid JSON must still be rejected
        // before decoding succeeds.
        let pki = make_pki();
        let ca = parse_certificate(pki.ca_cert_pem.as_bytes()).unwrap();
        let data = manifest_json();
        let other_key = KeyPair::generate().unwrap();
        let sig = sign_manifest(&data, &other_key.serialize_pem()).unwrap();

        let err = verify_manifest(&data, pki.leaf_cert_pem.as_bytes(), &sig, &ca)
            .unwrap_err();
        assert!(matches!(err, MachinaError::Verification(_)));
    }
}
