//! Certificate material management: PEM loading, server certificates and
//! lifecycle checks.
//!
//! Provides:
//! - [`parse_certs_pem`] / [`parse_private_key_pem`] and their file-backed
//!   variants [`load_certs`] / [`load_private_key`]
//! - [`ServerCertificate`] - a certificate chain plus its signing key, ready to
//!   be served by rustls
//! - [`verify_self_trust`] - checks a chain verifies against its own roots
//! - [`check_time_validity`] / [`check_renewal`] - validity window checks
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;

use crate::mtls::crypto_provider;
use crate::mtls::identity::CertIdentity;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Parse every certificate in a PEM blob.
///
/// # Errors
///
/// Returns an error if a PEM block is malformed or no certificate is present.
pub fn parse_certs_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Certificate(format!("Failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Certificate("No certificates found in PEM data".to_string()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM blob (PKCS#8, PKCS#1 or SEC1).
///
/// # Errors
///
/// Returns an error if no private key is present or it cannot be decoded.
pub fn parse_private_key_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::Certificate(format!("Failed to parse private key: {e}")))
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    parse_certs_pem(&read_file(path)?).map_err(|e| annotate(e, path))
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    parse_private_key_pem(&read_file(path)?).map_err(|e| annotate(e, path))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: server certificate
// ─────────────────────────────────────────────────────────────────────────────

/// A certificate chain with its private key, as served in a TLS handshake.
///
/// Cheap to clone; the signing key and parsed leaf identity are shared.
#[derive(Clone)]
pub struct ServerCertificate {
    certified_key: Arc<CertifiedKey>,
    identity: Arc<CertIdentity>,
}

impl ServerCertificate {
    /// Build from a DER chain (leaf first) and its private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyMismatch`] if the key does not belong to the leaf,
    /// and [`Error::Certificate`] for an empty chain or unparseable leaf.
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate("empty certificate chain".to_string()))?;
        let identity = CertIdentity::from_der(leaf)?;

        let certified_key =
            CertifiedKey::from_der(chain, key, &crypto_provider()).map_err(|e| match e {
                rustls::Error::InconsistentKeys(inner) => {
                    Error::KeyMismatch(format!("{inner:?} for '{}'", identity.display_name()))
                }
                other => Error::Tls(other),
            })?;

        Ok(Self {
            certified_key: Arc::new(certified_key),
            identity: Arc::new(identity),
        })
    }

    /// Build from a PEM certificate chain and PEM private key.
    ///
    /// # Errors
    ///
    /// See [`ServerCertificate::new`]; additionally fails on malformed PEM.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        Self::new(parse_certs_pem(cert_pem)?, parse_private_key_pem(key_pem)?)
    }

    /// Load `cert_path` / `key_path` PEM files.
    ///
    /// # Errors
    ///
    /// See [`ServerCertificate::from_pem`]; additionally fails on IO errors.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        Self::new(load_certs(cert_path)?, load_private_key(key_path)?)
    }

    /// The rustls signing material.
    #[must_use]
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    /// The full chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// The leaf certificate.
    #[must_use]
    pub fn leaf(&self) -> &CertificateDer<'static> {
        // Construction rejects empty chains.
        &self.certified_key.cert[0]
    }

    /// Parsed identity of the leaf certificate.
    #[must_use]
    pub fn identity(&self) -> &CertIdentity {
        &self.identity
    }

    /// DNS SANs of the leaf certificate.
    #[must_use]
    pub fn dns_names(&self) -> &[String] {
        &self.identity.san_dns_names
    }

    /// Returns `true` if any DNS SAN covers `hostname`.
    ///
    /// Matching is case-insensitive; `*.example.com` covers exactly one
    /// additional leading label.
    #[must_use]
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        self.dns_names()
            .iter()
            .any(|pattern| dns_name_matches(&pattern.to_ascii_lowercase(), &hostname))
    }
}

impl fmt::Debug for ServerCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCertificate")
            .field("common_name", &self.identity.common_name)
            .field("dns_names", &self.identity.san_dns_names)
            .field("fingerprint", &self.identity.fingerprint)
            .finish_non_exhaustive()
    }
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => hostname
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == hostname,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: lifecycle checks
// ─────────────────────────────────────────────────────────────────────────────

/// Verify a certificate chain against the roots it carries itself.
///
/// The chain's non-leaf certificates (or the leaf itself, for a single
/// self-signed certificate) are used as trust anchors, and the leaf is
/// verified as a server certificate for its first DNS SAN.  A failure means
/// the chain file is incomplete or only trusted through some outside root.
///
/// # Errors
///
/// Returns an error describing why the chain does not verify.
pub fn verify_self_trust(cert: &ServerCertificate) -> Result<()> {
    let chain = cert.chain();
    let (anchors, intermediates) = if chain.len() > 1 {
        (&chain[1..], &chain[1..])
    } else {
        (chain, &chain[..0])
    };

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(anchors.iter().cloned());
    if added == 0 {
        return Err(Error::Validation(
            "certificate chain contains no usable trust anchor".to_string(),
        ));
    }

    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), crypto_provider())
        .build()
        .map_err(|e| Error::Validation(format!("Failed to build chain verifier: {e}")))?;

    let name = cert
        .dns_names()
        .first()
        .map(|n| n.replacen('*', "self-trust", 1))
        .ok_or_else(|| Error::Validation("certificate has no DNS names".to_string()))?;
    let server_name = ServerName::try_from(name)
        .map_err(|e| Error::Validation(format!("invalid DNS name in certificate: {e}")))?;

    verifier
        .verify_server_cert(cert.leaf(), intermediates, &server_name, &[], UnixTime::now())
        .map_err(|e| Error::Validation(format!("certificate chain does not verify: {e}")))?;
    Ok(())
}

/// Check `now` lies within the certificate's validity window.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the window is empty, has not started
/// yet, or has already ended.
pub fn check_time_validity(identity: &CertIdentity, now: OffsetDateTime) -> Result<()> {
    if identity.not_after <= identity.not_before {
        return Err(Error::Validation(format!(
            "certificate expires at {} before it begins to be valid at {}",
            identity.not_after, identity.not_before
        )));
    }
    if now < identity.not_before {
        return Err(Error::Validation(format!(
            "certificate lifetime start {} is in the future",
            identity.not_before
        )));
    }
    if now > identity.not_after {
        return Err(Error::Validation(format!(
            "certificate expired at {}",
            identity.not_after
        )));
    }
    Ok(())
}

/// Check the certificate is valid and not yet past half of its lifetime.
///
/// # Errors
///
/// Returns [`Error::Validation`] when [`check_time_validity`] fails or the
/// refresh point (start + half the validity period) has passed.
pub fn check_renewal(identity: &CertIdentity, now: OffsetDateTime) -> Result<()> {
    check_time_validity(identity, now)?;
    let refresh_at = identity.not_before + (identity.not_after - identity.not_before) / 2;
    if now > refresh_at {
        return Err(Error::Validation(format!(
            "certificate is past half of its validity, {refresh_at}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

fn annotate(err: Error, path: &Path) -> Error {
    match err {
        Error::Certificate(msg) => Error::Certificate(format!("{msg} ('{}')", path.display())),
        other => other,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::ca::{CertificateAuthority, IssueOptions, SigningProfile};
    use crate::mtls::subject::Subject;

    fn issued_central() -> (CertificateAuthority, ServerCertificate) {
        let ca = CertificateAuthority::generate().unwrap();
        let issued = ca
            .issue_cert_for_subject(&Subject::central(), &IssueOptions::default())
            .unwrap();
        let cert = issued.to_server_certificate().unwrap();
        (ca, cert)
    }

    // ─── PEM parsing ──────────────────────────────────────────────────────────

    #[test]
    fn parse_certs_pem_rejects_empty_input() {
        assert!(parse_certs_pem(b"").is_err());
    }

    #[test]
    fn parse_private_key_pem_rejects_cert_only_pem() {
        let ca = CertificateAuthority::generate().unwrap();
        assert!(parse_private_key_pem(ca.cert_pem().as_bytes()).is_err());
    }

    #[test]
    fn load_certs_returns_error_for_missing_file() {
        let result = load_certs(Path::new("/nonexistent/path/ca.pem"));
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("Cannot read"));
    }

    #[test]
    fn load_certs_and_key_from_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::generate().unwrap();
        let issued = ca
            .issue_cert_for_subject(&Subject::scanner(), &IssueOptions::default())
            .unwrap();
        fs::write(dir.path().join("cert.pem"), &issued.cert_pem).unwrap();
        fs::write(dir.path().join("key.pem"), &issued.key_pem).unwrap();

        let cert =
            ServerCertificate::load(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
                .unwrap();
        assert_eq!(cert.identity().common_name.as_deref(), Some("SCANNER_SERVICE: Scanner"));
    }

    // ─── ServerCertificate ────────────────────────────────────────────────────

    #[test]
    fn server_certificate_rejects_mismatched_key() {
        // GIVEN: two certificates issued by the same CA
        let ca = CertificateAuthority::generate().unwrap();
        let a = ca
            .issue_cert_for_subject(&Subject::central(), &IssueOptions::default())
            .unwrap();
        let b = ca
            .issue_cert_for_subject(&Subject::scanner(), &IssueOptions::default())
            .unwrap();
        // WHEN: pairing a's cert with b's key
        let result = ServerCertificate::from_pem(a.cert_pem.as_bytes(), b.key_pem.as_bytes());
        // THEN: key mismatch
        assert!(matches!(result, Err(Error::KeyMismatch(_))));
    }

    #[test]
    fn matches_hostname_is_case_insensitive() {
        let (_, cert) = issued_central();
        assert!(cert.matches_hostname("central.stackrox"));
        assert!(cert.matches_hostname("CENTRAL.stackrox.svc"));
        assert!(!cert.matches_hostname("not-central.stackrox"));
    }

    #[test]
    fn wildcard_pattern_covers_one_label() {
        assert!(dns_name_matches("*.example.com", "api.example.com"));
        assert!(!dns_name_matches("*.example.com", "a.b.example.com"));
        assert!(!dns_name_matches("*.example.com", "example.com"));
    }

    // ─── Self trust ───────────────────────────────────────────────────────────

    #[test]
    fn leaf_without_issuer_in_chain_fails_self_trust() {
        // A leaf alone is not its own root: it was signed by the CA.
        let (_, cert) = issued_central();
        assert!(verify_self_trust(&cert).is_err());
    }

    #[test]
    fn leaf_with_issuing_ca_in_chain_passes_self_trust() {
        // GIVEN: a leaf followed by the CA that signed it
        let ca = CertificateAuthority::generate().unwrap();
        let issued = ca
            .issue_cert_for_subject(&Subject::central(), &IssueOptions::default())
            .unwrap();
        let mut chain = issued.chain();
        chain.push(ca.certificate().clone());
        let key = parse_private_key_pem(issued.key_pem.as_bytes()).unwrap();
        // WHEN: building the served certificate
        let with_root = ServerCertificate::new(chain, key).unwrap();
        // THEN: the chain verifies against its own root
        assert!(verify_self_trust(&with_root).is_ok());
    }

    // ─── Validity ─────────────────────────────────────────────────────────────

    #[test]
    fn fresh_certificate_is_valid_and_not_due_for_renewal() {
        let (_, cert) = issued_central();
        let now = OffsetDateTime::now_utc();
        assert!(check_time_validity(cert.identity(), now).is_ok());
        assert!(check_renewal(cert.identity(), now).is_ok());
    }

    #[test]
    fn certificate_past_half_life_needs_renewal() {
        let ca = CertificateAuthority::generate().unwrap();
        let issued = ca
            .issue_cert_for_subject(
                &Subject::central(),
                &IssueOptions::default().with_profile(SigningProfile::Hours),
            )
            .unwrap();
        let id = issued.cert_identity().unwrap();
        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        assert!(check_time_validity(&id, later).is_ok());
        assert!(check_renewal(&id, later).is_err());
    }

    #[test]
    fn expired_certificate_fails_time_validity() {
        let (_, cert) = issued_central();
        let far_future = OffsetDateTime::now_utc() + time::Duration::days(400);
        assert!(check_time_validity(cert.identity(), far_future).is_err());
    }
}
