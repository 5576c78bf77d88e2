//! Service identities and certificate material.
//!
//! # Architecture
//!
//! ```text
//! Subject (service type + id)
//!   → CertificateAuthority::issue_cert_for_subject
//!   → IssuedCert (PEM cert + key, service identity)
//!   → file map  (ca.pem / cert.pem / key.pem)  ⇄  secret directory
//!   → ServerCertificate (rustls CertifiedKey + parsed CertIdentity)
//! ```
//!
//! # Modules
//!
//! - [`subject`] - service types and the CN / OU / hostname naming scheme
//! - [`ca`] - the service CA: issuance, signing profiles, validation
//! - [`identity`] - X.509 field extraction (`CertIdentity`) and fingerprints
//! - [`cert_manager`] - PEM loading, `ServerCertificate`, lifecycle checks
//! - [`file_map`] - canonical file-name layout of CA and service secrets

use std::sync::{Arc, LazyLock};

use rustls::crypto::CryptoProvider;

pub mod ca;
pub mod cert_manager;
pub mod file_map;
pub mod identity;
pub mod subject;

pub use ca::{
    CertificateAuthority, IssueOptions, IssuedCert, SERVICE_CA_COMMON_NAME, ServiceIdentity,
    SigningProfile,
};
pub use cert_manager::{
    ServerCertificate, check_renewal, check_time_validity, load_certs, load_private_key,
    verify_self_trust,
};
pub use identity::{CertIdentity, fingerprint};
pub use subject::{ServiceType, Subject};

static CRYPTO_PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

/// The crypto provider every config, verifier and signer in the crate uses.
///
/// Passed explicitly rather than relying on a process-wide default, so
/// binaries and tests never depend on `install_default` having been called.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::clone(&CRYPTO_PROVIDER)
}
