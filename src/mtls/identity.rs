//! Certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the fields the trust
//! subsystem works with: Common Name, Organisational Unit, SAN DNS names,
//! serial number, validity window and the SHA-256 fingerprint used to index
//! client certificates.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::mtls::subject::Subject;
use crate::{Error, Result};

/// Hex-encoded SHA-256 digest of a DER certificate.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Fields extracted from a parsed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// First Organisational Unit (OU) in the subject.
    pub organizational_unit: Option<String>,

    /// DNS entries of the Subject Alternative Name extension.
    pub san_dns_names: Vec<String>,

    /// Decimal serial number.
    pub serial: String,

    /// Start of the validity window.
    pub not_before: OffsetDateTime,

    /// End of the validity window.
    pub not_after: OffsetDateTime,

    /// `true` when basic constraints mark this as a CA certificate.
    pub is_ca: bool,

    /// SHA-256 fingerprint of the DER encoding.
    pub fingerprint: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the certificate cannot be parsed or
    /// carries a validity timestamp out of range.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {e}")))?;

        let validity = cert.validity();
        Ok(Self {
            common_name: extract_cn(&cert),
            organizational_unit: extract_ou(&cert),
            san_dns_names: extract_dns_sans(&cert),
            serial: cert.tbs_certificate.serial.to_string(),
            not_before: to_datetime(validity.not_before.timestamp())?,
            not_after: to_datetime(validity.not_after.timestamp())?,
            is_ca: cert.is_ca(),
            fingerprint: fingerprint(der),
        })
    }

    /// Recover the service [`Subject`] from the common name.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` when there is no CN or it does not name a
    /// valid service subject.
    pub fn subject(&self) -> Result<Subject> {
        let cn = self
            .common_name
            .as_deref()
            .ok_or_else(|| Error::Validation("certificate has no common name".to_string()))?;
        Subject::from_common_name(cn)
    }

    /// Human-readable label for logs: the CN, or the fingerprint prefix when
    /// there is none.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.common_name
            .clone()
            .unwrap_or_else(|| format!("sha256:{}", &self.fingerprint[..16]))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_ou(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_dns_sans(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut dns_names = Vec::new();
    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_owned());
            }
        }
    }
    dns_names
}

fn to_datetime(timestamp: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .map_err(|e| Error::Certificate(format!("Certificate validity out of range: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
