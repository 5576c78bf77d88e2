//! Service certificate authority.
//!
//! A [`CertificateAuthority`] wraps a CA certificate and, when it is
//! signing-capable, the CA private key.  It issues leaf certificates for
//! service [`Subject`]s and validates that presented certificates were issued
//! by it.
//!
//! # Signing profiles
//!
//! | Profile | Lifetime | Backdate |
//! |---------|----------|----------|
//! | [`SigningProfile::Default`] | 365 days | 1 hour |
//! | [`SigningProfile::Days`] | 2 days | 1 hour |
//! | [`SigningProfile::Hours`] | 3 hours | 1 hour |
//!
//! The window is `not_before = now - backdate`, `not_after = not_before +
//! lifetime`, so the backdate absorbs clock skew without extending the
//! lifetime.
//!
//! # Serial numbers
//!
//! Every leaf gets a serial drawn uniformly from `[1, 2^64)` by the thread
//! CSPRNG.  No registry of issued serials is kept.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::mtls::cert_manager::{ServerCertificate, parse_certs_pem, parse_private_key_pem};
use crate::mtls::crypto_provider;
use crate::mtls::identity::CertIdentity;
use crate::mtls::subject::{ServiceType, Subject};
use crate::{Error, Result};

/// Common name every service CA certificate must carry.
pub const SERVICE_CA_COMMON_NAME: &str = "StackRox Certificate Authority";

const CA_VALIDITY_DAYS: i64 = 5 * 365;

// ─────────────────────────────────────────────────────────────────────────────
// Signing profiles and options
// ─────────────────────────────────────────────────────────────────────────────

/// Lifetime policy applied to an issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningProfile {
    /// Year-long service certificates.
    #[default]
    Default,
    /// Short-lived material that expires on its own within hours.
    Hours,
    /// Intermediate lifetime of a couple of days.
    Days,
}

impl SigningProfile {
    /// How long the certificate stays valid.
    #[must_use]
    pub const fn lifetime(self) -> Duration {
        match self {
            Self::Default => Duration::days(365),
            Self::Hours => Duration::hours(3),
            Self::Days => Duration::days(2),
        }
    }

    /// How far `not_before` is moved into the past.
    #[must_use]
    pub const fn backdate(self) -> Duration {
        Duration::hours(1)
    }

    /// `(not_before, not_after)` for a certificate issued at `now`.
    #[must_use]
    pub fn validity_window(self, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        let not_before = now - self.backdate();
        (not_before, not_before + self.lifetime())
    }
}

impl FromStr for SigningProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "hours" => Ok(Self::Hours),
            "days" => Ok(Self::Days),
            other => Err(Error::Validation(format!("unknown signing profile '{other}'"))),
        }
    }
}

/// Options for [`CertificateAuthority::issue_cert_for_subject`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueOptions {
    namespace: Option<String>,
    profile: SigningProfile,
}

impl IssueOptions {
    /// Also cover the hostnames of `namespace` (ignored for the default one).
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sign with `profile` instead of [`SigningProfile::Default`].
    #[must_use]
    pub fn with_profile(mut self, profile: SigningProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Requested namespace, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Requested signing profile.
    #[must_use]
    pub fn profile(&self) -> SigningProfile {
        self.profile
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Issued certificates
// ─────────────────────────────────────────────────────────────────────────────

/// Logical identity recorded for an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Subject identifier.
    pub id: String,
    /// Subject service type.
    pub service_type: ServiceType,
    /// Decimal serial number of the certificate.
    pub serial: String,
}

/// A freshly issued leaf certificate and its private key.
#[derive(Clone)]
pub struct IssuedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
    /// DER-encoded certificate.
    pub cert_der: CertificateDer<'static>,
    /// Identity the certificate was issued for.
    pub service_identity: ServiceIdentity,
}

impl IssuedCert {
    /// The certificate as a single-element chain.
    #[must_use]
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone()]
    }

    /// Parse the issued certificate's fields.
    ///
    /// # Errors
    ///
    /// Fails only if the certificate cannot be parsed.
    pub fn cert_identity(&self) -> Result<CertIdentity> {
        CertIdentity::from_der(&self.cert_der)
    }

    /// Turn the certificate and key into servable TLS material.
    ///
    /// # Errors
    ///
    /// See [`ServerCertificate::from_pem`].
    pub fn to_server_certificate(&self) -> Result<ServerCertificate> {
        ServerCertificate::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
    }
}

impl fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("service_identity", &self.service_identity)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate authority
// ─────────────────────────────────────────────────────────────────────────────

struct Signer {
    issuer: Issuer<'static, KeyPair>,
    key_pem: String,
}

/// A service CA, either signing-capable or validation-only.
pub struct CertificateAuthority {
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    identity: CertIdentity,
    roots: Arc<RootCertStore>,
    verifier: Arc<dyn ClientCertVerifier>,
    signer: Option<Signer>,
}

impl CertificateAuthority {
    /// Generate a new self-signed service CA.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or self-signing fails.
    pub fn generate() -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Signing(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, SERVICE_CA_COMMON_NAME);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from_slice(&random_serial().to_be_bytes()));
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::hours(1);
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Signing(format!("CA cert generation failed: {e}")))?;

        let signer = Signer {
            key_pem: key_pair.serialize_pem(),
            issuer: Issuer::new(params, key_pair),
        };
        Self::from_parts(cert.pem(), cert.der().clone(), Some(signer))
    }

    /// Load a signing-capable CA from PEM certificate and key.
    ///
    /// # Errors
    ///
    /// Returns an error if either PEM blob is malformed or the key does not
    /// belong to the certificate.
    pub fn load_for_signing(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_der = first_cert(cert_pem)?;

        // Reject a key that does not belong to the certificate before it is
        // used to sign anything.
        ServerCertificate::new(vec![cert_der.clone()], parse_private_key_pem(key_pem)?)?;

        let key_str = std::str::from_utf8(key_pem)
            .map_err(|e| Error::Certificate(format!("CA key is not valid PEM text: {e}")))?;
        let key_pair = KeyPair::from_pem(key_str)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA cert for signing: {e}")))?;

        let signer = Signer {
            issuer,
            key_pem: key_str.to_string(),
        };
        Self::from_parts(pem_text(cert_pem)?, cert_der, Some(signer))
    }

    /// Load a validation-only CA from a PEM certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the PEM blob holds no parseable certificate.
    pub fn load_for_validation(cert_pem: &[u8]) -> Result<Self> {
        let cert_der = first_cert(cert_pem)?;
        Self::from_parts(pem_text(cert_pem)?, cert_der, None)
    }

    fn from_parts(
        cert_pem: String,
        cert_der: CertificateDer<'static>,
        signer: Option<Signer>,
    ) -> Result<Self> {
        let identity = CertIdentity::from_der(&cert_der)?;

        let mut roots = RootCertStore::empty();
        roots
            .add(cert_der.clone())
            .map_err(|e| Error::Certificate(format!("CA cert is not a usable trust anchor: {e}")))?;
        let roots = Arc::new(roots);

        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), crypto_provider())
            .build()
            .map_err(|e| Error::Certificate(format!("Failed to build CA verifier: {e}")))?;

        Ok(Self {
            cert_pem,
            cert_der,
            identity,
            roots,
            verifier,
            signer,
        })
    }

    /// `true` when the CA holds its private key.
    #[must_use]
    pub fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    /// PEM-encoded CA certificate.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded CA private key; `None` on a validation-only CA.
    #[must_use]
    pub fn key_pem(&self) -> Option<&str> {
        self.signer.as_ref().map(|s| s.key_pem.as_str())
    }

    /// DER-encoded CA certificate.
    #[must_use]
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Parsed fields of the CA certificate.
    #[must_use]
    pub fn identity(&self) -> &CertIdentity {
        &self.identity
    }

    /// Trust store containing only this CA.
    #[must_use]
    pub fn cert_pool(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// Check the certificate is a CA carrying the service CA common name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first violated property.
    pub fn check_properties(&self) -> Result<()> {
        if !self.identity.is_ca {
            return Err(Error::Validation(
                "service CA certificate is not a CA certificate".to_string(),
            ));
        }
        if self.identity.common_name.as_deref() != Some(SERVICE_CA_COMMON_NAME) {
            return Err(Error::Validation(format!(
                "service CA common name is {:?}, expected {SERVICE_CA_COMMON_NAME:?}",
                self.identity.common_name
            )));
        }
        Ok(())
    }

    /// Issue a leaf certificate for `subject`.
    ///
    /// Generates a fresh key pair and serial number on every call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed subject and
    /// [`Error::Signing`] when the CA cannot sign or signing fails.
    pub fn issue_cert_for_subject(&self, subject: &Subject, opts: &IssueOptions) -> Result<IssuedCert> {
        subject.validate()?;
        let signer = self.signer.as_ref().ok_or_else(|| {
            Error::Signing("CA has no private key and can only validate certificates".to_string())
        })?;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Signing(format!("Failed to generate leaf key: {e}")))?;
        let serial = random_serial();

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.common_name());
        dn.push(DnType::OrganizationalUnitName, subject.organizational_unit());
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
        (params.not_before, params.not_after) =
            opts.profile().validity_window(OffsetDateTime::now_utc());
        params.subject_alt_names = subject
            .all_hostnames(opts.namespace())
            .iter()
            .map(|host| {
                Ia5String::try_from(host.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::Validation(format!("Invalid DNS SAN '{host}': {e}")))
            })
            .collect::<Result<_>>()?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let cert = params
            .signed_by(&key_pair, &signer.issuer)
            .map_err(|e| Error::Signing(format!("Leaf cert signing failed: {e}")))?;

        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: cert.der().clone(),
            service_identity: ServiceIdentity {
                id: subject.identifier.clone(),
                service_type: subject.service_type,
                serial: serial.to_string(),
            },
        })
    }

    /// Verify `cert` was issued by this CA and recover its subject.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the certificate does not chain to
    /// this CA (including certificates from unrelated CAs with the same
    /// naming scheme) or its common name is not a valid subject.
    pub fn validate_and_extract_subject(&self, cert: &CertificateDer<'_>) -> Result<Subject> {
        self.validate_and_extract_subject_at(cert, OffsetDateTime::now_utc())
    }

    /// [`Self::validate_and_extract_subject`] with validity judged at `now`.
    ///
    /// # Errors
    ///
    /// As [`Self::validate_and_extract_subject`].
    pub fn validate_and_extract_subject_at(
        &self,
        cert: &CertificateDer<'_>,
        now: OffsetDateTime,
    ) -> Result<Subject> {
        self.verify_chain_at(cert, &[], now)?;
        CertIdentity::from_der(cert)?.subject()
    }

    /// Verify `leaf` (plus optional intermediates) chains to this CA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when path building or signature checks
    /// fail, or the certificate is outside its validity window.
    pub fn verify_chain(
        &self,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<()> {
        self.verify_chain_at(leaf, intermediates, OffsetDateTime::now_utc())
    }

    /// [`Self::verify_chain`] at a fixed point in time.
    ///
    /// # Errors
    ///
    /// As [`Self::verify_chain`].
    pub fn verify_chain_at(
        &self,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: OffsetDateTime,
    ) -> Result<()> {
        let secs = u64::try_from(now.unix_timestamp()).unwrap_or_default();
        let now = UnixTime::since_unix_epoch(std::time::Duration::from_secs(secs));
        self.verifier
            .verify_client_cert(leaf, intermediates, now)
            .map(|_| ())
            .map_err(|e| Error::Validation(format!("certificate was not issued by this CA: {e}")))
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("common_name", &self.identity.common_name)
            .field("fingerprint", &self.identity.fingerprint)
            .field("can_sign", &self.can_sign())
            .finish_non_exhaustive()
    }
}

fn first_cert(cert_pem: &[u8]) -> Result<CertificateDer<'static>> {
    parse_certs_pem(cert_pem)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Certificate("No CA certificate found".to_string()))
}

fn pem_text(pem: &[u8]) -> Result<String> {
    String::from_utf8(pem.to_vec())
        .map_err(|e| Error::Certificate(format!("CA certificate is not valid PEM text: {e}")))
}

fn random_serial() -> u64 {
    loop {
        let serial: u64 = rand::random();
        if serial != 0 {
            return serial;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
