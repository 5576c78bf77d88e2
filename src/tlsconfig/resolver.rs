//! Handshake-time hooks that defer to the holder's live snapshot.
//!
//! The [`rustls::ServerConfig`] handed to a listener is built once.  Its
//! certificate resolver and client verifier look up the holder's most
//! recently published snapshot for every handshake, so a listener keeps
//! serving rotated material without being rebuilt.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tracing::{debug, warn};

use crate::Error;
use crate::mtls::cert_manager::ServerCertificate;
use crate::tlsconfig::holder::TlsConfigHolder;

/// Pick the certificate to serve for `server_name`.
///
/// An SNI match wins; otherwise the first certificate is served.
pub(crate) fn select_certificate<'a>(
    certs: &'a [ServerCertificate],
    server_name: Option<&str>,
) -> Option<&'a ServerCertificate> {
    server_name
        .and_then(|name| certs.iter().find(|c| c.matches_hostname(name)))
        .or_else(|| certs.first())
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate resolution
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves certificates from whatever snapshot is live at handshake time.
pub(crate) struct LiveCertResolver {
    pub(crate) holder: Arc<TlsConfigHolder>,
}

impl ResolvesServerCert for LiveCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match self.holder.select_certificate(client_hello.server_name()) {
            Ok(cert) => Some(Arc::clone(cert.certified_key())),
            Err(e) => {
                warn!(sni = ?client_hello.server_name(), error = %e, "Refusing TLS handshake");
                None
            }
        }
    }
}

impl fmt::Debug for LiveCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCertResolver").finish_non_exhaustive()
    }
}

/// Resolves certificates from one fixed snapshot.
#[derive(Debug)]
pub(crate) struct SnapshotCertResolver {
    pub(crate) certs: Vec<ServerCertificate>,
}

impl ResolvesServerCert for SnapshotCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let selected = select_certificate(&self.certs, client_hello.server_name());
        if selected.is_none() {
            warn!(error = %Error::NoCertificate, "Refusing TLS handshake");
        }
        selected.map(|c| Arc::clone(c.certified_key()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client verification
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies client certificates against the live snapshot's CA pool.
///
/// Root hints are not sent: they cannot be borrowed out of a snapshot that
/// may be replaced mid-handshake.  For the same reason the request and the
/// verification can see different snapshots; a certificate that arrives
/// after client auth was switched off is rejected.
pub(crate) struct LiveClientVerifier {
    pub(crate) holder: Arc<TlsConfigHolder>,
    pub(crate) provider: Arc<CryptoProvider>,
}

impl LiveClientVerifier {
    fn current(&self) -> Option<Arc<dyn ClientCertVerifier>> {
        self.holder.current_snapshot().map(|s| s.verifier())
    }
}

impl ClientCertVerifier for LiveClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.current().is_some_and(|v| v.offer_client_auth())
    }

    fn client_auth_mandatory(&self) -> bool {
        self.current().is_some_and(|v| v.client_auth_mandatory())
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        match self.current() {
            Some(verifier) if verifier.offer_client_auth() => {
                verifier.verify_client_cert(end_entity, intermediates, now)
            }
            // Client auth was offered by an earlier snapshot; the live one no
            // longer verifies anything.
            Some(_) => {
                debug!("Rejecting client certificate: client auth disabled since it was requested");
                Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
            }
            None => Err(rustls::Error::General(Error::NoTlsConfig.to_string())),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl fmt::Debug for LiveClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClientVerifier").finish_non_exhaustive()
    }
}

/// Client verifier for a verifying mode with no trusted client CAs.
///
/// Every presented certificate fails with an unknown issuer; whether a
/// missing certificate is tolerated depends on `mandatory`.
#[derive(Debug)]
pub(crate) struct EmptyPoolVerifier {
    pub(crate) mandatory: bool,
    pub(crate) provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for EmptyPoolVerifier {
    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        debug!("Rejecting client certificate: no client CAs configured");
        Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
