//! Process-wide owner of trust material.
//!
//! # Sources
//!
//! | Name | Kind | Contents |
//! |------|------|----------|
//! | `service-cert` | server certs | internal service certificate (+ namespace variant) |
//! | `default-cert` | server certs | operator certificate from the watched directory |
//! | `service-ca` | client CAs | internal CA (+ secondary CA) |
//! | `user-providers` | client CAs | CAs of registered identity providers |
//!
//! Every change to a replaceable source is pushed to every live holder while
//! the manager's write lock is held, so a holder registered concurrently
//! with a change can never miss it.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::certwatch::DirectoryWatcher;
use crate::config::TrustConfig;
use crate::mtls::ca::{CertificateAuthority, IssueOptions};
use crate::mtls::cert_manager::ServerCertificate;
use crate::mtls::file_map::{
    CA_CERT_FILE_NAME, CA_KEY_FILE_NAME, SECONDARY_CA_CERT_FILE_NAME, load_ca_from_file_map,
    load_service_cert_from_file_map, read_file_map_from_dir,
};
use crate::mtls::subject::Subject;
use crate::tlsconfig::{
    ClientAuthMode, ClientCaSourceCell, ServerCertSourceCell, SourceCell, TlsConfigHolder, TlsTemplate,
};
use crate::trust::default_cert::{DefaultCertHandler, load_default_cert};
use crate::trust::registry::{AuthProvider, ClientCaRegistry};
use crate::{DEFAULT_NAMESPACE, Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Configurer options
// ─────────────────────────────────────────────────────────────────────────────

/// Where a listener's server certificates come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerCertSource {
    /// Operator-supplied default certificate.
    DefaultCert,
    /// Internal service certificates.
    ServiceCert,
}

impl FromStr for ServerCertSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default-cert" => Ok(Self::DefaultCert),
            "service-cert" => Ok(Self::ServiceCert),
            other => Err(Error::Config(format!("unknown server certificate source '{other}'"))),
        }
    }
}

/// Where a listener's trusted client CAs come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientCaSource {
    /// CAs of registered identity providers.
    UserProviders,
    /// The internal service CA.
    ServiceCa,
}

impl FromStr for ClientCaSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user-providers" => Ok(Self::UserProviders),
            "service-ca" => Ok(Self::ServiceCa),
            other => Err(Error::Config(format!("unknown client CA source '{other}'"))),
        }
    }
}

/// Declarative description of a listener's TLS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfigurerOptions {
    /// Server certificate sources, most preferred first.
    pub server_certs: Vec<ServerCertSource>,
    /// Client CA sources.
    pub client_cas: Vec<ClientCaSource>,
    /// Reject clients without a verified certificate.
    pub require_client_cert: bool,
    /// Client authentication while no client CA is available.
    pub fallback_client_auth: ClientAuthMode,
}

impl TlsConfigurerOptions {
    /// Build options from source names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unrecognised source name.
    pub fn from_names(server_certs: &[&str], client_cas: &[&str], require_client_cert: bool) -> Result<Self> {
        Ok(Self {
            server_certs: server_certs.iter().map(|s| s.parse()).collect::<Result<_>>()?,
            client_cas: client_cas.iter().map(|s| s.parse()).collect::<Result<_>>()?,
            require_client_cert,
            fallback_client_auth: ClientAuthMode::NoClientCert,
        })
    }

    fn template(&self) -> TlsTemplate {
        TlsTemplate {
            client_auth: if self.require_client_cert {
                ClientAuthMode::RequireAndVerifyClientCert
            } else {
                ClientAuthMode::VerifyClientCertIfGiven
            },
            fallback_client_auth: self.fallback_client_auth,
            ..TlsTemplate::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Internal trust material loaded at startup.
#[derive(Debug)]
pub struct InternalTrust {
    /// Internal service CA.
    pub ca: CertificateAuthority,
    /// Secondary CA certificate trusted alongside the CA, if any.
    pub secondary_ca_cert: Option<CertificateDer<'static>>,
    /// This service's own certificate.
    pub service_cert: ServerCertificate,
}

/// Deployment settings affecting the internal certificate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustSettings {
    /// Namespace the service runs in.
    pub namespace: String,
    /// Identity of this service.
    pub subject: Subject,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            subject: Subject::central(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trust manager
// ─────────────────────────────────────────────────────────────────────────────

struct TrustState {
    registry: ClientCaRegistry,
    default_cert: Option<ServerCertificate>,
    holders: Vec<Weak<TlsConfigHolder>>,
}

/// Owns the internal roots, service and default certificates, and the
/// registered identity providers, and keeps every TLS holder current.
pub struct TrustManager {
    ca: CertificateAuthority,
    internal_roots: ClientCaSourceCell,
    service_certs: ServerCertSourceCell,
    default_cert: ServerCertSourceCell,
    user_client_cas: ClientCaSourceCell,
    state: RwLock<TrustState>,
}

impl TrustManager {
    /// Build from already loaded internal trust material.
    ///
    /// When `settings.namespace` is not the default namespace and the CA can
    /// sign, an extra service certificate covering the namespace hostnames
    /// is issued and served after the primary one.
    ///
    /// # Errors
    ///
    /// Fails if issuing the namespace certificate fails.
    pub fn new(internal: InternalTrust, settings: &TrustSettings) -> Result<Self> {
        let InternalTrust {
            ca,
            secondary_ca_cert,
            service_cert,
        } = internal;

        let mut roots = vec![ca.certificate().clone()];
        roots.extend(secondary_ca_cert);

        let mut service_certs = vec![service_cert];
        if settings.namespace != DEFAULT_NAMESPACE {
            if ca.can_sign() {
                let issued = ca.issue_cert_for_subject(
                    &settings.subject,
                    &IssueOptions::default().with_namespace(&settings.namespace),
                )?;
                info!(
                    namespace = %settings.namespace,
                    subject = %settings.subject,
                    "Issued service certificate for namespace"
                );
                service_certs.push(issued.to_server_certificate()?);
            } else {
                warn!(
                    namespace = %settings.namespace,
                    "CA cannot sign; not issuing a certificate for the namespace hostnames"
                );
            }
        }

        Ok(Self {
            ca,
            internal_roots: Arc::new(SourceCell::new(roots)),
            service_certs: Arc::new(SourceCell::new(service_certs)),
            default_cert: Arc::default(),
            user_client_cas: Arc::default(),
            state: RwLock::new(TrustState {
                registry: ClientCaRegistry::new(),
                default_cert: None,
                holders: Vec::new(),
            }),
        })
    }

    /// Load internal trust material from the configured directories.
    ///
    /// The CA directory must hold `ca.pem`, and optionally `ca-key.pem` and
    /// `ca-secondary.pem`; the service certificate directory must hold
    /// `cert.pem` and `key.pem`.  Both CA certificates must pass
    /// [`CertificateAuthority::check_properties`].
    ///
    /// # Errors
    ///
    /// Any failure here is fatal for the process.
    pub fn load(config: &TrustConfig) -> Result<Self> {
        let ca_map = read_file_map_from_dir(&config.ca_dir)?;
        let ca = if ca_map.contains_key(CA_KEY_FILE_NAME) {
            load_ca_from_file_map(&ca_map)?
        } else {
            let cert = ca_map.get(CA_CERT_FILE_NAME).ok_or_else(|| {
                Error::Config(format!(
                    "no {CA_CERT_FILE_NAME} in CA directory '{}'",
                    config.ca_dir.display()
                ))
            })?;
            CertificateAuthority::load_for_validation(cert)?
        };
        ca.check_properties()?;

        let secondary_ca_cert = match ca_map.get(SECONDARY_CA_CERT_FILE_NAME) {
            Some(pem) => {
                let secondary = CertificateAuthority::load_for_validation(pem)?;
                secondary.check_properties().map_err(|e| {
                    Error::Config(format!(
                        "{SECONDARY_CA_CERT_FILE_NAME} in '{}' is not a usable service CA: {e}",
                        config.ca_dir.display()
                    ))
                })?;
                Some(secondary.certificate().clone())
            }
            None => None,
        };

        let service_map = read_file_map_from_dir(&config.service_cert_dir)?;
        let service_cert = load_service_cert_from_file_map(&service_map, "")?.ok_or_else(|| {
            Error::Config(format!(
                "no service certificate in '{}'",
                config.service_cert_dir.display()
            ))
        })?;

        info!(
            ca = %ca.identity().fingerprint,
            can_sign = ca.can_sign(),
            secondary_ca = secondary_ca_cert.is_some(),
            service = %service_cert.identity().display_name(),
            "Loaded internal trust material"
        );

        Self::new(
            InternalTrust {
                ca,
                secondary_ca_cert,
                service_cert,
            },
            &config.trust_settings(),
        )
    }

    /// The internal service CA.
    #[must_use]
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    /// Internal service certificates currently served.
    #[must_use]
    pub fn service_certificates(&self) -> Arc<Vec<ServerCertificate>> {
        self.service_certs.get()
    }

    /// Current default certificate, if one is installed.
    #[must_use]
    pub fn default_cert(&self) -> Option<ServerCertificate> {
        self.state.read().default_cert.clone()
    }

    /// Register (or re-register) an identity provider's client CAs.
    ///
    /// Providers with an empty id are ignored.
    pub fn register_auth_provider(&self, provider: Arc<dyn AuthProvider>, certs: Vec<CertificateDer<'static>>) {
        if provider.id().is_empty() {
            debug!(provider = %provider.name(), "Ignoring auth provider without id");
            return;
        }
        let mut state = self.state.write();
        let id = provider.id().to_string();
        let count = certs.len();
        state.registry.register(provider, certs);
        self.user_client_cas.replace(state.registry.certificates().to_vec());
        info!(provider = %id, certs = count, "Registered auth provider client CAs");
        push_to_holders(&mut state);
    }

    /// Remove an identity provider's client CAs.  Unknown providers are a
    /// no-op apart from the push.
    pub fn unregister_auth_provider(&self, provider: &dyn AuthProvider) {
        let mut state = self.state.write();
        if state.registry.unregister(provider.id()) {
            info!(provider = %provider.id(), "Unregistered auth provider client CAs");
        }
        self.user_client_cas.replace(state.registry.certificates().to_vec());
        push_to_holders(&mut state);
    }

    /// Provider that registered the client CA with fingerprint `fp`.
    #[must_use]
    pub fn provider_for_fingerprint(&self, fp: &str) -> Option<Arc<dyn AuthProvider>> {
        self.state.read().registry.provider_for_fingerprint(fp)
    }

    /// Provider whose client CA appears in `chain` (leaf first).
    #[must_use]
    pub fn provider_for_chain(&self, chain: &[CertificateDer<'_>]) -> Option<Arc<dyn AuthProvider>> {
        let state = self.state.read();
        chain
            .iter()
            .find_map(|cert| state.registry.provider_for_certificate(cert))
    }

    /// Replace the default certificate and push the change.
    pub fn update_default_cert(&self, cert: Option<ServerCertificate>) {
        let mut state = self.state.write();
        self.default_cert.replace(cert.iter().cloned().collect());
        state.default_cert = cert;
        push_to_holders(&mut state);
    }

    /// Create a TLS holder wired to the requested sources, register it for
    /// future pushes and publish its first snapshot.
    ///
    /// # Errors
    ///
    /// Fails when no server certificate source is requested or the first
    /// snapshot cannot be built.
    pub fn tls_configurer(&self, opts: &TlsConfigurerOptions) -> Result<Arc<TlsConfigHolder>> {
        if opts.server_certs.is_empty() {
            return Err(Error::Config(
                "TLS configurer needs at least one server certificate source".to_string(),
            ));
        }

        let holder = Arc::new(TlsConfigHolder::new(opts.template()));
        for source in &opts.server_certs {
            holder.add_server_cert_source(match source {
                ServerCertSource::DefaultCert => Arc::clone(&self.default_cert),
                ServerCertSource::ServiceCert => Arc::clone(&self.service_certs),
            });
        }
        for source in &opts.client_cas {
            holder.add_client_ca_source(match source {
                ClientCaSource::UserProviders => Arc::clone(&self.user_client_cas),
                ClientCaSource::ServiceCa => Arc::clone(&self.internal_roots),
            });
        }

        let mut state = self.state.write();
        holder.update_tls_config()?;
        state.holders.push(Arc::downgrade(&holder));
        debug!(holders = state.holders.len(), ?opts, "Registered TLS configurer");
        Ok(holder)
    }

    /// Load the default certificate from `dir` now, then keep watching it
    /// until `token` is cancelled.
    pub fn watch_default_cert(
        self: &Arc<Self>,
        dir: impl Into<PathBuf>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let mut watcher = DirectoryWatcher::new(
            dir,
            interval,
            load_default_cert,
            DefaultCertHandler::new(Arc::clone(self)),
        );
        watcher.load_now();
        watcher.spawn(token)
    }
}

impl fmt::Debug for TrustManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("TrustManager")
            .field("ca", &self.ca)
            .field("service_certs", &self.service_certs.len())
            .field("default_cert", &state.default_cert.is_some())
            .field("registry", &state.registry)
            .field("holders", &state.holders.len())
            .finish()
    }
}

/// Republish every live holder, dropping holders that no longer exist.
fn push_to_holders(state: &mut TrustState) {
    state.holders.retain(|weak| match weak.upgrade() {
        Some(holder) => {
            if let Err(e) = holder.update_tls_config() {
                error!(error = %e, "Failed to update TLS config; previous config stays active");
            }
            true
        }
        None => false,
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::identity::fingerprint;
    use crate::mtls::subject::ServiceType;

    #[derive(Debug)]
    struct TestProvider(&'static str);

    impl AuthProvider for TestProvider {
        fn id(&self) -> &str {
            self.0
        }
    }

    fn manager(namespace: &str) -> TrustManager {
        let ca = CertificateAuthority::generate().unwrap();
        let service_cert = ca
            .issue_cert_for_subject(&Subject::central(), &IssueOptions::default())
            .unwrap()
            .to_server_certificate()
            .unwrap();
        TrustManager::new(
            InternalTrust {
                ca,
                secondary_ca_cert: None,
                service_cert,
            },
            &TrustSettings {
                namespace: namespace.to_string(),
                subject: Subject::central(),
            },
        )
        .unwrap()
    }

    fn service_opts() -> TlsConfigurerOptions {
        TlsConfigurerOptions {
            server_certs: vec![ServerCertSource::DefaultCert, ServerCertSource::ServiceCert],
            client_cas: vec![ClientCaSource::UserProviders],
            ..TlsConfigurerOptions::default()
        }
    }

    #[test]
    fn default_namespace_serves_one_service_cert() {
        let m = manager(DEFAULT_NAMESPACE);
        assert_eq!(m.service_certificates().len(), 1);
    }

    #[test]
    fn custom_namespace_adds_namespaced_cert() {
        let m = manager("acme");
        let certs = m.service_certificates();
        assert_eq!(certs.len(), 2);
        assert!(certs[1].matches_hostname("central.acme.svc"));
        assert!(!certs[0].matches_hostname("central.acme.svc"));
    }

    #[test]
    fn validation_only_ca_skips_namespaced_cert() {
        let ca = CertificateAuthority::generate().unwrap();
        let service_cert = ca
            .issue_cert_for_subject(&Subject::central(), &IssueOptions::default())
            .unwrap()
            .to_server_certificate()
            .unwrap();
        let validating = CertificateAuthority::load_for_validation(ca.cert_pem().as_bytes()).unwrap();
        let m = TrustManager::new(
            InternalTrust {
                ca: validating,
                secondary_ca_cert: None,
                service_cert,
            },
            &TrustSettings {
                namespace: "acme".to_string(),
                subject: Subject::central(),
            },
        )
        .unwrap();
        assert_eq!(m.service_certificates().len(), 1);
    }

    #[test]
    fn unknown_source_names_are_rejected() {
        assert!(TlsConfigurerOptions::from_names(&["service-cert"], &["service-ca"], true).is_ok());
        assert!(matches!(
            TlsConfigurerOptions::from_names(&["client-cert"], &[], false),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            TlsConfigurerOptions::from_names(&["service-cert"], &["anyone"], false),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn configurer_without_server_sources_is_rejected() {
        let m = manager(DEFAULT_NAMESPACE);
        assert!(matches!(
            m.tls_configurer(&TlsConfigurerOptions::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn configurer_is_published_immediately() {
        let m = manager(DEFAULT_NAMESPACE);
        let holder = m.tls_configurer(&service_opts()).unwrap();
        let snapshot = holder.current_snapshot().unwrap();
        assert_eq!(snapshot.certificates().len(), 1);
        assert_eq!(snapshot.client_auth(), ClientAuthMode::NoClientCert);
    }

    #[test]
    fn service_ca_source_enables_client_verification() {
        let m = manager(DEFAULT_NAMESPACE);
        let holder = m
            .tls_configurer(&TlsConfigurerOptions {
                server_certs: vec![ServerCertSource::ServiceCert],
                client_cas: vec![ClientCaSource::ServiceCa],
                require_client_cert: true,
                ..TlsConfigurerOptions::default()
            })
            .unwrap();
        let snapshot = holder.current_snapshot().unwrap();
        assert_eq!(snapshot.client_auth(), ClientAuthMode::RequireAndVerifyClientCert);
        assert_eq!(snapshot.client_ca_count(), 1);
    }

    #[test]
    fn provider_registration_is_pushed_to_holders() {
        // GIVEN: a holder trusting user providers only
        let m = manager(DEFAULT_NAMESPACE);
        let holder = m.tls_configurer(&service_opts()).unwrap();
        let user_ca = CertificateAuthority::generate().unwrap();

        // WHEN: a provider registers a CA
        m.register_auth_provider(Arc::new(TestProvider("p1")), vec![user_ca.certificate().clone()]);

        // THEN: the holder verifies client certs and the CA maps back
        let snapshot = holder.current_snapshot().unwrap();
        assert_eq!(snapshot.client_ca_count(), 1);
        assert_eq!(snapshot.client_auth(), ClientAuthMode::VerifyClientCertIfGiven);
        let fp = fingerprint(user_ca.certificate());
        assert_eq!(m.provider_for_fingerprint(&fp).unwrap().id(), "p1");

        // WHEN: it unregisters
        m.unregister_auth_provider(&TestProvider("p1"));

        // THEN: back to the fallback mode
        let snapshot = holder.current_snapshot().unwrap();
        assert_eq!(snapshot.client_ca_count(), 0);
        assert!(m.provider_for_fingerprint(&fp).is_none());
    }

    #[test]
    fn provider_without_id_is_ignored() {
        let m = manager(DEFAULT_NAMESPACE);
        let holder = m.tls_configurer(&service_opts()).unwrap();
        let user_ca = CertificateAuthority::generate().unwrap();
        m.register_auth_provider(Arc::new(TestProvider("")), vec![user_ca.certificate().clone()]);
        assert_eq!(holder.current_snapshot().unwrap().client_ca_count(), 0);
    }

    #[test]
    fn provider_for_chain_finds_issuing_ca() {
        let m = manager(DEFAULT_NAMESPACE);
        let user_ca = CertificateAuthority::generate().unwrap();
        m.register_auth_provider(Arc::new(TestProvider("p1")), vec![user_ca.certificate().clone()]);
        let leaf = user_ca
            .issue_cert_for_subject(&Subject::new(ServiceType::RemoteService, "user"), &IssueOptions::default())
            .unwrap();
        let chain = vec![leaf.cert_der.clone(), user_ca.certificate().clone()];
        assert_eq!(m.provider_for_chain(&chain).unwrap().id(), "p1");
        assert!(m.provider_for_chain(&leaf.chain()).is_none());
    }

    #[test]
    fn default_cert_is_preferred_when_installed() {
        // GIVEN: a holder preferring the default cert over service certs
        let m = manager(DEFAULT_NAMESPACE);
        let holder = m.tls_configurer(&service_opts()).unwrap();
        let operator_ca = CertificateAuthority::generate().unwrap();
        let operator_cert = operator_ca
            .issue_cert_for_subject(&Subject::scanner(), &IssueOptions::default())
            .unwrap()
            .to_server_certificate()
            .unwrap();

        // WHEN: the default cert is installed
        m.update_default_cert(Some(operator_cert));

        // THEN: it is served first
        let picked = holder.select_certificate(None).unwrap();
        assert_eq!(picked.identity().common_name.as_deref(), Some("SCANNER_SERVICE: Scanner"));
        assert!(m.default_cert().is_some());

        // WHEN: it is removed
        m.update_default_cert(None);

        // THEN: the service certificate is served again
        let picked = holder.select_certificate(None).unwrap();
        assert_eq!(picked.identity().common_name.as_deref(), Some("CENTRAL_SERVICE: Central"));
    }

    #[test]
    fn dropped_holders_are_forgotten() {
        let m = manager(DEFAULT_NAMESPACE);
        let holder = m.tls_configurer(&service_opts()).unwrap();
        drop(holder);
        m.update_default_cert(None);
        assert!(m.state.read().holders.is_empty());
    }
}
