//! Hot-swappable TLS server configuration.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, warn};

use crate::mtls::cert_manager::ServerCertificate;
use crate::mtls::crypto_provider;
use crate::tlsconfig::resolver::{
    EmptyPoolVerifier, LiveCertResolver, LiveClientVerifier, SnapshotCertResolver, select_certificate,
};
use crate::tlsconfig::source::SourceCell;
use crate::{Error, Result};

/// Source of server certificates.
pub type ServerCertSourceCell = Arc<SourceCell<ServerCertificate>>;

/// Source of trusted client CA certificates.
pub type ClientCaSourceCell = Arc<SourceCell<CertificateDer<'static>>>;

// ─────────────────────────────────────────────────────────────────────────────
// Template
// ─────────────────────────────────────────────────────────────────────────────

/// How a listener treats client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientAuthMode {
    /// Never ask for a client certificate.
    #[default]
    NoClientCert,
    /// Ask, verify when presented, accept anonymous clients.
    VerifyClientCertIfGiven,
    /// Ask and require a verified client certificate.
    RequireAndVerifyClientCert,
}

/// Fixed options of a holder; everything else comes from its sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsTemplate {
    /// ALPN protocols offered, in preference order.
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Client authentication while at least one client CA is configured.
    pub client_auth: ClientAuthMode,
    /// Client authentication while the client CA pool is empty.
    pub fallback_client_auth: ClientAuthMode,
}

impl Default for TlsTemplate {
    fn default() -> Self {
        Self {
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            client_auth: ClientAuthMode::VerifyClientCertIfGiven,
            fallback_client_auth: ClientAuthMode::NoClientCert,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// One complete, immutable TLS configuration.
pub struct TlsSnapshot {
    certs: Vec<ServerCertificate>,
    client_ca_count: usize,
    client_auth: ClientAuthMode,
    verifier: Arc<dyn ClientCertVerifier>,
    config: Arc<ServerConfig>,
}

impl TlsSnapshot {
    /// Server certificates in preference order.
    #[must_use]
    pub fn certificates(&self) -> &[ServerCertificate] {
        &self.certs
    }

    /// Number of client CA certificates in the pool.
    #[must_use]
    pub fn client_ca_count(&self) -> usize {
        self.client_ca_count
    }

    /// Effective client authentication mode.
    #[must_use]
    pub fn client_auth(&self) -> ClientAuthMode {
        self.client_auth
    }

    /// The snapshot as a self-contained server config.
    #[must_use]
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    pub(crate) fn verifier(&self) -> Arc<dyn ClientCertVerifier> {
        Arc::clone(&self.verifier)
    }
}

impl fmt::Debug for TlsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSnapshot")
            .field("certs", &self.certs)
            .field("client_ca_count", &self.client_ca_count)
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Holder
// ─────────────────────────────────────────────────────────────────────────────

/// Builds TLS snapshots from its sources and publishes them atomically.
///
/// Handshakes only ever read the published snapshot; they never look at the
/// sources or at whatever lock the caller of [`Self::update_tls_config`]
/// holds.
pub struct TlsConfigHolder {
    template: TlsTemplate,
    server_cert_sources: RwLock<Vec<ServerCertSourceCell>>,
    client_ca_sources: RwLock<Vec<ClientCaSourceCell>>,
    live: RwLock<Option<Arc<TlsSnapshot>>>,
    update_lock: Mutex<()>,
}

impl TlsConfigHolder {
    /// Create a holder with no sources and no published snapshot.
    #[must_use]
    pub fn new(template: TlsTemplate) -> Self {
        Self {
            template,
            server_cert_sources: RwLock::new(Vec::new()),
            client_ca_sources: RwLock::new(Vec::new()),
            live: RwLock::new(None),
            update_lock: Mutex::new(()),
        }
    }

    /// Template this holder was built with.
    #[must_use]
    pub fn template(&self) -> &TlsTemplate {
        &self.template
    }

    /// Append a server certificate source; earlier sources are preferred.
    pub fn add_server_cert_source(&self, source: ServerCertSourceCell) {
        self.server_cert_sources.write().push(source);
    }

    /// Append a client CA source.
    pub fn add_client_ca_source(&self, source: ClientCaSourceCell) {
        self.client_ca_sources.write().push(source);
    }

    /// Rebuild the snapshot from the current contents of every source and
    /// publish it.
    ///
    /// Concurrent calls are serialised.  The trust manager calls this while
    /// holding its own write lock, so this method must never call back into
    /// the trust manager, and it does nothing slower than building a
    /// `ServerConfig`.
    ///
    /// # Errors
    ///
    /// Fails if the client verifier or server config cannot be built; the
    /// previous snapshot stays published.
    pub fn update_tls_config(&self) -> Result<()> {
        let _serialised = self.update_lock.lock();

        let certs: Vec<ServerCertificate> = self
            .server_cert_sources
            .read()
            .iter()
            .flat_map(|source| source.get().iter().cloned().collect::<Vec<_>>())
            .collect();

        let mut roots = RootCertStore::empty();
        for source in self.client_ca_sources.read().iter() {
            for ca in source.get().iter() {
                if let Err(e) = roots.add(ca.clone()) {
                    warn!(error = %e, "Skipping unusable client CA certificate");
                }
            }
        }

        let client_auth = if roots.is_empty() {
            self.template.fallback_client_auth
        } else {
            self.template.client_auth
        };
        let client_ca_count = roots.len();
        let verifier = build_client_verifier(roots, client_auth)?;

        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::clone(&verifier))
            .with_cert_resolver(Arc::new(SnapshotCertResolver {
                certs: certs.clone(),
            }));
        config.alpn_protocols.clone_from(&self.template.alpn_protocols);

        debug!(
            certs = certs.len(),
            client_cas = client_ca_count,
            client_auth = ?client_auth,
            "Publishing TLS config"
        );
        *self.live.write() = Some(Arc::new(TlsSnapshot {
            certs,
            client_ca_count,
            client_auth,
            verifier,
            config: Arc::new(config),
        }));
        Ok(())
    }

    /// The currently published snapshot, if any.
    #[must_use]
    pub fn current_snapshot(&self) -> Option<Arc<TlsSnapshot>> {
        self.live.read().clone()
    }

    /// A listener config whose certificate selection and client verification
    /// consult the live snapshot on every handshake.
    ///
    /// # Errors
    ///
    /// Fails only if rustls rejects the protocol version selection.
    pub fn tls_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>> {
        let provider = crypto_provider();
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(LiveClientVerifier {
                holder: Arc::clone(self),
                provider,
            }))
            .with_cert_resolver(Arc::new(LiveCertResolver {
                holder: Arc::clone(self),
            }));
        config.alpn_protocols.clone_from(&self.template.alpn_protocols);
        Ok(Arc::new(config))
    }

    /// The live snapshot as a complete server config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoTlsConfig`] before the first update.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        self.current_snapshot()
            .map(|s| s.server_config())
            .ok_or(Error::NoTlsConfig)
    }

    /// Certificate to serve for `server_name` from the live snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoTlsConfig`] before the first update and
    /// [`Error::NoCertificate`] when the snapshot has no certificates.
    pub fn select_certificate(&self, server_name: Option<&str>) -> Result<ServerCertificate> {
        let snapshot = self.current_snapshot().ok_or(Error::NoTlsConfig)?;
        select_certificate(&snapshot.certs, server_name)
            .cloned()
            .ok_or(Error::NoCertificate)
    }

    /// Complete a server handshake on `stream` with the snapshot that is
    /// live when its ClientHello arrives.
    ///
    /// # Errors
    ///
    /// Fails on IO errors, before the first update, or when the handshake
    /// fails.
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
        let config = self.server_config()?;
        Ok(start.into_stream(config).await?)
    }
}

impl fmt::Debug for TlsConfigHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfigHolder")
            .field("template", &self.template)
            .field("server_cert_sources", &self.server_cert_sources.read().len())
            .field("client_ca_sources", &self.client_ca_sources.read().len())
            .field("published", &self.live.read().is_some())
            .finish()
    }
}

fn build_client_verifier(
    roots: RootCertStore,
    mode: ClientAuthMode,
) -> Result<Arc<dyn ClientCertVerifier>> {
    if mode == ClientAuthMode::NoClientCert {
        return Ok(WebPkiClientVerifier::no_client_auth());
    }
    let mandatory = mode == ClientAuthMode::RequireAndVerifyClientCert;
    if roots.is_empty() {
        return Ok(Arc::new(EmptyPoolVerifier {
            mandatory,
            provider: crypto_provider(),
        }));
    }

    let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), crypto_provider());
    let builder = if mandatory {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    builder
        .build()
        .map_err(|e| Error::Certificate(format!("Failed to build client verifier: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
