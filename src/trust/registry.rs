//! Client CA registry: which identity provider owns which CA certificate.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::mtls::identity::fingerprint;

/// An identity provider whose users authenticate with client certificates.
///
/// The trust subsystem only needs a stable identifier; everything else about
/// the provider belongs to the caller.
pub trait AuthProvider: Send + Sync + fmt::Debug {
    /// Stable identifier.  An empty id marks a provider that is not yet
    /// persisted and is never registered.
    fn id(&self) -> &str;

    /// Display name used in logs.
    fn name(&self) -> &str {
        self.id()
    }
}

struct Registration {
    provider: Arc<dyn AuthProvider>,
    certs: Vec<CertificateDer<'static>>,
}

/// Provider map plus the derived fingerprint index and flattened CA list.
///
/// The index is rebuilt from scratch after every change, so it is always
/// exactly the set of certificates currently registered.
#[derive(Default)]
pub struct ClientCaRegistry {
    providers: BTreeMap<String, Registration>,
    by_fingerprint: HashMap<String, Arc<dyn AuthProvider>>,
    certs: Vec<CertificateDer<'static>>,
}

impl ClientCaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `provider` with `certs`, replacing an earlier registration
    /// under the same id.  Returns `false` (and does nothing) for an empty id.
    pub fn register(&mut self, provider: Arc<dyn AuthProvider>, certs: Vec<CertificateDer<'static>>) -> bool {
        if provider.id().is_empty() {
            return false;
        }
        self.providers
            .insert(provider.id().to_string(), Registration { provider, certs });
        self.reindex();
        true
    }

    /// Remove the registration for `id`.  Returns whether one existed.
    pub fn unregister(&mut self, id: &str) -> bool {
        let removed = self.providers.remove(id).is_some();
        if removed {
            self.reindex();
        }
        removed
    }

    /// Provider that registered the certificate with SHA-256 `fp`.
    #[must_use]
    pub fn provider_for_fingerprint(&self, fp: &str) -> Option<Arc<dyn AuthProvider>> {
        self.by_fingerprint.get(fp).cloned()
    }

    /// Provider that registered `cert`.
    #[must_use]
    pub fn provider_for_certificate(&self, cert: &CertificateDer<'_>) -> Option<Arc<dyn AuthProvider>> {
        self.provider_for_fingerprint(&fingerprint(cert))
    }

    /// Every registered certificate, grouped by provider id.
    #[must_use]
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// `true` when no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn reindex(&mut self) {
        self.by_fingerprint.clear();
        self.certs.clear();
        for (id, registration) in &self.providers {
            for cert in &registration.certs {
                let fp = fingerprint(cert);
                if let Some(previous) = self
                    .by_fingerprint
                    .insert(fp.clone(), Arc::clone(&registration.provider))
                {
                    debug!(
                        fingerprint = %fp,
                        previous = %previous.id(),
                        provider = %id,
                        "Client CA registered by more than one provider"
                    );
                }
                self.certs.push(cert.clone());
            }
        }
    }
}

impl fmt::Debug for ClientCaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCaRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("fingerprints", &self.by_fingerprint.len())
            .finish()
    }
}
