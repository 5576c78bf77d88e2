//! Operator-supplied default certificate.
//!
//! The default certificate lives in a mounted directory as `tls.crt` (chain,
//! leaf first) and `tls.key`.  No directory, or neither file, means the
//! feature is not configured.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::certwatch::CertHandler;
use crate::mtls::cert_manager::{ServerCertificate, verify_self_trust};
use crate::trust::manager::TrustManager;
use crate::{Error, Result};

/// Certificate chain file name.
pub const DEFAULT_CERT_FILE_NAME: &str = "tls.crt";
/// Private key file name.
pub const DEFAULT_KEY_FILE_NAME: &str = "tls.key";

/// Load the default certificate from `dir`.
///
/// # Errors
///
/// Fails when only one of the two files exists or the pair is invalid.
pub fn load_default_cert(dir: &Path) -> Result<Option<ServerCertificate>> {
    let cert_path = dir.join(DEFAULT_CERT_FILE_NAME);
    let key_path = dir.join(DEFAULT_KEY_FILE_NAME);
    match (cert_path.try_exists()?, key_path.try_exists()?) {
        (false, false) => Ok(None),
        (true, true) => ServerCertificate::load(&cert_path, &key_path).map(Some),
        _ => Err(Error::Config(format!(
            "default certificate in '{}' requires both {DEFAULT_CERT_FILE_NAME} and {DEFAULT_KEY_FILE_NAME}",
            dir.display()
        ))),
    }
}

/// Installs watched default certificates into the trust manager.
#[derive(Debug)]
pub struct DefaultCertHandler {
    manager: Arc<TrustManager>,
}

impl DefaultCertHandler {
    /// Handler feeding `manager`.
    #[must_use]
    pub fn new(manager: Arc<TrustManager>) -> Self {
        Self { manager }
    }
}

impl CertHandler<ServerCertificate> for DefaultCertHandler {
    fn on_stable_update(&self, result: Result<Option<ServerCertificate>>) {
        match result {
            Err(e) => {
                error!(error = %e, "Failed to load default certificate, serving without it");
                self.manager.update_default_cert(None);
            }
            Ok(None) => {
                info!("No default certificate configured");
                self.manager.update_default_cert(None);
            }
            Ok(Some(cert)) => {
                if let Err(e) = verify_self_trust(&cert) {
                    warn!(
                        cert = %cert.identity().display_name(),
                        error = %e,
                        "Default certificate chain is not self-contained; clients may fail to verify it"
                    );
                }
                info!(
                    cert = %cert.identity().display_name(),
                    fingerprint = %cert.identity().fingerprint,
                    "Installing default certificate"
                );
                self.manager.update_default_cert(Some(cert));
            }
        }
    }

    fn on_watch_error(&self, err: Error) {
        warn!(error = %err, "Error watching default certificate directory");
    }
}
