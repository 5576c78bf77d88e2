//! Configuration management

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::certwatch::DEFAULT_WATCH_INTERVAL;
use crate::mtls::subject::{ServiceType, Subject};
use crate::tlsconfig::ClientAuthMode;
use crate::trust::{ClientCaSource, ServerCertSource, TlsConfigurerOptions, TrustSettings};
use crate::{DEFAULT_NAMESPACE, Error, Result};

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Namespace the service is deployed into
    pub namespace: String,
    /// Service type of this process
    pub service_type: ServiceType,
    /// Service identifier of this process
    pub identifier: String,
    /// Directory holding `ca.pem` (and optionally `ca-key.pem`)
    pub ca_dir: PathBuf,
    /// Directory holding this service's `cert.pem` / `key.pem`
    pub service_cert_dir: PathBuf,
    /// Watched directory for the operator's `tls.crt` / `tls.key`
    pub default_cert_dir: Option<PathBuf>,
    /// Polling interval for watched directories
    #[serde(with = "humantime_serde")]
    pub watch_interval: Duration,
    /// TLS listeners
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            service_type: ServiceType::CentralService,
            identifier: "Central".to_string(),
            ca_dir: PathBuf::from("/run/secrets/stackrox.io/certs"),
            service_cert_dir: PathBuf::from("/run/secrets/stackrox.io/certs"),
            default_cert_dir: Some(PathBuf::from("/run/secrets/stackrox.io/default-tls-cert")),
            watch_interval: DEFAULT_WATCH_INTERVAL,
            endpoints: Vec::new(),
        }
    }
}

/// One TLS listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name used in logs
    pub name: String,
    /// Listen address (`host:port`)
    pub listen: String,
    /// Server certificate sources, most preferred first
    #[serde(default = "default_server_certs")]
    pub server_certs: Vec<ServerCertSource>,
    /// Client CA sources
    #[serde(default)]
    pub client_cas: Vec<ClientCaSource>,
    /// Reject clients without a verified certificate
    #[serde(default)]
    pub require_client_cert: bool,
    /// Client authentication while no client CA is available
    #[serde(default)]
    pub fallback_client_auth: ClientAuthMode,
}

fn default_server_certs() -> Vec<ServerCertSource> {
    vec![ServerCertSource::DefaultCert, ServerCertSource::ServiceCert]
}

impl EndpointConfig {
    /// Parsed listen address
    ///
    /// # Errors
    ///
    /// Returns an error if `listen` is not a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen.parse().map_err(|e| {
            Error::Config(format!(
                "endpoint '{}': invalid listen address '{}': {e}",
                self.name, self.listen
            ))
        })
    }

    /// Trust manager options for this endpoint
    #[must_use]
    pub fn configurer_options(&self) -> TlsConfigurerOptions {
        TlsConfigurerOptions {
            server_certs: self.server_certs.clone(),
            client_cas: self.client_cas.clone(),
            require_client_cert: self.require_client_cert,
            fallback_client_auth: self.fallback_client_auth,
        }
    }
}

impl TrustConfig {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MTLS_TRUST_ prefix)
        figment = figment.merge(Env::prefixed("MTLS_TRUST_").split("__"));

        Self::from_figment(&figment)
    }

    /// Extract and validate configuration from an assembled figment
    ///
    /// # Errors
    ///
    /// Returns an error on unknown source names, malformed values, or
    /// validation failures.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        self.subject()
            .validate()
            .map_err(|e| Error::Config(format!("service identity: {e}")))?;
        if self.watch_interval.is_zero() {
            return Err(Error::Config("watch_interval must be positive".to_string()));
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
            if endpoint.server_certs.is_empty() {
                return Err(Error::Config(format!(
                    "endpoint '{}' has no server certificate sources",
                    endpoint.name
                )));
            }
            endpoint.listen_addr()?;
        }
        Ok(())
    }

    /// Subject of this service
    #[must_use]
    pub fn subject(&self) -> Subject {
        Subject::new(self.service_type, self.identifier.clone())
    }

    /// Settings for [`crate::trust::TrustManager::new`]
    #[must_use]
    pub fn trust_settings(&self) -> TrustSettings {
        TrustSettings {
            namespace: self.namespace.clone(),
            subject: self.subject(),
        }
    }
}
