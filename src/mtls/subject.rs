//! Service subjects and identity naming.
//!
//! A [`Subject`] names the service a certificate is issued to.  Everything
//! else about the certificate identity (common name, organizational unit,
//! DNS names) is derived from it by pure functions in this module so that
//! issuance and validation always agree on the naming scheme.
//!
//! | Derived field | Value |
//! |---------------|-------|
//! | common name | `"<SERVICE_TYPE>: <identifier>"` |
//! | organizational unit | `"<SERVICE_TYPE>"` |
//! | hostname | `"<slug>.stackrox"` |
//! | SANs | `<slug>.stackrox`, `<slug>.stackrox.svc`, plus `<slug>.<ns>` / `<slug>.<ns>.svc` |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{DEFAULT_NAMESPACE, Error, Result};

const SERVICE_SUFFIX: &str = "_SERVICE";
const COMMON_NAME_SEPARATOR: &str = ": ";

// ─────────────────────────────────────────────────────────────────────────────
// Service type
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of platform service a certificate identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// Placeholder for unset values; never valid in a subject.
    UnknownService,
    /// Secured-cluster sensor.
    SensorService,
    /// Central server.
    CentralService,
    /// Central database.
    CentralDbService,
    /// Remote (non-cluster) client.
    RemoteService,
    /// Node collector.
    CollectorService,
    /// Monitoring UI.
    MonitoringUiService,
    /// Monitoring database.
    MonitoringDbService,
    /// Monitoring client.
    MonitoringClientService,
    /// Benchmark runner.
    BenchmarkService,
    /// Image scanner.
    ScannerService,
    /// Image scanner database.
    ScannerDbService,
    /// Admission controller.
    AdmissionControlService,
    /// Scanner v4 indexer.
    ScannerV4IndexerService,
    /// Scanner v4 matcher.
    ScannerV4MatcherService,
    /// Scanner v4 database.
    ScannerV4DbService,
    /// Scanner v4 (combined).
    ScannerV4Service,
    /// Cluster registrant.
    RegistrantService,
    /// Config controller.
    ConfigControllerService,
}

impl ServiceType {
    /// Every service type, in declaration order.
    pub const ALL: [Self; 19] = [
        Self::UnknownService,
        Self::SensorService,
        Self::CentralService,
        Self::CentralDbService,
        Self::RemoteService,
        Self::CollectorService,
        Self::MonitoringUiService,
        Self::MonitoringDbService,
        Self::MonitoringClientService,
        Self::BenchmarkService,
        Self::ScannerService,
        Self::ScannerDbService,
        Self::AdmissionControlService,
        Self::ScannerV4IndexerService,
        Self::ScannerV4MatcherService,
        Self::ScannerV4DbService,
        Self::ScannerV4Service,
        Self::RegistrantService,
        Self::ConfigControllerService,
    ];

    /// Canonical upper-case name, e.g. `"CENTRAL_DB_SERVICE"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownService => "UNKNOWN_SERVICE",
            Self::SensorService => "SENSOR_SERVICE",
            Self::CentralService => "CENTRAL_SERVICE",
            Self::CentralDbService => "CENTRAL_DB_SERVICE",
            Self::RemoteService => "REMOTE_SERVICE",
            Self::CollectorService => "COLLECTOR_SERVICE",
            Self::MonitoringUiService => "MONITORING_UI_SERVICE",
            Self::MonitoringDbService => "MONITORING_DB_SERVICE",
            Self::MonitoringClientService => "MONITORING_CLIENT_SERVICE",
            Self::BenchmarkService => "BENCHMARK_SERVICE",
            Self::ScannerService => "SCANNER_SERVICE",
            Self::ScannerDbService => "SCANNER_DB_SERVICE",
            Self::AdmissionControlService => "ADMISSION_CONTROL_SERVICE",
            Self::ScannerV4IndexerService => "SCANNER_V4_INDEXER_SERVICE",
            Self::ScannerV4MatcherService => "SCANNER_V4_MATCHER_SERVICE",
            Self::ScannerV4DbService => "SCANNER_V4_DB_SERVICE",
            Self::ScannerV4Service => "SCANNER_V4_SERVICE",
            Self::RegistrantService => "REGISTRANT_SERVICE",
            Self::ConfigControllerService => "CONFIG_CONTROLLER_SERVICE",
        }
    }

    /// Kebab-case slug used in hostnames and file-map prefixes,
    /// e.g. `SCANNER_DB_SERVICE` → `"scanner-db"`.
    #[must_use]
    pub fn slug(self) -> String {
        let name = self.as_str();
        name.strip_suffix(SERVICE_SUFFIX)
            .unwrap_or(name)
            .to_ascii_lowercase()
            .replace('_', "-")
    }

    /// Returns `false` only for [`ServiceType::UnknownService`].
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::UnknownService)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown service type '{s}'")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subject
// ─────────────────────────────────────────────────────────────────────────────

/// Logical identity a certificate is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    /// Service kind.
    pub service_type: ServiceType,
    /// Human identifier (e.g. `"Central"`, or a cluster id for sensors).
    pub identifier: String,
}

impl Subject {
    /// Create a subject.  No validation happens here; see [`Subject::validate`].
    pub fn new(service_type: ServiceType, identifier: impl Into<String>) -> Self {
        Self {
            service_type,
            identifier: identifier.into(),
        }
    }

    /// Subject of the central server.
    #[must_use]
    pub fn central() -> Self {
        Self::new(ServiceType::CentralService, "Central")
    }

    /// Subject of the central database.
    #[must_use]
    pub fn central_db() -> Self {
        Self::new(ServiceType::CentralDbService, "Central DB")
    }

    /// Subject of the image scanner.
    #[must_use]
    pub fn scanner() -> Self {
        Self::new(ServiceType::ScannerService, "Scanner")
    }

    /// Subject of the image scanner database.
    #[must_use]
    pub fn scanner_db() -> Self {
        Self::new(ServiceType::ScannerDbService, "Scanner DB")
    }

    /// Check the subject can be issued a certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the service type is unknown or the
    /// identifier is empty.
    pub fn validate(&self) -> Result<()> {
        if !self.service_type.is_known() {
            return Err(Error::Validation(
                "subject service type must not be UNKNOWN_SERVICE".to_string(),
            ));
        }
        if self.identifier.trim().is_empty() {
            return Err(Error::Validation(format!(
                "subject identifier for {} must not be empty",
                self.service_type
            )));
        }
        Ok(())
    }

    /// Certificate common name, `"<SERVICE_TYPE>: <identifier>"`.
    #[must_use]
    pub fn common_name(&self) -> String {
        format!(
            "{}{COMMON_NAME_SEPARATOR}{}",
            self.service_type, self.identifier
        )
    }

    /// Certificate organizational unit.
    #[must_use]
    pub fn organizational_unit(&self) -> &'static str {
        self.service_type.as_str()
    }

    /// Primary hostname in the default namespace, e.g. `"central.stackrox"`.
    #[must_use]
    pub fn hostname(&self) -> String {
        format!("{}.{DEFAULT_NAMESPACE}", self.service_type.slug())
    }

    /// All DNS names a certificate for this subject must cover.
    ///
    /// The default-namespace names always come first; namespace-qualified
    /// names are appended when `namespace` is set and is not the default.
    #[must_use]
    pub fn all_hostnames(&self, namespace: Option<&str>) -> Vec<String> {
        let slug = self.service_type.slug();
        let mut names = namespace_hostnames(&slug, DEFAULT_NAMESPACE);
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty() && *ns != DEFAULT_NAMESPACE) {
            names.extend(namespace_hostnames(&slug, ns));
        }
        names
    }

    /// Parse a common name produced by [`Subject::common_name`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the name is not of the form
    /// `"<SERVICE_TYPE>: <identifier>"` or names an invalid subject.
    pub fn from_common_name(cn: &str) -> Result<Self> {
        let (service_type, identifier) = cn.split_once(COMMON_NAME_SEPARATOR).ok_or_else(|| {
            Error::Validation(format!("common name '{cn}' is not a service subject"))
        })?;
        let subject = Self::new(service_type.parse()?, identifier);
        subject.validate()?;
        Ok(subject)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.common_name())
    }
}

fn namespace_hostnames(slug: &str, namespace: &str) -> Vec<String> {
    vec![
        format!("{slug}.{namespace}"),
        format!("{slug}.{namespace}.svc"),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
