//! Trust manager wiring: directory loading, default-cert watching and
//! provider registration pushed into live holders.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use mtls_trust::config::TrustConfig;
use mtls_trust::mtls::file_map::{
    FileMap, SECONDARY_CA_CERT_FILE_NAME, add_ca_cert_to_file_map, add_ca_to_file_map,
    issue_service_cert, write_file_map_to_dir,
};
use mtls_trust::mtls::{CertificateAuthority, IssueOptions, ServiceType, Subject, fingerprint};
use mtls_trust::tlsconfig::ClientAuthMode;
use mtls_trust::trust::{
    AuthProvider, ClientCaSource, ServerCertSource, TlsConfigurerOptions, TrustManager,
};
use mtls_trust::trust::default_cert::{DEFAULT_CERT_FILE_NAME, DEFAULT_KEY_FILE_NAME};

#[derive(Debug)]
struct Provider(&'static str);

impl AuthProvider for Provider {
    fn id(&self) -> &str {
        self.0
    }
}

struct Deployment {
    _root: tempfile::TempDir,
    config: TrustConfig,
    ca: CertificateAuthority,
}

/// Lay out a CA directory and a service certificate directory.
fn deployment(namespace: &str, with_ca_key: bool) -> Deployment {
    let root = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::generate().unwrap();

    let mut ca_map = FileMap::new();
    if with_ca_key {
        add_ca_to_file_map(&mut ca_map, &ca);
    } else {
        add_ca_cert_to_file_map(&mut ca_map, &ca);
    }
    write_file_map_to_dir(&ca_map, &root.path().join("ca")).unwrap();

    let mut service_map = FileMap::new();
    issue_service_cert(&mut service_map, &ca, &Subject::central(), "", &IssueOptions::default()).unwrap();
    write_file_map_to_dir(&service_map, &root.path().join("service")).unwrap();

    let config = TrustConfig {
        namespace: namespace.to_string(),
        ca_dir: root.path().join("ca"),
        service_cert_dir: root.path().join("service"),
        default_cert_dir: Some(root.path().join("default")),
        watch_interval: Duration::from_millis(20),
        ..TrustConfig::default()
    };
    Deployment {
        _root: root,
        config,
        ca,
    }
}

fn write_default_cert(dir: &Path, subject: &Subject) {
    let operator_ca = CertificateAuthority::generate().unwrap();
    let issued = operator_ca
        .issue_cert_for_subject(subject, &IssueOptions::default())
        .unwrap();
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(DEFAULT_CERT_FILE_NAME), format!("{}{}", issued.cert_pem, operator_ca.cert_pem())).unwrap();
    fs::write(dir.join(DEFAULT_KEY_FILE_NAME), issued.key_pem).unwrap();
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn served_cn(holder: &mtls_trust::tlsconfig::TlsConfigHolder) -> Option<String> {
    holder
        .select_certificate(None)
        .ok()
        .and_then(|c| c.identity().common_name.clone())
}

#[test]
fn load_reads_ca_and_service_cert_directories() {
    let d = deployment("stackrox", true);
    let manager = assert_ok!(TrustManager::load(&d.config));
    assert!(manager.ca().can_sign());
    assert_eq!(manager.ca().certificate(), d.ca.certificate());
    assert_eq!(manager.service_certificates().len(), 1);
}

#[test]
fn load_with_validation_only_ca_in_custom_namespace() {
    let d = deployment("acme", false);
    let manager = assert_ok!(TrustManager::load(&d.config));
    assert!(!manager.ca().can_sign());
    // No key, so no extra namespace certificate.
    assert_eq!(manager.service_certificates().len(), 1);
}

#[test]
fn load_with_signing_ca_in_custom_namespace_adds_cert() {
    let d = deployment("acme", true);
    let manager = TrustManager::load(&d.config).unwrap();
    let certs = manager.service_certificates();
    assert_eq!(certs.len(), 2);
    assert!(certs[1].matches_hostname("central.acme"));
}

#[test]
fn load_fails_without_ca() {
    let d = deployment("stackrox", true);
    fs::remove_dir_all(&d.config.ca_dir).unwrap();
    assert!(TrustManager::load(&d.config).is_err());
}

#[test]
fn load_fails_without_service_cert() {
    let d = deployment("stackrox", true);
    fs::remove_dir_all(&d.config.service_cert_dir).unwrap();
    assert!(TrustManager::load(&d.config).is_err());
}

#[test]
fn secondary_ca_is_trusted_for_client_verification() {
    // GIVEN: a CA directory that also carries a secondary CA certificate
    let d = deployment("stackrox", true);
    let secondary = CertificateAuthority::generate().unwrap();
    fs::write(d.config.ca_dir.join(SECONDARY_CA_CERT_FILE_NAME), secondary.cert_pem()).unwrap();

    // WHEN: a holder trusts the service CA roots
    let manager = assert_ok!(TrustManager::load(&d.config));
    let holder = manager
        .tls_configurer(&TlsConfigurerOptions {
            server_certs: vec![ServerCertSource::ServiceCert],
            client_cas: vec![ClientCaSource::ServiceCa],
            ..TlsConfigurerOptions::default()
        })
        .unwrap();

    // THEN: both CAs are in its client CA pool
    assert_eq!(holder.current_snapshot().unwrap().client_ca_count(), 2);
}

#[test]
fn secondary_ca_that_is_not_a_ca_is_rejected() {
    // GIVEN: a leaf certificate placed where the secondary CA belongs
    let d = deployment("stackrox", true);
    let leaf = d
        .ca
        .issue_cert_for_subject(&Subject::scanner(), &IssueOptions::default())
        .unwrap();
    fs::write(d.config.ca_dir.join(SECONDARY_CA_CERT_FILE_NAME), &leaf.cert_pem).unwrap();

    // WHEN / THEN: loading fails instead of trusting the leaf as a root
    let err = TrustManager::load(&d.config).unwrap_err();
    assert!(err.to_string().contains(SECONDARY_CA_CERT_FILE_NAME), "{err}");
}

#[tokio::test]
async fn default_cert_rotation_reaches_existing_holders() {
    // GIVEN: a manager watching an empty default-cert directory
    let d = deployment("stackrox", true);
    let default_dir = d.config.default_cert_dir.clone().unwrap();
    let manager = Arc::new(TrustManager::load(&d.config).unwrap());
    let holder = manager
        .tls_configurer(&TlsConfigurerOptions {
            server_certs: vec![ServerCertSource::DefaultCert, ServerCertSource::ServiceCert],
            ..TlsConfigurerOptions::default()
        })
        .unwrap();
    let token = CancellationToken::new();
    let task = manager.watch_default_cert(default_dir.clone(), d.config.watch_interval, token.clone());
    assert_eq!(served_cn(&holder).as_deref(), Some("CENTRAL_SERVICE: Central"));

    // WHEN: an operator certificate appears
    write_default_cert(&default_dir, &Subject::scanner());

    // THEN: it is served first
    assert!(wait_for(|| served_cn(&holder).as_deref() == Some("SCANNER_SERVICE: Scanner")).await);
    assert!(manager.default_cert().is_some());

    // WHEN: the directory disappears
    fs::remove_dir_all(&default_dir).unwrap();

    // THEN: the service certificate is served again
    assert!(wait_for(|| served_cn(&holder).as_deref() == Some("CENTRAL_SERVICE: Central")).await);
    assert!(manager.default_cert().is_none());

    token.cancel();
    assert_ok!(task.await);
}

#[tokio::test]
async fn default_cert_present_at_startup_is_loaded_synchronously() {
    let d = deployment("stackrox", true);
    let default_dir = d.config.default_cert_dir.clone().unwrap();
    write_default_cert(&default_dir, &Subject::scanner());
    let manager = Arc::new(TrustManager::load(&d.config).unwrap());

    let token = CancellationToken::new();
    let task = manager.watch_default_cert(default_dir, Duration::from_secs(60), token.clone());

    // No waiting: the first load happens before the watcher is spawned.
    assert!(manager.default_cert().is_some());
    token.cancel();
    assert_ok!(task.await);
}

#[tokio::test]
async fn broken_default_cert_clears_the_slot() {
    let d = deployment("stackrox", true);
    let default_dir = d.config.default_cert_dir.clone().unwrap();
    write_default_cert(&default_dir, &Subject::scanner());
    let manager = Arc::new(TrustManager::load(&d.config).unwrap());
    let token = CancellationToken::new();
    let task = manager.watch_default_cert(default_dir.clone(), d.config.watch_interval, token.clone());
    assert!(manager.default_cert().is_some());

    // WHEN: the key file goes missing
    fs::remove_file(default_dir.join(DEFAULT_KEY_FILE_NAME)).unwrap();

    // THEN: the slot is cleared rather than serving a half-configured pair
    assert!(wait_for(|| manager.default_cert().is_none()).await);
    token.cancel();
    assert_ok!(task.await);
}

#[test]
fn provider_registration_round_trip_through_holders() {
    // GIVEN: a holder trusting both user providers and the service CA
    let d = deployment("stackrox", true);
    let manager = TrustManager::load(&d.config).unwrap();
    let holder = manager
        .tls_configurer(&TlsConfigurerOptions {
            server_certs: vec![ServerCertSource::ServiceCert],
            client_cas: vec![ClientCaSource::UserProviders, ClientCaSource::ServiceCa],
            require_client_cert: false,
            fallback_client_auth: ClientAuthMode::NoClientCert,
        })
        .unwrap();
    assert_eq!(holder.current_snapshot().unwrap().client_ca_count(), 1);

    // WHEN: two providers register disjoint CAs
    let (ca1, ca2) = (
        CertificateAuthority::generate().unwrap(),
        CertificateAuthority::generate().unwrap(),
    );
    manager.register_auth_provider(Arc::new(Provider("okta")), vec![ca1.certificate().clone()]);
    manager.register_auth_provider(Arc::new(Provider("pki")), vec![ca2.certificate().clone()]);

    // THEN: both are trusted and attributed
    let snapshot = holder.current_snapshot().unwrap();
    assert_eq!(snapshot.client_ca_count(), 3);
    assert_eq!(snapshot.client_auth(), ClientAuthMode::VerifyClientCertIfGiven);
    let fp1 = fingerprint(ca1.certificate());
    let fp2 = fingerprint(ca2.certificate());
    assert_eq!(manager.provider_for_fingerprint(&fp1).unwrap().id(), "okta");
    assert_eq!(manager.provider_for_fingerprint(&fp2).unwrap().id(), "pki");

    // WHEN: one unregisters
    manager.unregister_auth_provider(&Provider("okta"));

    // THEN: only its CA disappears
    assert_eq!(holder.current_snapshot().unwrap().client_ca_count(), 2);
    assert!(manager.provider_for_fingerprint(&fp1).is_none());
    assert_eq!(manager.provider_for_fingerprint(&fp2).unwrap().id(), "pki");

    // The internal CA is never attributed to a provider.
    assert!(manager.provider_for_fingerprint(&fingerprint(d.ca.certificate())).is_none());
}

#[test]
fn service_identity_is_recovered_from_issued_cert() {
    let d = deployment("stackrox", true);
    let manager = TrustManager::load(&d.config).unwrap();
    let leaf = manager.service_certificates()[0].leaf().clone();
    let subject = manager.ca().validate_and_extract_subject(&leaf).unwrap();
    assert_eq!(subject.service_type, ServiceType::CentralService);
}
