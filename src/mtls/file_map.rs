//! File-map layout of CA and service certificate secrets.
//!
//! A file map is `file name → contents`, the shape of a mounted secret
//! directory.  Keys are canonical:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `ca.pem` / `ca-key.pem` | service CA certificate and key |
//! | `ca-secondary.pem` / `ca-secondary-key.pem` | optional secondary CA |
//! | `<prefix>cert.pem` / `<prefix>key.pem` | service certificate and key |
//!
//! The prefix is empty for a secret holding one service and
//! [`service_prefix`] (e.g. `scanner-db-`) when several services share a map.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::mtls::ca::{CertificateAuthority, IssueOptions, IssuedCert};
use crate::mtls::cert_manager::{ServerCertificate, parse_certs_pem};
use crate::mtls::identity::CertIdentity;
use crate::mtls::subject::{ServiceType, Subject};
use crate::{Error, Result};

/// CA certificate key.
pub const CA_CERT_FILE_NAME: &str = "ca.pem";
/// CA private key key.
pub const CA_KEY_FILE_NAME: &str = "ca-key.pem";
/// Secondary CA certificate key.
pub const SECONDARY_CA_CERT_FILE_NAME: &str = "ca-secondary.pem";
/// Secondary CA private key key.
pub const SECONDARY_CA_KEY_FILE_NAME: &str = "ca-secondary-key.pem";
/// Service certificate key (before prefixing).
pub const SERVICE_CERT_FILE_NAME: &str = "cert.pem";
/// Service private key key (before prefixing).
pub const SERVICE_KEY_FILE_NAME: &str = "key.pem";

/// In-memory secret contents, ordered by file name.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Extra check run by [`verify_service_cert_and_key`] after the standard ones.
pub type ExtraCertCheck<'a> = &'a dyn Fn(&CertIdentity) -> Result<()>;

/// Prefix under which `service_type`'s cert and key live in a shared map.
#[must_use]
pub fn service_prefix(service_type: ServiceType) -> String {
    format!("{}-", service_type.slug())
}

// ─────────────────────────────────────────────────────────────────────────────
// CA entries
// ─────────────────────────────────────────────────────────────────────────────

/// Store the CA certificate and, when the CA can sign, its key.
pub fn add_ca_to_file_map(map: &mut FileMap, ca: &CertificateAuthority) {
    add_ca_cert_to_file_map(map, ca);
    if let Some(key_pem) = ca.key_pem() {
        map.insert(CA_KEY_FILE_NAME.to_string(), key_pem.as_bytes().to_vec());
    }
}

/// Store only the CA certificate.
pub fn add_ca_cert_to_file_map(map: &mut FileMap, ca: &CertificateAuthority) {
    map.insert(CA_CERT_FILE_NAME.to_string(), ca.cert_pem().as_bytes().to_vec());
}

/// Load the signing-capable CA.
///
/// # Errors
///
/// Fails when either entry is missing or the pair does not load.
pub fn load_ca_from_file_map(map: &FileMap) -> Result<CertificateAuthority> {
    let cert = required(map, CA_CERT_FILE_NAME)?;
    let key = required(map, CA_KEY_FILE_NAME)?;
    CertificateAuthority::load_for_signing(cert, key)
}

/// Load the secondary CA, if the map carries one.
///
/// # Errors
///
/// Fails when only one of the two entries is present or the pair does not
/// load.
pub fn load_secondary_ca_from_file_map(map: &FileMap) -> Result<Option<CertificateAuthority>> {
    match (
        map.get(SECONDARY_CA_CERT_FILE_NAME),
        map.get(SECONDARY_CA_KEY_FILE_NAME),
    ) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => CertificateAuthority::load_for_signing(cert, key).map(Some),
        _ => Err(Error::Config(format!(
            "secondary CA requires both {SECONDARY_CA_CERT_FILE_NAME} and {SECONDARY_CA_KEY_FILE_NAME}"
        ))),
    }
}

/// Check the map's CA certificate is exactly `ca`'s.
///
/// # Errors
///
/// Fails when the entry is missing, unparseable, or a different certificate.
pub fn verify_ca_cert_in_file_map(map: &FileMap, ca: &CertificateAuthority) -> Result<()> {
    let certs = parse_certs_pem(required(map, CA_CERT_FILE_NAME)?)?;
    match certs.first() {
        Some(cert) if cert == ca.certificate() => Ok(()),
        _ => Err(Error::Validation(format!(
            "{CA_CERT_FILE_NAME} does not hold the expected CA certificate"
        ))),
    }
}

/// Keep an existing CA or generate a new one.
///
/// With both CA entries present, loads them and checks the CA properties.
/// With neither present, generates a CA and stores it in the map.
///
/// # Errors
///
/// Fails when exactly one of the two entries is present, or the existing CA
/// does not load or lacks the service CA properties.
pub fn ca_from_file_map_or_generate(map: &mut FileMap) -> Result<CertificateAuthority> {
    match (map.contains_key(CA_CERT_FILE_NAME), map.contains_key(CA_KEY_FILE_NAME)) {
        (true, true) => {
            let ca = load_ca_from_file_map(map)?;
            ca.check_properties()?;
            debug!(fingerprint = %ca.identity().fingerprint, "Keeping existing CA");
            Ok(ca)
        }
        (false, false) => {
            let ca = CertificateAuthority::generate()?;
            add_ca_to_file_map(map, &ca);
            info!(fingerprint = %ca.identity().fingerprint, "Generated new service CA");
            Ok(ca)
        }
        _ => Err(Error::Config(format!(
            "CA requires both {CA_CERT_FILE_NAME} and {CA_KEY_FILE_NAME}, found only one"
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service entries
// ─────────────────────────────────────────────────────────────────────────────

/// Issue a certificate for `subject` and store it under `prefix`.
///
/// # Errors
///
/// Propagates issuance errors; the map is untouched on failure.
pub fn issue_service_cert(
    map: &mut FileMap,
    ca: &CertificateAuthority,
    subject: &Subject,
    prefix: &str,
    opts: &IssueOptions,
) -> Result<IssuedCert> {
    let issued = ca.issue_cert_for_subject(subject, opts)?;
    map.insert(
        format!("{prefix}{SERVICE_CERT_FILE_NAME}"),
        issued.cert_pem.as_bytes().to_vec(),
    );
    map.insert(
        format!("{prefix}{SERVICE_KEY_FILE_NAME}"),
        issued.key_pem.as_bytes().to_vec(),
    );
    Ok(issued)
}

/// Load the service certificate stored under `prefix`, if any.
///
/// # Errors
///
/// Fails when only one of cert and key is present, or the pair is invalid.
pub fn load_service_cert_from_file_map(map: &FileMap, prefix: &str) -> Result<Option<ServerCertificate>> {
    let cert_name = format!("{prefix}{SERVICE_CERT_FILE_NAME}");
    let key_name = format!("{prefix}{SERVICE_KEY_FILE_NAME}");
    match (map.get(&cert_name), map.get(&key_name)) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => ServerCertificate::from_pem(cert, key).map(Some),
        _ => Err(Error::Config(format!(
            "service certificate requires both {cert_name} and {key_name}"
        ))),
    }
}

/// Verify the service certificate and key stored under `prefix`.
///
/// The pair must match, the certificate must be issued by `ca` and valid at
/// `now`, and its subject must be of `service_type`.  `extra_check`, when
/// given, runs last.
///
/// # Errors
///
/// Returns the first failing check.
pub fn verify_service_cert_and_key(
    map: &FileMap,
    prefix: &str,
    ca: &CertificateAuthority,
    service_type: ServiceType,
    now: OffsetDateTime,
    extra_check: Option<ExtraCertCheck<'_>>,
) -> Result<()> {
    let cert = load_service_cert_from_file_map(map, prefix)?.ok_or_else(|| {
        Error::Config(format!("no service certificate under prefix '{prefix}'"))
    })?;
    let subject = ca.validate_and_extract_subject_at(cert.leaf(), now)?;
    if subject.service_type != service_type {
        return Err(Error::Validation(format!(
            "certificate is for {}, expected {service_type}",
            subject.service_type
        )));
    }
    if let Some(check) = extra_check {
        check(cert.identity())?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Write every entry as a file in `dir`, creating it if needed.
///
/// Key files are written owner-readable only on Unix.
///
/// # Errors
///
/// Fails on the first file that cannot be written.
pub fn write_file_map_to_dir(map: &FileMap, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    for (name, contents) in map {
        write_entry(&dir.join(name), contents, name.ends_with("key.pem"))?;
    }
    debug!(dir = %dir.display(), files = map.len(), "Wrote file map");
    Ok(())
}

/// Read every regular file in `dir` into a map.
///
/// Entries starting with `..` (the bookkeeping links of mounted secret
/// volumes) and subdirectories are skipped.  A missing directory yields an
/// empty map.
///
/// # Errors
///
/// Fails on any other read error.
pub fn read_file_map_from_dir(dir: &Path) -> Result<FileMap> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut map = FileMap::new();
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if name.starts_with("..") || !fs::metadata(entry.path())?.is_file() {
            continue;
        }
        map.insert(name, fs::read(entry.path())?);
    }
    Ok(map)
}

fn required<'a>(map: &'a FileMap, name: &str) -> Result<&'a [u8]> {
    map.get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Config(format!("file map has no {name}")))
}

/// Write one file; secret files are never readable beyond the owner, not
/// even while being written.
#[cfg_attr(not(unix), allow(unused_variables))]
fn write_entry(path: &Path, contents: &[u8], secret: bool) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // The creation mode does not apply to a file that already exists.
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents)?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::ca::SigningProfile;

    fn ca_map() -> (FileMap, CertificateAuthority) {
        let mut map = FileMap::new();
        let ca = ca_from_file_map_or_generate(&mut map).unwrap();
        (map, ca)
    }

    #[test]
    fn service_prefix_uses_slug() {
        assert_eq!(service_prefix(ServiceType::ScannerDbService), "scanner-db-");
        assert_eq!(service_prefix(ServiceType::CentralService), "central-");
    }

    // ─── CA ───────────────────────────────────────────────────────────────────

    #[test]
    fn generate_populates_both_ca_entries() {
        let (map, ca) = ca_map();
        assert!(map.contains_key(CA_CERT_FILE_NAME));
        assert!(map.contains_key(CA_KEY_FILE_NAME));
        verify_ca_cert_in_file_map(&map, &ca).unwrap();
    }

    #[test]
    fn existing_ca_is_kept() {
        // GIVEN: a map that already holds a CA
        let (mut map, ca) = ca_map();
        // WHEN: asking again
        let again = ca_from_file_map_or_generate(&mut map).unwrap();
        // THEN: same CA, not a new one
        assert_eq!(again.certificate(), ca.certificate());
    }

    #[test]
    fn half_present_ca_is_rejected() {
        let (mut map, _) = ca_map();
        map.remove(CA_KEY_FILE_NAME);
        assert!(matches!(
            ca_from_file_map_or_generate(&mut map),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn cert_only_map_has_no_key() {
        let ca = CertificateAuthority::generate().unwrap();
        let mut map = FileMap::new();
        add_ca_cert_to_file_map(&mut map, &ca);
        assert!(map.contains_key(CA_CERT_FILE_NAME));
        assert!(!map.contains_key(CA_KEY_FILE_NAME));
        assert!(load_ca_from_file_map(&map).is_err());
    }

    #[test]
    fn verify_ca_cert_rejects_different_ca() {
        let (map, _) = ca_map();
        let other = CertificateAuthority::generate().unwrap();
        assert!(verify_ca_cert_in_file_map(&map, &other).is_err());
    }

    #[test]
    fn secondary_ca_is_optional() {
        let (mut map, _) = ca_map();
        assert!(load_secondary_ca_from_file_map(&map).unwrap().is_none());

        let secondary = CertificateAuthority::generate().unwrap();
        map.insert(
            SECONDARY_CA_CERT_FILE_NAME.to_string(),
            secondary.cert_pem().as_bytes().to_vec(),
        );
        assert!(load_secondary_ca_from_file_map(&map).is_err());

        map.insert(
            SECONDARY_CA_KEY_FILE_NAME.to_string(),
            secondary.key_pem().unwrap().as_bytes().to_vec(),
        );
        let loaded = load_secondary_ca_from_file_map(&map).unwrap().unwrap();
        assert_eq!(loaded.certificate(), secondary.certificate());
    }

    // ─── Service certs ────────────────────────────────────────────────────────

    #[test]
    fn issued_service_cert_verifies_under_prefix() {
        let (mut map, ca) = ca_map();
        let prefix = service_prefix(ServiceType::ScannerDbService);
        issue_service_cert(&mut map, &ca, &Subject::scanner_db(), &prefix, &IssueOptions::default())
            .unwrap();

        assert!(map.contains_key("scanner-db-cert.pem"));
        assert!(map.contains_key("scanner-db-key.pem"));
        verify_service_cert_and_key(&map, &prefix, &ca, ServiceType::ScannerDbService, OffsetDateTime::now_utc(), None).unwrap();
    }

    #[test]
    fn verification_judges_validity_at_the_given_time() {
        // GIVEN: a three-hour certificate
        let (mut map, ca) = ca_map();
        let opts = IssueOptions::default().with_profile(SigningProfile::Hours);
        issue_service_cert(&mut map, &ca, &Subject::central(), "", &opts).unwrap();
        let now = OffsetDateTime::now_utc();
        let verify_at = |at| verify_service_cert_and_key(&map, "", &ca, ServiceType::CentralService, at, None);

        // WHEN / THEN: it verifies now, but not once it has expired
        verify_at(now).unwrap();
        assert!(verify_at(now + time::Duration::hours(4)).is_err());
    }

    #[test]
    fn wrong_service_type_fails_verification() {
        let (mut map, ca) = ca_map();
        issue_service_cert(&mut map, &ca, &Subject::central(), "", &IssueOptions::default()).unwrap();
        let result = verify_service_cert_and_key(&map, "", &ca, ServiceType::ScannerService, OffsetDateTime::now_utc(), None);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn cert_without_key_fails_verification() {
        let (mut map, ca) = ca_map();
        issue_service_cert(&mut map, &ca, &Subject::central(), "", &IssueOptions::default()).unwrap();
        map.remove(SERVICE_KEY_FILE_NAME);
        let result = verify_service_cert_and_key(&map, "", &ca, ServiceType::CentralService, OffsetDateTime::now_utc(), None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn mismatched_key_fails_verification() {
        let (mut map, ca) = ca_map();
        issue_service_cert(&mut map, &ca, &Subject::central(), "", &IssueOptions::default()).unwrap();
        let other = ca
            .issue_cert_for_subject(&Subject::central(), &IssueOptions::default())
            .unwrap();
        map.insert(SERVICE_KEY_FILE_NAME.to_string(), other.key_pem.into_bytes());
        let result = verify_service_cert_and_key(&map, "", &ca, ServiceType::CentralService, OffsetDateTime::now_utc(), None);
        assert!(matches!(result, Err(Error::KeyMismatch(_))));
    }

    #[test]
    fn cert_from_other_ca_fails_verification() {
        let (mut map, _) = ca_map();
        let other = CertificateAuthority::generate().unwrap();
        issue_service_cert(&mut map, &other, &Subject::central(), "", &IssueOptions::default())
            .unwrap();
        let ca = load_ca_from_file_map(&map).unwrap();
        assert!(
            verify_service_cert_and_key(&map, "", &ca, ServiceType::CentralService, OffsetDateTime::now_utc(), None).is_err()
        );
    }

    #[test]
    fn extra_check_runs_last() {
        let (mut map, ca) = ca_map();
        issue_service_cert(&mut map, &ca, &Subject::central(), "", &IssueOptions::default()).unwrap();
        let reject = |_: &CertIdentity| -> Result<()> {
            Err(Error::Validation("rejected by extra check".to_string()))
        };
        let result =
            verify_service_cert_and_key(&map, "", &ca, ServiceType::CentralService, OffsetDateTime::now_utc(), Some(&reject));
        assert!(result.unwrap_err().to_string().contains("rejected by extra check"));
    }

    // ─── Directory I/O ────────────────────────────────────────────────────────

    #[test]
    fn write_then_read_directory_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (mut map, ca) = ca_map();
        issue_service_cert(&mut map, &ca, &Subject::central(), "", &IssueOptions::default()).unwrap();

        write_file_map_to_dir(&map, dir.path()).unwrap();
        let read_back = read_file_map_from_dir(dir.path()).unwrap();
        assert_eq!(read_back, map);
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_only_even_when_replacing_readable_files() {
        use std::os::unix::fs::PermissionsExt;

        // GIVEN: a world-readable key file left over from an earlier write
        let dir = tempfile::tempdir().unwrap();
        let stale_key = dir.path().join(CA_KEY_FILE_NAME);
        fs::write(&stale_key, b"old").unwrap();
        fs::set_permissions(&stale_key, fs::Permissions::from_mode(0o644)).unwrap();
        let (map, _) = ca_map();

        // WHEN: the map is written over it
        write_file_map_to_dir(&map, dir.path()).unwrap();

        // THEN: the key file is owner-only and holds the new contents
        let mode = fs::metadata(&stale_key).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read(&stale_key).unwrap(), map[CA_KEY_FILE_NAME]);
    }

    #[test]
    fn read_skips_secret_volume_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ca.pem"), b"x").unwrap();
        fs::write(dir.path().join("..data"), b"y").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let map = read_file_map_from_dir(dir.path()).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["ca.pem"]);
    }

    #[test]
    fn read_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let map = read_file_map_from_dir(&dir.path().join("absent")).unwrap();
        assert!(map.is_empty());
    }
}
