//! Certificate loading, rustls server config and CLI certificate generation.
//!
//! Provides:
//! - [`build_server_config`] — `rustls::ServerConfig` for the HTTPS listener
//! - [`load_certs`] / [`load_private_key`] — PEM file loading
//! - [`CertGenerator`] — `rcgen`-backed generation for the `ssgw cert` commands
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    string::Ia5String, Issuer, KeyPair, SanType, date_time_ymd,
};
use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::TlsConfig;
use crate::mtls::verifier::HandshakeVerifier;
use crate::trust::TrustStore;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: build TLS server config
// ─────────────────────────────────────────────────────────────────────────────

/// Build the `rustls::ServerConfig` for the HTTPS listener.
///
/// Client certificates are requested according to the store's current
/// snapshot and never required at the handshake; see [`HandshakeVerifier`].
///
/// # Errors
///
/// Returns an error if the server certificate or key cannot be read or parsed,
/// or if they do not form a usable pair.
pub fn build_server_config(tls: &TlsConfig, store: TrustStore) -> Result<ServerConfig> {
    let server_certs = load_certs(Path::new(&tls.server_cert))?;
    let server_key = load_private_key(Path::new(&tls.server_key))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(HandshakeVerifier::new(store, Arc::clone(&provider)));

    let mut tls_cfg = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(server_cert = %tls.server_cert, "Server TLS config built");

    Ok(tls_cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem_data)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Certificate(format!(
                "Failed to parse certs from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file (PKCS#8, PKCS#1 or SEC1).
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&pem_data).map_err(|e| {
        Error::Certificate(format!(
            "Failed to parse private key from '{}': {e}",
            path.display()
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation (CLI helpers)
// ─────────────────────────────────────────────────────────────────────────────

/// Validity window of a generated certificate.
#[derive(Debug, Clone, Copy)]
pub struct Validity {
    /// Start of validity.
    pub not_before: OffsetDateTime,
    /// End of validity.
    pub not_after: OffsetDateTime,
}

impl Validity {
    /// From today until `days` from now.
    pub fn days_from_now(days: u32) -> Result<Self> {
        Ok(Self {
            not_before: days_from_today(0)?,
            not_after: days_from_today(days)?,
        })
    }

    /// A window that closed long ago (2000-01-01 .. 2002-01-01).
    pub fn expired() -> Self {
        Self {
            not_before: date_time_ymd(2000, 1, 1),
            not_after: date_time_ymd(2002, 1, 1),
        }
    }
}

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the CA (e.g. `"Test IS CA"`).
    pub cn: &'a str,
    /// Validity window.
    pub validity: Validity,
}

/// Parameters for an information-system (client) or server leaf certificate.
#[derive(Debug)]
pub struct LeafCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Organisation (optional).
    pub organization: Option<&'a str>,
    /// DNS subject alternative names.  Non-empty makes a server cert.
    pub san_dns: Vec<String>,
    /// Validity window.
    pub validity: Validity,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate CA key: {e}")))?;

        let ca_cert = ca_params(params)
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue an intermediate CA certificate signed by `ca_cert_pem` /
    /// `ca_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns an error if the issuing CA cert/key cannot be parsed, key
    /// generation fails, or certificate serialisation fails.
    pub fn issue_ca(
        params: &CaParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {e}")))?;
        let ca_der = CertificateDer::from_pem_slice(ca_cert_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("Failed to parse CA cert: {e}")))?;
        let issuer = Issuer::from_ca_cert_der(&ca_der, ca_key)
            .map_err(|e| Error::Certificate(format!("Failed to read CA issuer data: {e}")))?;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate CA key: {e}")))?;
        let cert = ca_params(params)
            .signed_by(&key_pair, &issuer)
            .map_err(|e| Error::Certificate(format!("Intermediate CA signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a leaf certificate signed by `ca_cert_pem` / `ca_key_pem`.
    ///
    /// Leaves with DNS SANs are marked for server authentication, all others
    /// for client authentication.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA cert/key cannot be parsed, key generation
    /// fails, or certificate serialisation fails.
    pub fn issue_leaf(
        params: &LeafCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {e}")))?;
        let ca_der = CertificateDer::from_pem_slice(ca_cert_pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("Failed to parse CA cert: {e}")))?;
        let issuer = Issuer::from_ca_cert_der(&ca_der, ca_key)
            .map_err(|e| Error::Certificate(format!("Failed to read CA issuer data: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate leaf key: {e}")))?;

        let mut leaf_params = leaf_params(params)?;
        leaf_params.extended_key_usages = if params.san_dns.is_empty() {
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        } else {
            vec![ExtendedKeyUsagePurpose::ServerAuth]
        };

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::Certificate(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Generate a self-signed information-system certificate, the usual way
    /// a client registers a certificate directly with the security server.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or serialisation fails.
    pub fn self_signed(params: &LeafCertParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate key: {e}")))?;
        let mut cert_params = leaf_params(params)?;
        cert_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = cert_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("Self-signed cert generation failed: {e}")))?;
        Ok(GeneratedCert {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Write a [`GeneratedCert`] to disk as `<stem>.crt` and `<stem>.key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::Certificate(format!("Cannot create dir '{}': {e}", dir.display()))
        })?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Certificate(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Certificate(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| Error::Certificate(format!("Cannot read '{}': {e}", path.display())))
}

fn ca_params(params: &CaParams<'_>) -> CertificateParams {
    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, params.cn);
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.not_before = params.validity.not_before;
    ca_params.not_after = params.validity.not_after;
    ca_params
}

fn leaf_params(params: &LeafCertParams<'_>) -> Result<CertificateParams> {
    let mut leaf_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, params.cn);
    if let Some(org) = params.organization {
        dn.push(DnType::OrganizationName, org);
    }
    leaf_params.distinguished_name = dn;
    leaf_params.not_before = params.validity.not_before;
    leaf_params.not_after = params.validity.not_after;

    let mut sans = Vec::with_capacity(params.san_dns.len());
    for dns in &params.san_dns {
        let ia5 = Ia5String::try_from(dns.as_str())
            .map_err(|e| Error::Certificate(format!("Invalid DNS SAN '{dns}': {e}")))?;
        sans.push(SanType::DnsName(ia5));
    }
    leaf_params.subject_alt_names = sans;
    Ok(leaf_params)
}

/// Midnight UTC `days` from today, as an `rcgen` date.
fn days_from_today(days: u32) -> Result<OffsetDateTime> {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Internal(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = OffsetDateTime::from_unix_timestamp(i64::try_from(future_secs).unwrap_or(i64::MAX))
        .map_err(|e| Error::Internal(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────────────────────────


// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::identity::CertIdentity;

    fn ca() -> GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn: "Test CA",
            validity: Validity::days_from_now(365).unwrap(),
        })
        .unwrap()
    }

    fn client_params(cn: &str) -> LeafCertParams<'_> {
        LeafCertParams {
            cn,
            organization: Some("Ministry of Tests"),
            san_dns: vec![],
            validity: Validity::days_from_now(30).unwrap(),
        }
    }

    #[test]
    fn init_ca_produces_valid_pem_cert_and_key() {
        let ca = ca();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn issue_leaf_client_cert_carries_subject() {
        let ca = ca();
        let leaf = CertGenerator::issue_leaf(&client_params("billing-is"), &ca.cert_pem, &ca.key_pem)
            .unwrap();
        let der = CertificateDer::from_pem_slice(leaf.cert_pem.as_bytes()).unwrap();
        let id = CertIdentity::from_der(&der).unwrap();
        assert_eq!(id.common_name.as_deref(), Some("billing-is"));
        assert_eq!(id.organization.as_deref(), Some("Ministry of Tests"));
    }

    #[test]
    fn issue_ca_is_signed_by_its_parent() {
        let root = ca();
        let intermediate = CertGenerator::issue_ca(
            &CaParams {
                cn: "Test Intermediate",
                validity: Validity::days_from_now(365).unwrap(),
            },
            &root.cert_pem,
            &root.key_pem,
        )
        .unwrap();
        let der = CertificateDer::from_pem_slice(intermediate.cert_pem.as_bytes()).unwrap();
        let cert = crate::mtls::identity::parse_der(&der).unwrap();
        assert_eq!(cert.subject().to_string(), "CN=Test Intermediate");
        assert_eq!(cert.issuer().to_string(), "CN=Test CA");
        assert!(cert.is_ca());
    }

    #[test]
    fn issue_leaf_fails_with_invalid_ca_key() {
        let ca = ca();
        let result = CertGenerator::issue_leaf(&client_params("x"), &ca.cert_pem, "not a pem key");
        assert!(result.is_err());
    }

    #[test]
    fn expired_validity_is_in_the_past() {
        let cert = CertGenerator::self_signed(&LeafCertParams {
            validity: Validity::expired(),
            ..client_params("old")
        })
        .unwrap();
        let der = CertificateDer::from_pem_slice(cert.cert_pem.as_bytes()).unwrap();
        let id = CertIdentity::from_der(&der).unwrap();
        assert_eq!(id.not_after, 1_009_843_200); // 2002-01-01T00:00:00Z
    }

    #[test]
    fn write_to_dir_creates_crt_and_key_files() {
        let dir = tempfile::tempdir().unwrap();
        CertGenerator::write_to_dir(&ca(), dir.path(), "ca").unwrap();
        assert!(dir.path().join("ca.crt").exists());
        assert!(dir.path().join("ca.key").exists());
    }

    #[test]
    fn load_certs_and_key_from_generated_files() {
        let dir = tempfile::tempdir().unwrap();
        CertGenerator::write_to_dir(&ca(), dir.path(), "ca").unwrap();

        let certs = load_certs(&dir.path().join("ca.crt")).unwrap();
        assert_eq!(certs.len(), 1);
        let key = load_private_key(&dir.path().join("ca.key")).unwrap();
        assert!(!key.secret_der().is_empty());
    }

    #[test]
    fn load_certs_returns_error_for_missing_file() {
        let err = load_certs(Path::new("/nonexistent/path/ca.crt")).unwrap_err();
        assert!(err.to_string().contains("Cannot read"));
    }

    #[test]
    fn load_certs_returns_error_for_empty_pem_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.crt");
        fs::write(&path, b"").unwrap();
        assert!(load_certs(&path).is_err());
    }

    #[test]
    fn load_private_key_returns_error_when_no_key_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert_only.pem");
        fs::write(&path, ca().cert_pem).unwrap();
        assert!(load_private_key(&path).is_err());
    }

    #[test]
    fn build_server_config_accepts_matching_pair() {
        // GIVEN: a server certificate issued by a test CA, written to disk
        let dir = tempfile::tempdir().unwrap();
        let ca = ca();
        let server = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: "gateway.local",
                organization: None,
                san_dns: vec!["localhost".to_string()],
                validity: Validity::days_from_now(30).unwrap(),
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        CertGenerator::write_to_dir(&server, dir.path(), "server").unwrap();

        let tls = TlsConfig {
            server_cert: dir.path().join("server.crt").display().to_string(),
            server_key: dir.path().join("server.key").display().to_string(),
        };
        let store = TrustStore::new(crate::trust::ConfigurationSnapshot::empty(true)).unwrap();

        // THEN: a config is produced with ALPN set
        let cfg = build_server_config(&tls, store).unwrap();
        assert_eq!(cfg.alpn_protocols.len(), 2);
    }
}
