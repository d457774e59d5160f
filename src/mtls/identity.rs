//! Certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the subject fields
//! used in audit logs and operator output: Common Name, Organisation,
//! Organisational Unit, SAN DNS names, serial number, validity window and a
//! SHA-256 fingerprint.  None of these fields take part in trust decisions;
//! trust is decided on the certificate bytes themselves.

use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Extracted identity fields of a certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// First Organisation (O) in the subject.
    pub organization: Option<String>,

    /// First Organisational Unit (OU) in the subject.
    pub organizational_unit: Option<String>,

    /// Subject Alternative Name DNS entries.
    pub san_dns_names: Vec<String>,

    /// Serial number, lowercase hex.
    pub serial: String,

    /// Start of the validity window (Unix seconds).
    pub not_before: i64,

    /// End of the validity window (Unix seconds).
    pub not_after: i64,

    /// SHA-256 of the DER encoding, lowercase hex.
    pub fingerprint: String,

    /// Pre-computed human-readable label for logs/audit events.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the bytes are not a single complete
    /// X.509 certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = parse_der(der)?;

        let common_name = extract_cn(&cert);
        let organization = extract_o(&cert);
        let organizational_unit = extract_ou(&cert);
        let san_dns_names = extract_san_dns(&cert);
        let display_name =
            build_display_name(common_name.as_ref(), organization.as_ref(), &cert);

        Ok(Self {
            common_name,
            organization,
            organizational_unit,
            san_dns_names,
            serial: cert.raw_serial_as_string().replace(':', ""),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            fingerprint: fingerprint(der),
            display_name,
        })
    }

    /// Whether `at` (Unix seconds) falls inside the validity window.
    pub fn is_valid_at(&self, at: i64) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

/// Parse exactly one certificate, refusing trailing bytes.
pub(crate) fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (rest, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {e}")))?;
    if !rest.is_empty() {
        return Err(Error::Certificate(format!(
            "{} trailing byte(s) after certificate",
            rest.len()
        )));
    }
    Ok(cert)
}

/// SHA-256 fingerprint of a DER blob, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_o(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_ou(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_organizational_unit()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn extract_san_dns(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut dns_names = Vec::new();
    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push((*dns).to_owned());
            }
        }
    }
    dns_names
}

/// `CN (O)` when both are present, otherwise whichever exists, otherwise the
/// full subject DN.
fn build_display_name(
    cn: Option<&String>,
    org: Option<&String>,
    cert: &X509Certificate<'_>,
) -> String {
    match (cn, org) {
        (Some(cn), Some(org)) => format!("{cn} ({org})"),
        (Some(cn), None) => cn.clone(),
        (None, Some(org)) => org.clone(),
        (None, None) => {
            let dn = cert.subject().to_string();
            if dn.is_empty() {
                "<unknown>".to_owned()
            } else {
                dn
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
