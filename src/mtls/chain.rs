//! Presented-chain validation against a client's trusted certificate set.
//!
//! [`validate`] is synchronous and touches nothing outside its arguments: the
//! chain and the trusted set are already in memory, and revocation lookups are
//! not part of this step.  Trust and validity period are judged separately so
//! the caller can apply the operator's validity policy on top of a
//! cryptographic "yes".

use std::sync::Arc;
use std::time::Duration;

use rustls::CertificateError;
use rustls::pki_types::{CertificateDer, UnixTime};
use tracing::{debug, warn};
use x509_parser::certificate::X509Certificate;

use crate::mtls::identity::{CertIdentity, parse_der};
use crate::trust::TrustedCertificateSet;

// ─────────────────────────────────────────────────────────────────────────────
// Presented chain
// ─────────────────────────────────────────────────────────────────────────────

/// How the peer's connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSecurity {
    /// Plain TCP.
    Plaintext,
    /// TLS handshake completed.
    Tls,
}

/// The certificate chain a peer offered, leaf first, plus what the transport
/// layer knows about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedChain {
    certs: Arc<[CertificateDer<'static>]>,
    transport: TransportSecurity,
    peer: Option<CertIdentity>,
}

impl PresentedChain {
    /// A plaintext connection; there is no chain.
    pub fn plaintext() -> Self {
        Self {
            certs: Arc::from(Vec::new()),
            transport: TransportSecurity::Plaintext,
            peer: None,
        }
    }

    /// A TLS connection with the given chain (possibly empty).
    pub fn tls(certs: impl Into<Arc<[CertificateDer<'static>]>>) -> Self {
        let certs = certs.into();
        let peer = certs
            .first()
            .and_then(|leaf| CertIdentity::from_der(leaf).ok());
        Self {
            certs,
            transport: TransportSecurity::Tls,
            peer,
        }
    }

    /// Certificates, leaf first.
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// The end-entity certificate, if any was presented.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.certs.first()
    }

    /// Transport security of the connection.
    pub fn transport(&self) -> TransportSecurity {
        self.transport
    }

    /// Identity parsed from the leaf, when it parses.
    pub fn peer(&self) -> Option<&CertIdentity> {
        self.peer.as_ref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Verdict
// ─────────────────────────────────────────────────────────────────────────────

/// Which side of its validity window a certificate is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapseKind {
    /// `not_after` is in the past.
    Expired,
    /// `not_before` is in the future.
    NotYetValid,
}

/// The first presented certificate found outside its validity period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidityLapse {
    /// Position in the presented chain (0 = leaf).
    pub depth: usize,
    /// Subject label of the offending certificate.
    pub subject: String,
    /// Expired or not yet valid.
    pub kind: LapseKind,
    /// Validity start (Unix seconds).
    pub not_before: i64,
    /// Validity end (Unix seconds).
    pub not_after: i64,
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    /// Matches a trusted entry and every certificate is within its validity.
    Trusted,
    /// Matches a trusted entry, but a certificate is outside its validity.
    TrustedButExpired(ValidityLapse),
    /// Nothing in the trusted set matches (includes the empty chain).
    Untrusted,
    /// Some presented certificate does not decode.
    Malformed,
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate `chain` against `trusted` at the current system time.
pub fn validate(
    chain: &PresentedChain,
    trusted: &TrustedCertificateSet,
    enforce_validity_period: bool,
) -> ChainVerdict {
    validate_at(chain, trusted, enforce_validity_period, UnixTime::now())
}

/// Validate `chain` against `trusted` at time `now`.
///
/// The classification does not depend on `enforce_validity_period`; the flag
/// only decides whether a lapse is logged as an operator warning (accepted) or
/// at debug level (the caller will reject it).
pub fn validate_at(
    chain: &PresentedChain,
    trusted: &TrustedCertificateSet,
    enforce_validity_period: bool,
    now: UnixTime,
) -> ChainVerdict {
    let Some(leaf) = chain.leaf() else {
        return ChainVerdict::Untrusted;
    };

    let parsed = match chain
        .certs()
        .iter()
        .map(|der| parse_der(der))
        .collect::<crate::Result<Vec<_>>>()
    {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "Presented chain does not decode");
            return ChainVerdict::Malformed;
        }
    };

    let now_secs = i64::try_from(now.as_secs()).unwrap_or(i64::MAX);

    if !matches_trusted(leaf, &chain.certs()[1..], &parsed, trusted, now) {
        return ChainVerdict::Untrusted;
    }

    match first_lapse(&parsed, now_secs) {
        None => ChainVerdict::Trusted,
        Some(lapse) => {
            if enforce_validity_period {
                debug!(depth = lapse.depth, subject = %lapse.subject, kind = ?lapse.kind,
                    "Trusted certificate outside validity period");
            } else {
                warn!(depth = lapse.depth, subject = %lapse.subject, kind = ?lapse.kind,
                    "Trusted certificate outside validity period (not enforced)");
            }
            ChainVerdict::TrustedButExpired(lapse)
        }
    }
}

/// Verbatim match first; otherwise the leaf must chain to a trusted entry.
///
/// When the path check fails only because of the clock, it is repeated at an
/// instant where every presented certificate is within its validity, so that
/// issuance is still proven and the lapse is reported separately.  Chains
/// whose windows never overlap cannot be proven and stay untrusted.
fn matches_trusted(
    leaf: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    parsed: &[X509Certificate<'_>],
    trusted: &TrustedCertificateSet,
    now: UnixTime,
) -> bool {
    if trusted.contains_verbatim(leaf) {
        return true;
    }

    match trusted.check_issued(leaf, intermediates, now) {
        Ok(()) => true,
        Err(rustls::Error::InvalidCertificate(ref e)) if is_time_error(e) => {
            let Some(at) = common_validity(parsed) else {
                debug!("Presented chain has no instant where all certificates are valid");
                return false;
            };
            trusted.check_issued(leaf, intermediates, at).is_ok()
        }
        Err(e) => {
            debug!(error = %e, "Presented leaf not issued by any trusted entry");
            false
        }
    }
}

fn is_time_error(e: &CertificateError) -> bool {
    matches!(
        e,
        CertificateError::Expired
            | CertificateError::ExpiredContext { .. }
            | CertificateError::NotValidYet
            | CertificateError::NotValidYetContext { .. }
    )
}

/// Middle of the intersection of all validity windows, if it is non-empty.
fn common_validity(parsed: &[X509Certificate<'_>]) -> Option<UnixTime> {
    let start = parsed
        .iter()
        .map(|c| c.validity().not_before.timestamp())
        .max()?;
    let end = parsed
        .iter()
        .map(|c| c.validity().not_after.timestamp())
        .min()?;
    if start > end {
        return None;
    }
    let mid = start + (end - start) / 2;
    Some(UnixTime::since_unix_epoch(Duration::from_secs(
        u64::try_from(mid).unwrap_or(0),
    )))
}

fn first_lapse(parsed: &[X509Certificate<'_>], now: i64) -> Option<ValidityLapse> {
    parsed.iter().enumerate().find_map(|(depth, cert)| {
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        let kind = if now < not_before {
            LapseKind::NotYetValid
        } else if now > not_after {
            LapseKind::Expired
        } else {
            return None;
        };
        Some(ValidityLapse {
            depth,
            subject: cert.subject().to_string(),
            kind,
            not_before,
            not_after,
        })
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
