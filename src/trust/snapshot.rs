//! Immutable trust configuration snapshots.
//!
//! A [`ConfigurationSnapshot`] maps each registered [`ClientId`] to the
//! [`AuthenticationPolicy`] it must satisfy and the [`TrustedCertificateSet`]
//! its information systems may present.  Snapshots are only produced by
//! [`SnapshotBuilder::build`], which runs a full validation pass before
//! indexing anything, so a snapshot that exists is a snapshot that is valid.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::identifier::ClientId;
use crate::mtls::identity::CertIdentity;

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Transport-security requirement registered for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationPolicy {
    /// Plain HTTP is acceptable.
    #[serde(alias = "NOSSL")]
    None,
    /// TLS required; the client certificate is not examined.
    #[serde(alias = "SSLNOAUTH")]
    VerifyNone,
    /// TLS required; the client certificate must match the trusted set.
    #[serde(alias = "SSLAUTH")]
    VerifyClient,
}

impl AuthenticationPolicy {
    /// Whether this policy requires a TLS-secured transport.
    pub fn requires_tls(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Stable label used in logs, metrics and dispatch headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::VerifyNone => "verify_none",
            Self::VerifyClient => "verify_client",
        }
    }
}

impl fmt::Display for AuthenticationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trusted certificates
// ─────────────────────────────────────────────────────────────────────────────

/// One registered information-system certificate.
#[derive(Debug, Clone)]
pub struct TrustedCertificate {
    der: CertificateDer<'static>,
    identity: CertIdentity,
}

impl TrustedCertificate {
    /// Raw DER bytes.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Parsed subject identity (for logs and `check-config` output).
    pub fn identity(&self) -> &CertIdentity {
        &self.identity
    }
}

/// The certificates registered for one client, in insertion order.
///
/// Acts as a closed allow-list: a presented leaf matches when it equals an
/// entry byte-for-byte, or when its signature path ends at an entry.  The
/// path check uses only the entries of this set as anchors.
#[derive(Clone, Default)]
pub struct TrustedCertificateSet {
    certs: Vec<TrustedCertificate>,
    issuers: Option<Arc<dyn ClientCertVerifier>>,
}

impl TrustedCertificateSet {
    fn from_parsed(certs: Vec<TrustedCertificate>) -> Self {
        let issuers = build_issuer_verifier(&certs);
        Self { certs, issuers }
    }

    /// Number of registered certificates.
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Iterate over registered certificates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TrustedCertificate> {
        self.certs.iter()
    }

    /// Returns `true` when `leaf` is byte-identical to a registered entry.
    pub fn contains_verbatim(&self, leaf: &CertificateDer<'_>) -> bool {
        self.certs
            .iter()
            .any(|entry| entry.der.as_ref() == leaf.as_ref())
    }

    /// Returns the verification error when `leaf` (with `intermediates`) does
    /// not chain to one of the registered entries at time `at`.
    pub(crate) fn check_issued(
        &self,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        at: UnixTime,
    ) -> Result<(), rustls::Error> {
        match self.issuers {
            Some(ref verifier) => verifier
                .verify_client_cert(leaf, intermediates, at)
                .map(|_| ()),
            None => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            )),
        }
    }
}

impl fmt::Debug for TrustedCertificateSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.certs.iter().map(|c| &c.identity.display_name))
            .finish()
    }
}

/// Build a webpki verifier anchored at the entries of one trusted set.
///
/// Entries that cannot serve as trust anchors still match verbatim; they are
/// only skipped for the issued-by check.
fn build_issuer_verifier(certs: &[TrustedCertificate]) -> Option<Arc<dyn ClientCertVerifier>> {
    let mut roots = RootCertStore::empty();
    for entry in certs {
        if let Err(e) = roots.add(entry.der.clone()) {
            debug!(
                subject = %entry.identity.display_name,
                error = %e,
                "Trusted entry not usable as issuer anchor; verbatim match only"
            );
        }
    }
    if roots.is_empty() {
        return None;
    }
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| debug!(error = %e, "Issuer verifier unavailable"))
        .ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Policy and trusted set for one client.
#[derive(Debug, Clone)]
pub struct ClientTrust {
    policy: AuthenticationPolicy,
    trusted: TrustedCertificateSet,
}

impl ClientTrust {
    /// Required authentication policy.
    pub fn policy(&self) -> AuthenticationPolicy {
        self.policy
    }

    /// Registered certificates.
    pub fn trusted(&self) -> &TrustedCertificateSet {
        &self.trusted
    }
}

/// Point-in-time, immutable trust configuration.
#[derive(Debug, Clone)]
pub struct ConfigurationSnapshot {
    version: u64,
    enforce_validity_period: bool,
    clients: HashMap<ClientId, ClientTrust>,
}

impl ConfigurationSnapshot {
    /// Start building a snapshot.
    pub fn builder(enforce_validity_period: bool) -> SnapshotBuilder {
        SnapshotBuilder::new(enforce_validity_period)
    }

    /// A snapshot with no registered clients.  Every claim is unknown.
    pub fn empty(enforce_validity_period: bool) -> Self {
        Self {
            version: 0,
            enforce_validity_period,
            clients: HashMap::new(),
        }
    }

    /// Publication version, assigned by the store (0 = never published).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether an expired-but-trusted certificate must be rejected.
    pub fn enforce_validity_period(&self) -> bool {
        self.enforce_validity_period
    }

    /// Policy registered for `client`, if any.
    pub fn policy_for(&self, client: &ClientId) -> Option<AuthenticationPolicy> {
        self.clients.get(client).map(|c| c.policy)
    }

    /// Certificates registered for `client`, if any.
    pub fn trusted_certs_for(&self, client: &ClientId) -> Option<&TrustedCertificateSet> {
        self.clients.get(client).map(|c| &c.trusted)
    }

    /// Number of registered clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` when no client is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Iterate over registered clients (unordered).
    pub fn clients(&self) -> impl Iterator<Item = (&ClientId, &ClientTrust)> {
        self.clients.iter()
    }

    /// Whether the TLS listener should ask peers for a certificate at all.
    ///
    /// This is the provisional, pre-claim view used during the handshake; the
    /// authoritative per-client decision is made once the claim is known.
    pub fn requests_client_certificates(&self) -> bool {
        self.clients
            .values()
            .any(|c| c.policy == AuthenticationPolicy::VerifyClient)
    }

    /// Re-check the construction invariants.
    pub fn check_invariants(&self) -> Result<(), SnapshotError> {
        for (id, trust) in &self.clients {
            if trust.policy == AuthenticationPolicy::VerifyClient && trust.trusted.is_empty() {
                return Err(SnapshotError::EmptyTrustedSet(id.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons a snapshot is refused before publication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The same client is registered twice.
    #[error("client {0} is registered more than once")]
    DuplicateClient(ClientId),

    /// `verify_client` with nothing to verify against.
    #[error("client {0} requires certificate verification but has no trusted certificates")]
    EmptyTrustedSet(ClientId),

    /// A registered certificate does not decode.
    #[error("certificate #{index} of client {client} is malformed: {reason}")]
    MalformedCertificate {
        /// Owning client.
        client: ClientId,
        /// Position within the client's list.
        index: usize,
        /// Parser message.
        reason: String,
    },
}

struct PendingClient {
    id: ClientId,
    policy: AuthenticationPolicy,
    certs: Vec<CertificateDer<'static>>,
}

/// Collects client entries, then validates and indexes them in one step.
pub struct SnapshotBuilder {
    enforce_validity_period: bool,
    pending: Vec<PendingClient>,
}

impl SnapshotBuilder {
    /// Create an empty builder.
    pub fn new(enforce_validity_period: bool) -> Self {
        Self {
            enforce_validity_period,
            pending: Vec::new(),
        }
    }

    /// Register a client.  Nothing is checked until [`SnapshotBuilder::build`].
    #[must_use]
    pub fn client(
        mut self,
        id: ClientId,
        policy: AuthenticationPolicy,
        certs: Vec<CertificateDer<'static>>,
    ) -> Self {
        self.pending.push(PendingClient { id, policy, certs });
        self
    }

    /// Validate every entry, then build the index.
    ///
    /// Validation finishes for the whole input before any entry is indexed, so
    /// a failure never leaves a partially-built snapshot behind.
    pub fn build(self) -> Result<ConfigurationSnapshot, SnapshotError> {
        let validated = validate_entries(self.pending)?;

        let clients = validated
            .into_iter()
            .map(|(id, policy, certs)| {
                let trust = ClientTrust {
                    policy,
                    trusted: TrustedCertificateSet::from_parsed(certs),
                };
                (id, trust)
            })
            .collect();

        Ok(ConfigurationSnapshot {
            version: 0,
            enforce_validity_period: self.enforce_validity_period,
            clients,
        })
    }

    /// Build without the validation pass (tests exercising reload rejection).
    #[cfg(test)]
    pub(crate) fn build_unchecked(self) -> ConfigurationSnapshot {
        let clients = self
            .pending
            .into_iter()
            .map(|p| {
                let certs = p
                    .certs
                    .into_iter()
                    .filter_map(|der| {
                        CertIdentity::from_der(&der)
                            .ok()
                            .map(|identity| TrustedCertificate { der, identity })
                    })
                    .collect();
                (
                    p.id,
                    ClientTrust {
                        policy: p.policy,
                        trusted: TrustedCertificateSet::from_parsed(certs),
                    },
                )
            })
            .collect();
        ConfigurationSnapshot {
            version: 0,
            enforce_validity_period: self.enforce_validity_period,
            clients,
        }
    }
}

type ValidatedClient = (ClientId, AuthenticationPolicy, Vec<TrustedCertificate>);

fn validate_entries(pending: Vec<PendingClient>) -> Result<Vec<ValidatedClient>, SnapshotError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(pending.len());

    for entry in pending {
        if !seen.insert(entry.id.clone()) {
            return Err(SnapshotError::DuplicateClient(entry.id));
        }
        if entry.policy == AuthenticationPolicy::VerifyClient && entry.certs.is_empty() {
            return Err(SnapshotError::EmptyTrustedSet(entry.id));
        }

        let mut parsed = Vec::with_capacity(entry.certs.len());
        for (index, der) in entry.certs.into_iter().enumerate() {
            match CertIdentity::from_der(&der) {
                Ok(identity) => parsed.push(TrustedCertificate { der, identity }),
                Err(e) => {
                    return Err(SnapshotError::MalformedCertificate {
                        client: entry.id,
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }
        out.push((entry.id, entry.policy, parsed));
    }

    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
