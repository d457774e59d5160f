//! Authentication decision engine.
//!
//! [`decide`] combines the policy registered for the claimed client with the
//! chain the peer presented and produces an [`AuthenticationVerdict`].  It is
//! pure: the only inputs are its arguments (and, for [`decide`], the system
//! clock), and it has no failure path of its own.  Every refusal is a
//! [`Rejected`] verdict carrying exactly one [`FaultCode`].

use rustls::pki_types::UnixTime;

use crate::fault::FaultCode;
use crate::identifier::ClientId;
use crate::mtls::chain::{self, ChainVerdict, PresentedChain, TransportSecurity, ValidityLapse};
use crate::trust::{AuthenticationPolicy, ConfigurationSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// Verdict types
// ─────────────────────────────────────────────────────────────────────────────

/// Closed set of reasons a client is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// No policy is registered for the claimed client.
    UnknownClient,
    /// The presented chain matches nothing in the client's trusted set.
    CertificateNotTrusted,
    /// Trusted, but outside its validity period while enforcement is on.
    CertificateExpired,
    /// A presented certificate does not decode.
    MalformedChain,
    /// The policy requires TLS and the client connected in plaintext.
    TlsRequired,
}

impl RejectionReason {
    /// The fault code reported to the caller.
    pub fn fault_code(self) -> FaultCode {
        match self {
            Self::UnknownClient => FaultCode::UNKNOWN_CLIENT,
            Self::CertificateNotTrusted
            | Self::CertificateExpired
            | Self::MalformedChain
            | Self::TlsRequired => FaultCode::SSL_AUTH_FAILED,
        }
    }

    /// Human-readable explanation delivered with the fault.
    pub fn message(self) -> &'static str {
        match self {
            Self::UnknownClient => "Client is not registered on this security server",
            Self::CertificateNotTrusted => {
                "Client certificate is not trusted for the claimed client"
            }
            Self::CertificateExpired => "Client certificate is outside its validity period",
            Self::MalformedChain => "Client certificate chain could not be decoded",
            Self::TlsRequired => "Client requires a TLS connection but connected over plain HTTP",
        }
    }

    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownClient => "unknown_client",
            Self::CertificateNotTrusted => "certificate_not_trusted",
            Self::CertificateExpired => "certificate_expired",
            Self::MalformedChain => "malformed_chain",
            Self::TlsRequired => "tls_required",
        }
    }
}

/// A client that passed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowed {
    client: ClientId,
    policy: AuthenticationPolicy,
    warning: Option<ValidityLapse>,
}

impl Allowed {
    /// The resolved client.
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// The policy that was satisfied.
    pub fn policy(&self) -> AuthenticationPolicy {
        self.policy
    }

    /// Set when a trusted certificate outside its validity period was
    /// accepted because enforcement is off.  Operator-facing only.
    pub fn warning(&self) -> Option<&ValidityLapse> {
        self.warning.as_ref()
    }
}

/// A client that failed authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    reason: RejectionReason,
    code: FaultCode,
}

impl Rejected {
    fn new(reason: RejectionReason) -> Self {
        Self {
            reason,
            code: reason.fault_code(),
        }
    }

    /// Why the client was refused.
    pub fn reason(&self) -> RejectionReason {
        self.reason
    }

    /// The fault code paired with the reason.
    pub fn fault_code(&self) -> &FaultCode {
        &self.code
    }
}

/// Result of [`decide`].  Only this module constructs one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationVerdict {
    /// Authentication succeeded.
    Allowed(Allowed),
    /// Authentication failed.
    Rejected(Rejected),
}

impl AuthenticationVerdict {
    fn allowed(client: &ClientId, policy: AuthenticationPolicy) -> Self {
        Self::Allowed(Allowed {
            client: client.clone(),
            policy,
            warning: None,
        })
    }

    fn rejected(reason: RejectionReason) -> Self {
        Self::Rejected(Rejected::new(reason))
    }

    /// Returns `true` for [`AuthenticationVerdict::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    /// `"allowed"` or `"rejected"`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allowed(_) => "allowed",
            Self::Rejected(_) => "rejected",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────────────────────

/// Decide whether `claim` may proceed, reading the system clock once.
pub fn decide(
    claim: &ClientId,
    chain: &PresentedChain,
    snapshot: &ConfigurationSnapshot,
) -> AuthenticationVerdict {
    decide_at(claim, chain, snapshot, UnixTime::now())
}

/// Decide whether `claim` may proceed at time `now`.
pub fn decide_at(
    claim: &ClientId,
    chain: &PresentedChain,
    snapshot: &ConfigurationSnapshot,
    now: UnixTime,
) -> AuthenticationVerdict {
    let Some(policy) = snapshot.policy_for(claim) else {
        return AuthenticationVerdict::rejected(RejectionReason::UnknownClient);
    };

    if policy.requires_tls() && chain.transport() == TransportSecurity::Plaintext {
        return AuthenticationVerdict::rejected(RejectionReason::TlsRequired);
    }

    match policy {
        AuthenticationPolicy::None | AuthenticationPolicy::VerifyNone => {
            AuthenticationVerdict::allowed(claim, policy)
        }
        AuthenticationPolicy::VerifyClient => verify_client(claim, chain, snapshot, now),
    }
}

fn verify_client(
    claim: &ClientId,
    chain: &PresentedChain,
    snapshot: &ConfigurationSnapshot,
    now: UnixTime,
) -> AuthenticationVerdict {
    let Some(trusted) = snapshot.trusted_certs_for(claim) else {
        // policy_for and trusted_certs_for read the same entry
        return AuthenticationVerdict::rejected(RejectionReason::UnknownClient);
    };
    let enforce = snapshot.enforce_validity_period();

    match chain::validate_at(chain, trusted, enforce, now) {
        ChainVerdict::Trusted => {
            AuthenticationVerdict::allowed(claim, AuthenticationPolicy::VerifyClient)
        }
        ChainVerdict::TrustedButExpired(_) if enforce => {
            AuthenticationVerdict::rejected(RejectionReason::CertificateExpired)
        }
        ChainVerdict::TrustedButExpired(lapse) => AuthenticationVerdict::Allowed(Allowed {
            client: claim.clone(),
            policy: AuthenticationPolicy::VerifyClient,
            warning: Some(lapse),
        }),
        ChainVerdict::Untrusted => {
            AuthenticationVerdict::rejected(RejectionReason::CertificateNotTrusted)
        }
        ChainVerdict::Malformed => AuthenticationVerdict::rejected(RejectionReason::MalformedChain),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
