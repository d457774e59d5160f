//! Protocol fault model.
//!
//! Every authentication verdict becomes an [`Outcome`]: either the request
//! proceeds to dispatch, or the caller receives a [`Fault`] carrying a
//! hierarchical [`FaultCode`] (`<Actor>.<SubActor>.<Reason>`) and a human
//! message.  Backend dispatch failures are folded into the same shape.

use std::borrow::Cow;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::engine::AuthenticationVerdict;
use crate::identifier::ClientId;
use crate::trust::AuthenticationPolicy;

// ─────────────────────────────────────────────────────────────────────────────
// Fault codes
// ─────────────────────────────────────────────────────────────────────────────

/// Hierarchical, dot-separated error code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FaultCode(Cow<'static, str>);

impl FaultCode {
    /// Client failed TLS authentication (any certificate problem, or plaintext
    /// where TLS is required).
    pub const SSL_AUTH_FAILED: Self = Self::from_static("Server.ClientProxy.SslAuthFailed");
    /// The claimed client is not registered on this server.
    pub const UNKNOWN_CLIENT: Self = Self::from_static("Server.ClientProxy.UnknownClient");
    /// The client claim is missing or does not parse.
    pub const INVALID_CLIENT_IDENTIFIER: Self =
        Self::from_static("Client.ClientProxy.InvalidClientIdentifier");
    /// The backend could not be reached in time.
    pub const NETWORK_ERROR: Self = Self::from_static("Server.ClientProxy.NetworkError");
    /// The backend was reached but the exchange failed.
    pub const SERVICE_FAILED: Self = Self::from_static("Server.ClientProxy.ServiceFailed");

    const fn from_static(code: &'static str) -> Self {
        Self(Cow::Borrowed(code))
    }

    /// Build a code from its dot-separated segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .map(|s| s.as_ref().to_owned())
            .collect::<Vec<_>>()
            .join(".");
        Self(Cow::Owned(joined))
    }

    /// The full code.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First segment: `Server` or `Client`.
    pub fn actor(&self) -> &str {
        self.segments().next().unwrap_or_default()
    }

    /// Dot-separated segments, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Whether this code equals `prefix` or lies beneath it.
    ///
    /// Matching is per segment: `Server.Client` is not a prefix of
    /// `Server.ClientProxy.SslAuthFailed`.
    pub fn is_under(&self, prefix: &str) -> bool {
        match self.0.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }

    /// Faults caused by the request rather than by the server or its peers.
    pub fn is_client_fault(&self) -> bool {
        self.actor() == "Client"
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FaultCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fault and outcome
// ─────────────────────────────────────────────────────────────────────────────

/// A structured fault delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    #[serde(rename = "type")]
    code: FaultCode,
    message: String,
}

impl Fault {
    /// Create a fault.
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Missing or unparseable client claim.
    pub fn invalid_client_identifier(message: impl Into<String>) -> Self {
        Self::new(FaultCode::INVALID_CLIENT_IDENTIFIER, message)
    }

    /// Backend unreachable or timed out.
    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(FaultCode::NETWORK_ERROR, message)
    }

    /// Backend exchange failed after connecting.
    pub fn service_failed(message: impl Into<String>) -> Self {
        Self::new(FaultCode::SERVICE_FAILED, message)
    }

    /// Stable code.
    pub fn code(&self) -> &FaultCode {
        &self.code
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// What happens to a request after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Forward to backend dispatch on behalf of the resolved client.
    Proceed(ClientId, AuthenticationPolicy),
    /// Answer the caller with a fault.
    Fault(Fault),
}

/// Map a verdict to its outcome.  Total and side-effect free.
pub fn to_outcome(verdict: &AuthenticationVerdict) -> Outcome {
    match verdict {
        AuthenticationVerdict::Allowed(allowed) => {
            Outcome::Proceed(allowed.client().clone(), allowed.policy())
        }
        AuthenticationVerdict::Rejected(rejected) => Outcome::Fault(Fault::new(
            rejected.fault_code().clone(),
            rejected.reason().message(),
        )),
    }
}
