//! Security-server client gateway
//!
//! Decides, per connecting client, whether a request may pass to the backend
//! services and answers with a structured protocol fault when it may not.
//!
//! # Features
//!
//! - **Per-client policy**: `none`, `verify_none` or `verify_client`
//! - **Closed trusted sets**: a client certificate must equal, or be issued
//!   by, one of the certificates registered for that client
//! - **Validity-period policy**: expired trusted certificates rejected or
//!   accepted with an operator warning
//! - **Atomic hot-reload**: trust configuration swapped without blocking
//!   requests in flight
//! - **Hierarchical faults**: `Server.ClientProxy.SslAuthFailed` and friends
//!
//! # Request flow
//!
//! ```text
//! connection → PeerInfo (transport + chain)
//!            → X-Road-Client claim
//!            → engine::decide(claim, chain, store.current())
//!            → fault::to_outcome → dispatch | fault
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod config_reload;
pub mod engine;
pub mod error;
pub mod fault;
pub mod gateway;
pub mod identifier;
pub mod metrics;
pub mod mtls;
pub mod trust;

pub use engine::{AuthenticationVerdict, RejectionReason, decide, decide_at};
pub use error::{Error, Result};
pub use fault::{Fault, FaultCode, Outcome, to_outcome};
pub use identifier::ClientId;
pub use trust::{AuthenticationPolicy, ConfigurationSnapshot, TrustStore};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    result.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
