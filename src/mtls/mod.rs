//! Client certificate handling.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (HandshakeVerifier: request, never require, a client cert)
//!   → PresentedChain captured per connection
//!   → X-Road-Client claim read from the request
//!   → chain::validate against that client's TrustedCertificateSet
//! ```
//!
//! # Modules
//!
//! - [`identity`] — X.509 certificate field extraction (`CertIdentity`)
//! - [`chain`] — presented-chain validation (`ChainVerdict`)
//! - [`verifier`] — the rustls handshake verifier
//! - [`cert_manager`] — rustls config building and certificate generation CLI helpers

pub mod cert_manager;
pub mod chain;
pub mod identity;
pub mod verifier;

pub use cert_manager::{
    CaParams, CertGenerator, GeneratedCert, LeafCertParams, Validity, build_server_config,
    load_certs, load_private_key,
};
pub use chain::{
    ChainVerdict, LapseKind, PresentedChain, TransportSecurity, ValidityLapse, validate,
    validate_at,
};
pub use identity::CertIdentity;
pub use verifier::HandshakeVerifier;
