//! Trust configuration: per-client policy and certificates, published as
//! immutable snapshots.
//!
//! - [`snapshot`] — [`ConfigurationSnapshot`] and its validating builder
//! - [`store`] — [`TrustStore`], the atomically swapped published snapshot

pub mod snapshot;
pub mod store;

pub use snapshot::{
    AuthenticationPolicy, ClientTrust, ConfigurationSnapshot, SnapshotBuilder, SnapshotError,
    TrustedCertificate, TrustedCertificateSet,
};
pub use store::TrustStore;
