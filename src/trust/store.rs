//! Published trust configuration with lock-free reads.
//!
//! Readers call [`TrustStore::current`] once per request and keep the
//! returned `Arc` for the whole request.  [`TrustStore::reload`] replaces the
//! published pointer in a single atomic store; a reader holds either the whole
//! old snapshot or the whole new one.  Writers are serialised, so published
//! versions only ever increase.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::snapshot::{ConfigurationSnapshot, SnapshotError};

/// Shared handle to the published [`ConfigurationSnapshot`].
///
/// Cloning the handle is cheap; all clones observe the same publications.
#[derive(Clone)]
pub struct TrustStore {
    inner: Arc<Inner>,
}

struct Inner {
    published: ArcSwap<ConfigurationSnapshot>,
    /// Held across version allocation and publication.
    writer: Mutex<()>,
}

impl TrustStore {
    /// Publish `initial` as version 1.
    ///
    /// # Errors
    ///
    /// Returns the violated invariant if `initial` is not publishable.
    pub fn new(initial: ConfigurationSnapshot) -> Result<Self, SnapshotError> {
        initial.check_invariants()?;
        let snapshot = initial.with_version(1);
        Ok(Self {
            inner: Arc::new(Inner {
                published: ArcSwap::from_pointee(snapshot),
                writer: Mutex::new(()),
            }),
        })
    }

    /// The latest published snapshot.  O(1), never waits on `reload`.
    pub fn current(&self) -> Arc<ConfigurationSnapshot> {
        self.inner.published.load_full()
    }

    /// Atomically publish `next`, returning the version it was assigned.
    ///
    /// Requests that already hold the previous snapshot keep it.  If `next`
    /// violates an invariant nothing is published.
    pub fn reload(&self, next: ConfigurationSnapshot) -> Result<u64, SnapshotError> {
        if let Err(e) = next.check_invariants() {
            warn!(
                error = %e,
                kept_version = self.inner.published.load().version(),
                "Trust configuration rejected; keeping current snapshot"
            );
            return Err(e);
        }

        let _writer = self.inner.writer.lock();
        let version = self.inner.published.load().version() + 1;
        let clients = next.len();
        let enforce = next.enforce_validity_period();
        let previous = self
            .inner
            .published
            .swap(Arc::new(next.with_version(version)));

        info!(
            from_version = previous.version(),
            to_version = version,
            clients,
            enforce_validity_period = enforce,
            "Trust configuration published"
        );
        Ok(version)
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.inner.published.load();
        f.debug_struct("TrustStore")
            .field("version", &current.version())
            .field("clients", &current.len())
            .finish_non_exhaustive()
    }
}
