//! Trust configuration hot-reload.
//!
//! Watches the config file, re-runs the full load + validation pass on every
//! change and publishes the result through [`TrustStore::reload`].  A file
//! that fails to parse, references unreadable certificates or violates a
//! snapshot invariant is reported and ignored; the published snapshot stays.
//!
//! # Limitations
//!
//! Only the `trust` section is applied live.  Listener, TLS and backend
//! changes are detected and logged at `WARN`; they take effect on restart.
//! Edits to certificate files alone do not trigger a reload; touch the
//! config file afterwards.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics;
use crate::trust::TrustStore;
use crate::{Error, Result};

/// What a single reload attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadResult {
    /// A new snapshot was published under this version.
    Published(u64),
    /// The file could not be loaded; nothing changed.
    LoadFailed,
    /// The file loaded but the trust section was refused; nothing changed.
    Rejected,
}

impl ReloadResult {
    /// Metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published(_) => "published",
            Self::LoadFailed => "load_failed",
            Self::Rejected => "rejected",
        }
    }
}

/// Load `config_path`, compile its trust section and publish it to `store`.
///
/// `running` is the configuration the process started with; sections that
/// cannot change live are compared against it and only reported.
pub fn reload_once(config_path: &Path, store: &TrustStore, running: &Config) -> ReloadResult {
    let result = try_reload(config_path, store, running);
    metrics::record_reload(result);
    result
}

fn try_reload(config_path: &Path, store: &TrustStore, running: &Config) -> ReloadResult {
    let new_config = match Config::load(Some(config_path)) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Config reload: failed to parse config file, keeping current trust configuration");
            return ReloadResult::LoadFailed;
        }
    };

    warn_on_restart_only_changes(running, &new_config);

    let snapshot = match new_config.trust_snapshot() {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Config reload: trust configuration invalid, keeping current snapshot");
            return match e {
                Error::Snapshot(_) => ReloadResult::Rejected,
                _ => ReloadResult::LoadFailed,
            };
        }
    };

    match store.reload(snapshot) {
        Ok(version) => {
            info!(version, "Config reload: complete");
            ReloadResult::Published(version)
        }
        Err(_) => ReloadResult::Rejected,
    }
}

/// JSON comparison stands in for `PartialEq` on the nested config types.
fn section_changed<T: serde::Serialize>(old: &T, new: &T) -> bool {
    serde_json::to_string(old).ok() != serde_json::to_string(new).ok()
}

fn warn_on_restart_only_changes(old: &Config, new: &Config) {
    if section_changed(&old.server, &new.server) {
        warn!("Config reload: server section changed; restart required to apply it");
    }
    if section_changed(&old.backend, &new.backend) {
        warn!("Config reload: backend section changed; restart required to apply it");
    }
}

// ============================================================================
// File watcher
// ============================================================================

/// File watcher that republishes trust configuration on config file changes.
///
/// Holds the underlying `notify` watcher alive for the lifetime of the struct.
pub struct ConfigWatcher {
    /// Kept alive to prevent the OS watcher from being dropped.
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigWatcher {
    /// Start watching `config_path` for changes.
    ///
    /// Spawns a debounced background task that calls [`reload_once`] after
    /// each burst of file events.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be created.
    pub fn start(
        config_path: PathBuf,
        store: TrustStore,
        running: Config,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(32);
        let watcher = Self::create_notify_watcher(event_tx, &config_path)?;

        Self::spawn_reload_task(config_path, store, running, event_rx, shutdown_rx);

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }

    /// Create the low-level `notify` watcher.
    fn create_notify_watcher(
        event_tx: mpsc::Sender<()>,
        config_path: &Path,
    ) -> Result<RecommendedWatcher> {
        let watch_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let path_for_closure = config_path.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant =
                    result.as_ref().is_ok_and(|e| is_config_event(e, &path_for_closure));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Internal(format!("Failed to create config watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Internal(format!("Failed to watch config path: {e}")))?;

        Ok(watcher)
    }

    /// Spawn the debounced reload task.
    fn spawn_reload_task(
        config_path: PathBuf,
        store: TrustStore,
        running: Config,
        mut event_rx: mpsc::Receiver<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            let mut last_event: Option<Instant> = None;
            let mut pending = false;
            let mut ticker = tokio::time::interval(Duration::from_millis(100));

            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        last_event = Some(Instant::now());
                        pending = true;
                    }
                    _ = ticker.tick() => {
                        if pending && last_event.is_some_and(|t| t.elapsed() >= DEBOUNCE) {
                            pending = false;
                            last_event = None;
                            let result = reload_once(&config_path, &store, &running);
                            debug!(result = result.as_str(), "Config reload attempt finished");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });
    }
}

/// Returns `true` for create/modify events on the watched config file.
fn is_config_event(event: &Event, config_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.ends_with(config_path) || p == config_path)
}
