//! Gateway server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use super::dispatch::{Dispatcher, ForwardingDispatcher};
use super::listener::{PeerInfo, TlsListener};
use super::router::{AppState, create_router};
use crate::config::Config;
use crate::config_reload::ConfigWatcher;
use crate::mtls::cert_manager::build_server_config;
use crate::trust::TrustStore;
use crate::{Error, Result};

/// Security-server gateway
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Config file, watched for trust changes when set
    config_path: Option<PathBuf>,
    /// Published trust configuration
    store: TrustStore,
    /// Backend dispatch
    dispatcher: Arc<dyn Dispatcher>,
}

impl Gateway {
    /// Create a gateway forwarding to the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the trust configuration does not compile or the
    /// backend client cannot be built.
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self> {
        let dispatcher = Arc::new(ForwardingDispatcher::new(&config.backend)?);
        Self::with_dispatcher(config, config_path, dispatcher)
    }

    /// Create a gateway with a custom dispatcher.
    pub fn with_dispatcher(
        config: Config,
        config_path: Option<PathBuf>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self> {
        let store = TrustStore::new(config.trust_snapshot()?)?;
        Ok(Self {
            config,
            config_path,
            store,
            dispatcher,
        })
    }

    /// Handle to the published trust configuration.
    pub fn store(&self) -> TrustStore {
        self.store.clone()
    }

    /// Bind the configured listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if no listener is enabled, an address cannot be bound,
    /// or the TLS material cannot be loaded.
    pub async fn bind(self) -> Result<BoundGateway> {
        let http = match self.config.server.http_addr()? {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let https = match (self.config.server.https_addr()?, &self.config.server.tls) {
            (Some(addr), Some(tls)) => {
                let server_config = build_server_config(tls, self.store.clone())?;
                let acceptor = TlsAcceptor::from(Arc::new(server_config));
                Some(
                    TlsListener::bind(addr, acceptor, self.config.server.handshake_timeout())
                        .await?,
                )
            }
            _ => None,
        };

        if http.is_none() && https.is_none() {
            return Err(Error::Config(
                "No listener enabled (set server.http_port or server.tls)".to_string(),
            ));
        }

        let state = Arc::new(AppState {
            store: self.store.clone(),
            dispatcher: self.dispatcher,
        });

        Ok(BoundGateway {
            router: create_router(state),
            http,
            https,
            config: self.config,
            config_path: self.config_path,
            store: self.store,
        })
    }

    /// Bind and serve until Ctrl+C / SIGTERM.
    pub async fn run(self) -> Result<()> {
        let bound = self.bind().await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(shutdown_signal(signal_tx));
        bound.serve(shutdown_tx).await
    }
}

/// A gateway with its listeners bound, ready to serve.
pub struct BoundGateway {
    router: Router,
    http: Option<TcpListener>,
    https: Option<TlsListener>,
    config: Config,
    config_path: Option<PathBuf>,
    store: TrustStore,
}

impl BoundGateway {
    /// Address of the plain HTTP listener.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Address of the HTTPS listener.
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().map(TlsListener::socket_addr)
    }

    /// Serve until a message arrives on `shutdown_tx`.
    pub async fn serve(self, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
        info!("============================================================");
        info!("SECURITY SERVER GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        if let Some(addr) = self.http_addr() {
            info!(%addr, "HTTP listening");
        }
        if let Some(addr) = self.https_addr() {
            info!(%addr, "HTTPS listening");
        }
        let snapshot = self.store.current();
        info!(
            clients = snapshot.len(),
            enforce_validity_period = snapshot.enforce_validity_period(),
            backend = %self.config.backend.url,
            "Trust configuration loaded"
        );
        if !snapshot.enforce_validity_period() {
            warn!("Certificate validity period NOT enforced - expired trusted certificates are accepted");
        }
        info!("============================================================");

        let Self {
            router,
            http,
            https,
            config,
            config_path,
            store,
        } = self;
        let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);

        let _watcher = config_path.and_then(|path| {
            match ConfigWatcher::start(path, store, config, shutdown_tx.subscribe()) {
                Ok(w) => {
                    info!("Trust configuration hot-reload enabled");
                    Some(w)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to start config watcher, hot-reload disabled");
                    None
                }
            }
        });

        let http_router = router.clone();
        let http_shutdown = shutdown_tx.subscribe();
        let http = async move {
            match http {
                Some(listener) => {
                    axum::serve(
                        listener,
                        http_router.into_make_service_with_connect_info::<PeerInfo>(),
                    )
                    .with_graceful_shutdown(wait_for(http_shutdown))
                    .await
                }
                None => Ok(()),
            }
        };

        let https_shutdown = shutdown_tx.subscribe();
        let https = async move {
            match https {
                Some(listener) => {
                    axum::serve(
                        listener,
                        router.into_make_service_with_connect_info::<PeerInfo>(),
                    )
                    .with_graceful_shutdown(wait_for(https_shutdown))
                    .await
                }
                None => Ok(()),
            }
        };

        let serving = async { tokio::try_join!(http, https) };
        let mut drain_rx = shutdown_tx.subscribe();
        let drain_deadline = async move {
            let _ = drain_rx.recv().await;
            tokio::time::sleep(shutdown_timeout).await;
        };

        tokio::select! {
            result = serving => {
                result.map_err(|e| Error::Internal(e.to_string()))?;
            }
            () = drain_deadline => {
                warn!(
                    timeout_secs = shutdown_timeout.as_secs(),
                    "Shutdown timeout elapsed with connections still open"
                );
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}

async fn wait_for(mut shutdown_rx: broadcast::Receiver<()>) {
    let _ = shutdown_rx.recv().await;
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
