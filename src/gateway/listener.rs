//! Listeners and per-connection peer information.
//!
//! The plain listener is a bare `tokio::net::TcpListener`.  [`TlsListener`]
//! accepts TCP connections on a background task and runs each TLS handshake
//! on its own task with a timeout, so a stalled peer never holds up the
//! accept loop.  Completed handshakes are handed to axum through an mpsc
//! channel.  Connections that fail or time out in the handshake are dropped
//! and never reach a handler.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use rustls::pki_types::CertificateDer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, trace};

use crate::mtls::PresentedChain;

/// Maximum number of completed handshakes waiting for axum to pick them up.
const HANDSHAKE_BACKLOG: usize = 128;

/// What the transport layer knows about a connection.
///
/// Available to handlers as `ConnectInfo<PeerInfo>`.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// Transport security and the presented chain.
    pub chain: PresentedChain,
}

impl PeerInfo {
    /// A peer on a plain TCP connection.
    pub fn plaintext(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            chain: PresentedChain::plaintext(),
        }
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for PeerInfo {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self::plaintext(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for PeerInfo {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        stream.remote_addr().clone()
    }
}

/// HTTPS listener yielding completed TLS streams.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, PeerInfo)>,
    accept_task: JoinHandle<()>,
}

impl TlsListener {
    /// Bind `addr` and start accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        acceptor: TlsAcceptor,
        handshake_timeout: Duration,
    ) -> io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        let (tx, ready) = mpsc::channel(HANDSHAKE_BACKLOG);
        let accept_task = tokio::spawn(accept_loop(tcp, acceptor, handshake_timeout, tx));
        Ok(Self {
            local_addr,
            ready,
            accept_task,
        })
    }

    /// The bound socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = PeerInfo;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept task only ends when aborted by our own Drop.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(PeerInfo::plaintext(self.local_addr))
    }
}

async fn accept_loop(
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    ready: mpsc::Sender<(TlsStream<TcpStream>, PeerInfo)>,
) {
    loop {
        let (stream, remote_addr) = match tcp.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "TLS listener accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await
            {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    debug!(peer = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %remote_addr, timeout = ?handshake_timeout, "TLS handshake timed out");
                    return;
                }
            };

            let certs: Arc<[CertificateDer<'static>]> = tls
                .get_ref()
                .1
                .peer_certificates()
                .map(<[_]>::to_vec)
                .unwrap_or_default()
                .into();
            trace!(peer = %remote_addr, certificates = certs.len(), "TLS handshake complete");

            let peer = PeerInfo {
                remote_addr,
                chain: PresentedChain::tls(certs),
            };
            let _ = ready.send((tls, peer)).await;
        });
    }
}
