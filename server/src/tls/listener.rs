//! TLS accept loop feeding the gateway router.
//!
//! Per connection:
//!
//! 1. wait for a connection slot (`server.max_connections`)
//! 2. TLS handshake, bounded by `server.handshake_timeout_secs`; the rustls
//!    client verifier rejects malformed certificates here
//! 3. full [`TrustVerifier::verify`] including the registry lookup, before a
//!    single request byte is read; failure drops the connection
//! 4. HTTP/1.1 with upgrades, every request tagged with the connection's
//!    [`PeerIdentity`]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::tls::verifier::{PeerIdentity, PeerRole, TrustVerifier};

/// Everything a connection task needs, shared by all of them.
pub struct Gateway {
    acceptor: TlsAcceptor,
    trust: Arc<TrustVerifier>,
    router: Router,
    slots: Arc<Semaphore>,
    handshake_timeout: Duration,
}

impl Gateway {
    pub fn new(
        tls: rustls::ServerConfig,
        trust: Arc<TrustVerifier>,
        router: Router,
        max_connections: usize,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(Arc::new(tls)),
            trust,
            router,
            slots: Arc::new(Semaphore::new(max_connections)),
            handshake_timeout,
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let gateway = Arc::new(self);
        info!(addr = %listener.local_addr()?, "gateway listening");
        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&gateway.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let gateway = Arc::clone(&gateway);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                gateway.handle(stream, peer, shutdown).await;
                drop(permit);
            });
        }
        info!("gateway stopped accepting connections");
        Ok(())
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        let handshake = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream));
        let tls = match handshake.await {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                debug!(%peer, error = %e, "tls handshake failed");
                return;
            }
            Err(_) => {
                debug!(%peer, "tls handshake timed out");
                return;
            }
        };

        let identity = match tls.get_ref().1.peer_certificates() {
            Some(chain) => match self.trust.verify(chain, &PeerRole::Client).await {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(%peer, error = %e, "client certificate rejected");
                    return;
                }
            },
            None => None,
        };
        match &identity {
            Some(id) => debug!(%peer, owner = %id.owner, "connection authenticated"),
            None => debug!(%peer, "anonymous connection"),
        }

        let router = self.router.clone();
        let service = service_fn(move |mut req: Request<Incoming>| {
            if let Some(id) = &identity {
                req.extensions_mut().insert::<PeerIdentity>(id.clone());
            }
            router.clone().oneshot(req)
        });
        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .with_upgrades();
        tokio::pin!(conn);
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(%peer, error = %e, "connection error");
                }
            }
            () = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.await;
            }
        }
    }
}
