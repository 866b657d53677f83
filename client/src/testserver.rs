//! In-process gateway over real TLS for end-to-end tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use leasegw::address::AccountAddress;
use leasegw::cluster::local::LocalCluster;
use leasegw::config::{Config, LocalConfig, LocalLeaseConfig, LocalServiceConfig};
use leasegw::lease::LeaseId;
use leasegw::testutil::{self, TestCert};
use leasegw::tls::{server_config, TrustVerifier};
use leasegw::{routes, AppState, Gateway};

use crate::client::ProviderClient;

pub const DSEQ: u64 = 42;

pub struct TestGateway {
    pub port: u16,
    pub provider: TestCert,
    pub tenant: TestCert,
    pub trust: Arc<TrustVerifier>,
    shutdown: CancellationToken,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn service(name: &str, log_files: Vec<PathBuf>) -> LocalServiceConfig {
    LocalServiceConfig {
        name: name.to_string(),
        replicas: 2,
        running: true,
        working_dir: "/".to_string(),
        log_files,
        uris: Vec::new(),
        global: true,
    }
}

impl TestGateway {
    /// Gateway serving one lease (`DSEQ`/1/1) owned by `tenant`.
    pub async fn start(services: Vec<LocalServiceConfig>) -> Self {
        let provider = testutil::owner_cert(9, &["localhost"]);
        let tenant = testutil::owner_cert(1, &[]);
        let registry = testutil::registry_with(&[&provider, &tenant]);
        let trust = Arc::new(TrustVerifier::new(registry, "akash"));

        let local = LocalConfig {
            leases: vec![LocalLeaseConfig {
                owner: tenant.owner.to_string(),
                dseq: DSEQ,
                gseq: 1,
                oseq: 1,
                services,
            }],
        };
        let mut config = Config::default();
        config.server.provider = provider.owner.to_string();
        let backend =
            Arc::new(LocalCluster::from_config(provider.owner.clone(), &local, "akash").unwrap());
        let shutdown = CancellationToken::new();
        let state = AppState::with_backend(
            Arc::new(config),
            provider.owner.clone(),
            backend,
            shutdown.clone(),
        );
        let tls = server_config(provider.identity(), Arc::clone(&trust), true).unwrap();
        let gateway = Gateway::new(
            tls,
            Arc::clone(&trust),
            routes::router(state),
            16,
            Duration::from_secs(5),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(gateway.serve(listener, shutdown.clone()));

        Self {
            port,
            provider,
            tenant,
            trust,
            shutdown,
        }
    }

    pub fn client(&self) -> ProviderClient {
        self.client_for(Some(self.provider.owner.clone()))
    }

    pub fn client_for(&self, target: Option<AccountAddress>) -> ProviderClient {
        ProviderClient::new(
            format!("localhost:{}", self.port),
            self.tenant.identity(),
            Arc::clone(&self.trust),
            target,
        )
        .unwrap()
    }

    pub fn lease(&self) -> LeaseId {
        LeaseId {
            owner: self.tenant.owner.clone(),
            dseq: DSEQ,
            gseq: 1,
            oseq: 1,
            provider: self.provider.owner.clone(),
        }
    }
}

pub type PipeSocket = WebSocketStream<DuplexStream>;

/// Client and server ends of a WebSocket over an in-memory pipe.
pub async fn socket_pair() -> (PipeSocket, PipeSocket) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
    (client, server)
}

/// A socket pair whose server end has already sent `messages`. Keep the
/// server end alive for as long as the client should see an open socket.
pub async fn scripted(messages: Vec<Message>) -> (PipeSocket, PipeSocket) {
    let (client, mut server) = socket_pair().await;
    for message in messages {
        server.send(message).await.unwrap();
    }
    (client, server)
}
