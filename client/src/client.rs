//! Mutual-TLS client for a provider's gateway.
//!
//! Every request dials a fresh connection. The provider certificate is
//! checked twice: structurally inside the rustls handshake, then against the
//! certificate registry before the first request byte is written.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::Url;

use leasegw::address::AccountAddress;
use leasegw::lease::LeaseId;
use leasegw::protocol::{
    GroupSpec, LeaseStatus, Manifest, ProviderStatus, ServiceStatus, ValidateResult, PONG_WAIT,
};
use leasegw::tls::{client_config, server_name, PeerRole, TlsIdentity, TrustVerifier};

use crate::error::ClientError;

pub type WsStream = WebSocketStream<TlsStream<TcpStream>>;

/// Client for one provider's gateway.
#[derive(Clone)]
pub struct ProviderClient {
    host: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    trust: Arc<TrustVerifier>,
    target: Option<AccountAddress>,
    keepalive: Duration,
}

impl ProviderClient {
    /// `host` is `host:port`. `target`, when known, is the provider's account
    /// address; a certificate for any other address is treated as hijacked.
    pub fn new(
        host: impl Into<String>,
        identity: TlsIdentity,
        trust: Arc<TrustVerifier>,
        target: Option<AccountAddress>,
    ) -> Result<Self, ClientError> {
        let host = host.into();
        let server_name = server_name(&host)?;
        let config = client_config(identity, Arc::clone(&trust), target.clone())?;
        Ok(Self {
            host,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
            trust,
            target,
            keepalive: PONG_WAIT,
        })
    }

    /// How long a log or event stream may go without a provider ping.
    ///
    /// Must be longer than the provider's `stream.ping_period`; the default
    /// matches the provider's default `pong_wait`.
    #[must_use]
    pub fn with_keepalive(mut self, window: Duration) -> Self {
        self.keepalive = window;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    async fn dial(&self) -> Result<TlsStream<TcpStream>, ClientError> {
        let tcp = TcpStream::connect(self.host.as_str()).await?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        let chain = tls.get_ref().1.peer_certificates().unwrap_or_default();
        let role = PeerRole::Server {
            server_name: self.server_name.clone(),
            target: self.target.clone(),
        };
        let provider = self.trust.verify(chain, &role).await?;
        debug!(host = %self.host, provider = %provider.owner, "provider verified");
        Ok(tls)
    }

    /// Absolute URL for `path` on this provider, for adding query pairs.
    pub(crate) fn url(&self, scheme: &str, path: &str) -> Result<Url, ClientError> {
        Url::parse(&format!("{scheme}://{}{path}", self.host))
            .map_err(|e| ClientError::Protocol(format!("invalid provider URL: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, ClientError> {
        let tls = self.dial().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "provider connection ended");
            }
        });

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, self.host.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let resp = sender.send_request(req).await?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        if status.is_success() {
            Ok(body)
        } else {
            Err(ClientError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            })
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let body = self.request(Method::GET, path, None).await?;
        decode(&body)
    }

    /// `GET /status`
    pub async fn status(&self) -> Result<ProviderStatus, ClientError> {
        self.get_json("/status").await
    }

    /// `GET /validate` with the group spec as body.
    pub async fn validate(&self, spec: &GroupSpec) -> Result<ValidateResult, ClientError> {
        let body = self
            .request(Method::GET, "/validate", Some(encode(spec)?))
            .await?;
        decode(&body)
    }

    /// `PUT /deployment/{dseq}/manifest`
    pub async fn submit_manifest(&self, dseq: u64, manifest: &Manifest) -> Result<(), ClientError> {
        let path = format!("/deployment/{dseq}/manifest");
        self.request(Method::PUT, &path, Some(encode(manifest)?))
            .await?;
        Ok(())
    }

    /// `GET /lease/{dseq}/{gseq}/{oseq}/status`
    pub async fn lease_status(&self, lease: &LeaseId) -> Result<LeaseStatus, ClientError> {
        self.get_json(&format!("/lease/{}/status", lease.route_path()))
            .await
    }

    /// `GET /lease/{dseq}/{gseq}/{oseq}/service/{service}/status`
    pub async fn service_status(
        &self,
        lease: &LeaseId,
        service: &str,
    ) -> Result<ServiceStatus, ClientError> {
        let mut url = self.url("https", &format!("/lease/{}/service", lease.route_path()))?;
        url.path_segments_mut()
            .map_err(|()| ClientError::Protocol("provider URL cannot carry a path".to_string()))?
            .push(service)
            .push("status");
        self.get_json(url.path()).await
    }

    /// Open a WebSocket on `url` (scheme `wss`). A refused upgrade comes back
    /// as [`ClientError::Status`] carrying the provider's error message.
    pub(crate) async fn websocket(&self, url: &Url) -> Result<WsStream, ClientError> {
        let tls = self.dial().await?;
        match tokio_tungstenite::client_async(url.as_str(), tls).await {
            Ok((ws, _)) => Ok(ws),
            Err(tungstenite::Error::Http(resp)) => Err(ClientError::Status {
                status: resp.status().as_u16(),
                message: error_message(resp.body().as_deref().unwrap_or_default()),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClientError> {
    serde_json::to_vec(value).map_err(|e| ClientError::Protocol(e.to_string()))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ClientError> {
    serde_json::from_slice(body)
        .map_err(|e| ClientError::Protocol(format!("invalid JSON from provider: {e}")))
}

/// The `error` field of a JSON error body, or the body itself.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}
