//! Client error types.

use leasegw::protocol::FrameError;
use leasegw::tls::{TlsSetupError, TrustError};

/// Errors returned by [`crate::ProviderClient`] methods.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("tls setup: {0}")]
    Tls(#[from] TlsSetupError),
    /// The provider's certificate failed the full registry check after the
    /// handshake.
    #[error("provider certificate rejected: {0}")]
    Trust(#[from] TrustError),
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] hyper::Error),
    /// The provider answered with a non-2xx status.
    #[error("provider returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The stream ended with a close code other than 1000.
    #[error("stream closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },
    /// No ping from the provider within the keepalive window.
    #[error("provider stopped sending keepalives")]
    KeepaliveTimeout,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}

/// How a lease shell ended, when it did not end with an exit code.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The provider reported an error it is willing to share, e.g. an
    /// unknown service or a pod index out of range.
    #[error("{0}")]
    Remote(String),
    /// The provider hit an internal error; details stay in its logs.
    #[error("the provider encountered an unknown error")]
    ProviderFailure,
    #[error("provider sent a malformed frame: {0}")]
    Protocol(#[from] FrameError),
    #[error("connection closed before the command finished")]
    Closed,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("local i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ShellError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ShellError::Client(ClientError::WebSocket(e))
    }
}
