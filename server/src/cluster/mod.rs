//! Execution and observation backends.
//!
//! The gateway never talks to a container platform directly. Each capability
//! it needs is a narrow trait, injected as `Arc<dyn _>` through
//! [`crate::state::AppState`]:
//!
//! | Trait               | Used by                                  |
//! |---------------------|------------------------------------------|
//! | [`Execer`]          | shell WebSocket                          |
//! | [`LogReader`]       | log WebSocket                            |
//! | [`EventReader`]     | event WebSocket                          |
//! | [`LeaseReader`]     | existence checks, lease/service status   |
//! | [`ManifestSubmitter`] | manifest upload                        |
//! | [`ProviderInfo`]    | public status and group validation       |
//!
//! [`local::LocalCluster`] implements all of them against the host it runs on.

pub mod local;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::lease::{DeploymentId, LeaseId};
use crate::protocol::{
    GroupSpec, LeaseEvent, LeaseStatus, Manifest, ProviderStatus, ServiceStatus, TerminalSize,
    ValidateResult,
};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("lease not found")]
    LeaseNotFound,
    #[error("deployment not found")]
    DeploymentNotFound,
    #[error("no lease for deployment")]
    NoLeaseForDeployment,
    #[error("deployment is not yet running")]
    DeploymentNotRunning,
    #[error("no service exists with that name")]
    NoServiceWithName,
    #[error("service with that name is not running")]
    ServiceNotRunning,
    #[error("pod index out of range")]
    PodIndexOutOfRange,
    #[error("lease has no global services")]
    NoGlobalServices,
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("invalid group spec: {0}")]
    InvalidGroupSpec(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl ClusterError {
    /// Errors whose text describes the tenant's own request and may be sent
    /// back in a shell result. Everything else stays in the server log.
    pub fn is_client_safe(&self) -> bool {
        matches!(
            self,
            ClusterError::DeploymentNotRunning
                | ClusterError::NoServiceWithName
                | ClusterError::ServiceNotRunning
                | ClusterError::PodIndexOutOfRange
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClusterError::LeaseNotFound
                | ClusterError::DeploymentNotFound
                | ClusterError::NoLeaseForDeployment
                | ClusterError::NoServiceWithName
        )
    }
}

/// A remote command to run inside one pod of a lease's service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub lease: LeaseId,
    pub service: String,
    pub pod_index: u32,
    pub cmd: Vec<String>,
    pub tty: bool,
}

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Streams wired to the remote process.
pub struct ExecIo {
    /// `None` when the caller did not attach stdin.
    pub stdin: Option<BoxReader>,
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
    /// Present only for TTY sessions.
    pub resize: Option<TerminalSizeQueue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
}

/// Latest-wins queue of terminal sizes.
///
/// The sender side overwrites any size the exec backend has not picked up
/// yet, so a burst of resizes collapses into the last one.
#[derive(Debug, Clone)]
pub struct TerminalSizeQueue {
    rx: watch::Receiver<Option<TerminalSize>>,
}

#[derive(Debug)]
pub struct TerminalSizeSender {
    tx: watch::Sender<Option<TerminalSize>>,
}

impl TerminalSizeQueue {
    pub fn channel() -> (TerminalSizeSender, TerminalSizeQueue) {
        let (tx, rx) = watch::channel(None);
        (TerminalSizeSender { tx }, TerminalSizeQueue { rx })
    }

    /// Wait for the next size. Returns `None` once the sender is gone.
    pub async fn next(&mut self) -> Option<TerminalSize> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(size) = *self.rx.borrow_and_update() {
                return Some(size);
            }
        }
    }
}

impl TerminalSizeSender {
    pub fn send(&self, size: TerminalSize) {
        self.tx.send_replace(Some(size));
    }
}

#[async_trait]
pub trait Execer: Send + Sync {
    /// Run `req` to completion. Cancelling `cancel` must terminate the remote
    /// process and return promptly.
    async fn exec(
        &self,
        req: ExecRequest,
        io: ExecIo,
        cancel: CancellationToken,
    ) -> Result<ExecResult, ClusterError>;
}

/// One named line source. Dropping it closes the underlying stream.
pub struct LogSource {
    pub name: String,
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub lease: LeaseId,
    /// Empty means every service of the lease.
    pub services: Vec<String>,
    pub follow: bool,
    /// `None` means the whole history.
    pub tail: Option<u64>,
}

#[async_trait]
pub trait LogReader: Send + Sync {
    async fn logs(
        &self,
        req: LogRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<LogSource>, ClusterError>;
}

pub type EventStream = BoxStream<'static, LeaseEvent>;

#[async_trait]
pub trait EventReader: Send + Sync {
    /// `Ok(None)` when the lease is unknown to the platform.
    async fn events(
        &self,
        lease: &LeaseId,
        services: &[String],
        follow: bool,
    ) -> Result<Option<EventStream>, ClusterError>;
}

#[async_trait]
pub trait LeaseReader: Send + Sync {
    async fn lease_exists(&self, lease: &LeaseId) -> Result<bool, ClusterError>;
    async fn deployment_exists(&self, deployment: &DeploymentId) -> Result<bool, ClusterError>;
    async fn lease_status(&self, lease: &LeaseId) -> Result<LeaseStatus, ClusterError>;
    async fn service_status(
        &self,
        lease: &LeaseId,
        service: &str,
    ) -> Result<ServiceStatus, ClusterError>;
}

#[async_trait]
pub trait ManifestSubmitter: Send + Sync {
    async fn submit(&self, deployment: &DeploymentId, manifest: Manifest)
        -> Result<(), ClusterError>;
}

#[async_trait]
pub trait ProviderInfo: Send + Sync {
    async fn status(&self) -> Result<ProviderStatus, ClusterError>;
    async fn validate(&self, spec: &GroupSpec) -> Result<ValidateResult, ClusterError>;
}
