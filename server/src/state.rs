//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::address::AccountAddress;
use crate::cluster::{EventReader, Execer, LeaseReader, LogReader, ManifestSubmitter, ProviderInfo};
use crate::config::{Config, StreamConfig};

/// Shared application state for the gateway.
///
/// Every backend capability is a separate trait object so tests can swap one
/// of them without implementing the rest.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// This provider's account address; the last component of every lease ID.
    pub provider: AccountAddress,
    pub execer: Arc<dyn Execer>,
    pub logs: Arc<dyn LogReader>,
    pub events: Arc<dyn EventReader>,
    pub leases: Arc<dyn LeaseReader>,
    pub manifests: Arc<dyn ManifestSubmitter>,
    pub info: Arc<dyn ProviderInfo>,
    /// Process-wide shutdown token. Each WebSocket session runs under a child
    /// of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build state where a single backend provides every capability.
    pub fn with_backend<B>(
        config: Arc<Config>,
        provider: AccountAddress,
        backend: Arc<B>,
        shutdown: CancellationToken,
    ) -> Self
    where
        B: Execer
            + LogReader
            + EventReader
            + LeaseReader
            + ManifestSubmitter
            + ProviderInfo
            + 'static,
    {
        Self {
            config,
            provider,
            execer: backend.clone(),
            logs: backend.clone(),
            events: backend.clone(),
            leases: backend.clone(),
            manifests: backend.clone(),
            info: backend,
            shutdown,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        self.config.stream
    }
}
