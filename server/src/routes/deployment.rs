//! Deployment-scoped endpoints.

use axum::{body::Bytes, extract::State, Extension};
use tracing::info;

use crate::error::GatewayError;
use crate::lease::DeploymentId;
use crate::protocol::Manifest;
use crate::state::AppState;

/// `PUT /deployment/{dseq}/manifest`: hand the workload to the backend.
///
/// A body that does not decode, or a manifest that fails validation, is
/// `422`. A deployment without a lease on this provider is `404`.
pub async fn submit_manifest(
    State(state): State<AppState>,
    Extension(deployment): Extension<DeploymentId>,
    body: Bytes,
) -> Result<(), GatewayError> {
    let manifest: Manifest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Unprocessable(e.to_string()))?;
    manifest
        .validate()
        .map_err(|e| GatewayError::Unprocessable(format!("invalid manifest: {e}")))?;
    let groups = manifest.0.len();
    state.manifests.submit(&deployment, manifest).await?;
    info!(%deployment, groups, "manifest submitted");
    Ok(())
}
