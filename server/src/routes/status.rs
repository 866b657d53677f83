//! Public provider endpoints. No client certificate is needed.

use axum::{body::Bytes, extract::State, Json};

use crate::error::GatewayError;
use crate::protocol::{GroupSpec, ProviderStatus, ValidateResult};
use crate::state::AppState;

/// `GET /status`: provider address, lease count, version, uptime.
pub async fn status(State(state): State<AppState>) -> Result<Json<ProviderStatus>, GatewayError> {
    Ok(Json(state.info.status().await?))
}

/// `GET /validate`: price a group spec sent as the JSON request body.
///
/// An empty body is `400`; a body that is not a group spec is `422`.
pub async fn validate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ValidateResult>, GatewayError> {
    if body.is_empty() {
        return Err(GatewayError::BadRequest("empty payload".to_string()));
    }
    let spec: GroupSpec = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::Unprocessable(e.to_string()))?;
    Ok(Json(state.info.validate(&spec).await?))
}
