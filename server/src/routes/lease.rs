//! Lease status endpoints.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    Extension, Json,
};

use crate::error::GatewayError;
use crate::lease::LeaseId;
use crate::protocol::{LeaseStatus, ServiceStatus};
use crate::state::AppState;

/// `GET /lease/{dseq}/{gseq}/{oseq}/status`
pub async fn lease_status(
    State(state): State<AppState>,
    Extension(lease): Extension<LeaseId>,
) -> Result<Json<LeaseStatus>, GatewayError> {
    Ok(Json(state.leases.lease_status(&lease).await?))
}

/// `GET /lease/{dseq}/{gseq}/{oseq}/service/{service}/status`
pub async fn service_status(
    State(state): State<AppState>,
    Extension(lease): Extension<LeaseId>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<ServiceStatus>, GatewayError> {
    let service = params
        .get("service")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("empty service name".to_string()))?;
    Ok(Json(state.leases.service_status(&lease, service).await?))
}
