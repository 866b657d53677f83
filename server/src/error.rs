//! HTTP error responses.
//!
//! Handlers return [`GatewayError`]; its [`IntoResponse`] impl picks the
//! status code and writes `{"error": "..."}`. Internal errors are logged with
//! full detail and answered with a generic body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::cluster::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ClusterError> for GatewayError {
    fn from(e: ClusterError) -> Self {
        match e {
            e if e.is_not_found() => GatewayError::NotFound(e.to_string()),
            ClusterError::NoGlobalServices => GatewayError::Unavailable(e.to_string()),
            ClusterError::InvalidManifest(_) | ClusterError::InvalidGroupSpec(_) => {
                GatewayError::Unprocessable(e.to_string())
            }
            ClusterError::DeploymentNotRunning
            | ClusterError::ServiceNotRunning
            | ClusterError::PodIndexOutOfRange => GatewayError::BadRequest(e.to_string()),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            GatewayError::Internal(detail) => {
                error!(%detail, "internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_errors_map_to_status_codes() {
        let cases = [
            (ClusterError::LeaseNotFound, StatusCode::NOT_FOUND),
            (ClusterError::NoLeaseForDeployment, StatusCode::NOT_FOUND),
            (ClusterError::NoServiceWithName, StatusCode::NOT_FOUND),
            (ClusterError::NoGlobalServices, StatusCode::SERVICE_UNAVAILABLE),
            (
                ClusterError::InvalidManifest("x".to_string()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ClusterError::Internal("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(GatewayError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn internal_detail_is_not_leaked() {
        let resp = GatewayError::Internal("db password is hunter2".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("Internal server error"));
    }
}
