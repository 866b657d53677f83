//! HTTP route handlers and the gateway router.
//!
//! Each sub-module corresponds to an endpoint group. [`status`] is public;
//! everything else runs behind [`crate::middleware::require_owner`] and an ID
//! check.
//!
//! | Method | Path                                                   | Auth  |
//! |--------|--------------------------------------------------------|-------|
//! | GET    | `/status`                                              | none  |
//! | GET    | `/validate`                                            | none  |
//! | PUT    | `/deployment/{dseq}/manifest`                          | owner |
//! | GET    | `/lease/{dseq}/{gseq}/{oseq}/status`                   | owner |
//! | GET    | `/lease/{dseq}/{gseq}/{oseq}/service/{service}/status` | owner |
//! | GET    | `/lease/{dseq}/{gseq}/{oseq}/logs`                     | owner |
//! | GET    | `/lease/{dseq}/{gseq}/{oseq}/kubeevents`               | owner |
//! | GET    | `/lease/{dseq}/{gseq}/{oseq}/shell`                    | owner |

pub mod deployment;
pub mod lease;
pub mod shell;
pub mod status;
pub mod stream;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::middleware::{inject_provider, require_deployment, require_lease, require_owner};
use crate::state::AppState;

const LEASE: &str = "/lease/{dseq}/{gseq}/{oseq}";

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/status", get(status::status))
        .route("/validate", get(status::validate));

    // route_layer: the last layer added runs first.
    let deployments = Router::new()
        .route("/deployment/{dseq}/manifest", put(deployment::submit_manifest))
        .route_layer(from_fn_with_state(state.clone(), require_deployment))
        .route_layer(from_fn(require_owner));

    let leases = Router::new()
        .route(&format!("{LEASE}/status"), get(lease::lease_status))
        .route(
            &format!("{LEASE}/service/{{service}}/status"),
            get(lease::service_status),
        )
        .route(&format!("{LEASE}/logs"), get(stream::lease_logs))
        .route(&format!("{LEASE}/kubeevents"), get(stream::lease_events))
        .route(&format!("{LEASE}/shell"), get(shell::lease_shell))
        .route_layer(from_fn_with_state(state.clone(), require_lease))
        .route_layer(from_fn(require_owner));

    Router::new()
        .merge(public)
        .merge(deployments)
        .merge(leases)
        .layer(from_fn_with_state(state.clone(), inject_provider))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::*;
    use crate::cluster::local::LocalCluster;
    use crate::config::{Config, LocalConfig, LocalLeaseConfig, LocalServiceConfig};
    use crate::testutil;
    use crate::tls::verifier::PeerIdentity;

    fn service(name: &str, global: bool) -> LocalServiceConfig {
        LocalServiceConfig {
            name: name.to_string(),
            replicas: 1,
            running: true,
            working_dir: "/".to_string(),
            log_files: Vec::new(),
            uris: Vec::new(),
            global,
        }
    }

    fn app() -> Router {
        let provider = testutil::owner(9);
        let local = LocalConfig {
            leases: vec![
                LocalLeaseConfig {
                    owner: testutil::owner(1).to_string(),
                    dseq: 42,
                    gseq: 1,
                    oseq: 1,
                    services: vec![service("web", true)],
                },
                LocalLeaseConfig {
                    owner: testutil::owner(1).to_string(),
                    dseq: 43,
                    gseq: 1,
                    oseq: 1,
                    services: vec![service("worker", false)],
                },
            ],
        };
        let mut config = Config::default();
        config.server.provider = provider.to_string();
        let backend = Arc::new(LocalCluster::from_config(provider.clone(), &local, "akash").unwrap());
        let state = AppState::with_backend(
            Arc::new(config),
            provider,
            backend,
            CancellationToken::new(),
        );
        router(state)
    }

    fn request(method: Method, uri: &str, owner: Option<u8>, body: &str) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        if let Some(byte) = owner {
            req.extensions_mut().insert(PeerIdentity {
                owner: testutil::owner(byte),
                serial: "1".to_string(),
            });
        }
        req
    }

    async fn json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn status_is_public() {
        let resp = app()
            .oneshot(request(Method::GET, "/status", None, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json(resp).await;
        assert_eq!(body["address"], testutil::owner(9).to_string());
        assert_eq!(body["leases"], 2);
    }

    #[tokio::test]
    async fn validate_distinguishes_empty_and_malformed_bodies() {
        let resp = app()
            .oneshot(request(Method::GET, "/validate", None, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app()
            .oneshot(request(Method::GET, "/validate", None, "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let spec = r#"{"name":"g","resources":[{"count":1,"cpu_millis":100,"memory_bytes":1048576}]}"#;
        let resp = app()
            .oneshot(request(Method::GET, "/validate", None, spec))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["min_bid_price"]["amount"], "101");
    }

    #[tokio::test]
    async fn lease_routes_require_identity() {
        let resp = app()
            .oneshot(request(Method::GET, "/lease/42/1/1/status", None, ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(json(resp).await["error"].is_string());

        let resp = app()
            .oneshot(request(Method::GET, "/lease/42/1/1/status", Some(1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["services"]["web"]["total"], 1);
    }

    #[tokio::test]
    async fn lease_is_scoped_to_the_certificate_owner() {
        // Same path, different owner: the lease does not exist for them.
        let resp = app()
            .oneshot(request(Method::GET, "/lease/42/1/1/status", Some(2), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_and_unknown_leases() {
        for uri in ["/lease/x/1/1/status", "/lease/42/0/1/status", "/lease/42/1/99999999999/status"] {
            let resp = app()
                .oneshot(request(Method::GET, uri, Some(1), ""))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
        let resp = app()
            .oneshot(request(Method::GET, "/lease/7/1/1/status", Some(1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lease_without_global_services_is_unavailable() {
        let resp = app()
            .oneshot(request(Method::GET, "/lease/43/1/1/status", Some(1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn service_status() {
        let resp = app()
            .oneshot(request(Method::GET, "/lease/42/1/1/service/web/status", Some(1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json(resp).await["name"], "web");

        let resp = app()
            .oneshot(request(Method::GET, "/lease/42/1/1/service/db/status", Some(1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manifest_submission() {
        let manifest = r#"[{"name":"g","services":[{"name":"web","image":"nginx"}]}]"#;
        let resp = app()
            .oneshot(request(Method::PUT, "/deployment/42/manifest", Some(1), manifest))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app()
            .oneshot(request(Method::PUT, "/deployment/42/manifest", Some(1), "[]"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = app()
            .oneshot(request(Method::PUT, "/deployment/42/manifest", Some(1), "nope"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let resp = app()
            .oneshot(request(Method::PUT, "/deployment/5/manifest", Some(1), manifest))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app()
            .oneshot(request(Method::PUT, "/deployment/42/manifest", None, manifest))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn stream_parameters_are_checked_before_upgrade() {
        let resp = app()
            .oneshot(request(
                Method::GET,
                "/lease/42/1/1/logs?follow=true&tail=-1&service=web,",
                Some(1),
                "",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("trailing comma"));

        let resp = app()
            .oneshot(request(Method::GET, "/lease/42/1/1/shell?service=web", Some(1), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
