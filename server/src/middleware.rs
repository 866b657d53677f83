//! Authorization middleware and request-parameter extractors.
//!
//! Lease- and deployment-scoped routes run this chain, outermost first:
//!
//! 1. [`inject_provider`]: every request learns which provider it reached
//! 2. [`require_owner`]: the verified peer certificate names the owner;
//!    no certificate means `401`
//! 3. [`require_lease`] / [`require_deployment`]: path sequences combined
//!    with owner and provider into an ID (`400` if malformed), then an
//!    existence check (`404`)
//!
//! The identity attached by the TLS listener is the only source of the owner.
//! Nothing in the request itself can change it.

use std::collections::HashMap;
use std::str::FromStr;

use axum::{
    extract::{FromRequestParts, Path, Query, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::address::AccountAddress;
use crate::error::GatewayError;
use crate::lease::{DeploymentId, LeaseId};
use crate::state::AppState;
use crate::tls::verifier::PeerIdentity;

/// Address of the provider serving the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderIdentity(pub AccountAddress);

/// Verified owner of the calling certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub AccountAddress);

pub async fn inject_provider(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    req.extensions_mut()
        .insert(ProviderIdentity(state.provider.clone()));
    next.run(req).await
}

/// Reject requests that did not arrive over a connection with a verified
/// client certificate.
pub async fn require_owner(mut req: Request, next: Next) -> Response {
    let Some(peer) = req.extensions().get::<PeerIdentity>() else {
        return GatewayError::Unauthorized("client certificate required".to_string())
            .into_response();
    };
    let owner = Owner(peer.owner.clone());
    req.extensions_mut().insert(owner);
    next.run(req).await
}

pub async fn require_deployment(
    State(state): State<AppState>,
    params: Result<Path<HashMap<String, String>>, axum::extract::rejection::PathRejection>,
    mut req: Request,
    next: Next,
) -> Response {
    let id = match deployment_from_request(params, &req) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.leases.deployment_exists(&id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(deployment = %id, "unknown deployment");
            return GatewayError::NotFound("deployment not found".to_string()).into_response();
        }
        Err(e) => return GatewayError::from(e).into_response(),
    }
    req.extensions_mut().insert(id);
    next.run(req).await
}

pub async fn require_lease(
    State(state): State<AppState>,
    params: Result<Path<HashMap<String, String>>, axum::extract::rejection::PathRejection>,
    mut req: Request,
    next: Next,
) -> Response {
    let id = match lease_from_request(params, &req) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.leases.lease_exists(&id).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(lease = %id, "unknown lease");
            return GatewayError::NotFound("lease not found".to_string()).into_response();
        }
        Err(e) => return GatewayError::from(e).into_response(),
    }
    req.extensions_mut().insert(id);
    next.run(req).await
}

fn deployment_from_request(
    params: Result<Path<HashMap<String, String>>, axum::extract::rejection::PathRejection>,
    req: &Request,
) -> Result<DeploymentId, GatewayError> {
    let Path(params) = params.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    let owner = owner_of(req)?;
    Ok(DeploymentId {
        owner,
        dseq: sequence(&params, "dseq")?,
    })
}

fn lease_from_request(
    params: Result<Path<HashMap<String, String>>, axum::extract::rejection::PathRejection>,
    req: &Request,
) -> Result<LeaseId, GatewayError> {
    let Path(params) = params.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    let owner = owner_of(req)?;
    let provider = req
        .extensions()
        .get::<ProviderIdentity>()
        .map(|p| p.0.clone())
        .ok_or_else(|| GatewayError::Internal("provider identity missing".to_string()))?;
    Ok(LeaseId {
        owner,
        dseq: sequence(&params, "dseq")?,
        gseq: sequence(&params, "gseq")?,
        oseq: sequence(&params, "oseq")?,
        provider,
    })
}

fn owner_of(req: &Request) -> Result<AccountAddress, GatewayError> {
    req.extensions()
        .get::<Owner>()
        .map(|o| o.0.clone())
        .ok_or_else(|| GatewayError::Unauthorized("client certificate required".to_string()))
}

/// Parse a positive sequence number from the path.
fn sequence<T>(params: &HashMap<String, String>, name: &str) -> Result<T, GatewayError>
where
    T: FromStr + Default + PartialEq,
{
    let raw = params
        .get(name)
        .ok_or_else(|| GatewayError::BadRequest(format!("missing {name}")))?;
    let value: T = raw
        .parse()
        .map_err(|_| GatewayError::BadRequest(format!("invalid {name}: {raw:?}")))?;
    if value == T::default() {
        return Err(GatewayError::BadRequest(format!("{name} must be positive")));
    }
    Ok(value)
}

fn query_map(parts: &Parts) -> Result<HashMap<String, String>, GatewayError> {
    Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(map)| map)
        .map_err(|e| GatewayError::BadRequest(e.body_text()))
}

fn required<'a>(query: &'a HashMap<String, String>, name: &str) -> Result<&'a str, GatewayError> {
    match query.get(name) {
        Some(v) if !v.is_empty() => Ok(v.as_str()),
        _ => Err(GatewayError::BadRequest(format!(
            "missing parameter {name:?}"
        ))),
    }
}

/// Boolean spellings accepted in query strings.
fn parse_bool(name: &str, raw: &str) -> Result<bool, GatewayError> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(GatewayError::BadRequest(format!(
            "parameter {name:?} must be a boolean, got {raw:?}"
        ))),
    }
}

/// `0`/`1` flag of the shell endpoint.
fn parse_flag(name: &str, raw: &str) -> Result<bool, GatewayError> {
    match raw {
        "1" => Ok(true),
        "0" => Ok(false),
        _ => Err(GatewayError::BadRequest(format!(
            "parameter {name:?} must be 0 or 1, got {raw:?}"
        ))),
    }
}

/// Optional comma-separated `service` filter. Empty means all services.
fn parse_services(query: &HashMap<String, String>) -> Result<Vec<String>, GatewayError> {
    let Some(raw) = query.get("service").filter(|s| !s.is_empty()) else {
        return Ok(Vec::new());
    };
    if raw.ends_with(',') {
        return Err(GatewayError::BadRequest(
            "parameter \"service\" must not contain trailing comma".to_string(),
        ));
    }
    raw.split(',')
        .map(|name| {
            if name.is_empty() {
                Err(GatewayError::BadRequest(
                    "parameter \"service\" contains an empty name".to_string(),
                ))
            } else {
                Ok(name.to_string())
            }
        })
        .collect()
}

/// Query parameters of the log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogParams {
    pub follow: bool,
    /// `None` for `tail=-1` (whole history).
    pub tail: Option<u64>,
    pub services: Vec<String>,
}

impl LogParams {
    fn from_query(query: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let follow = parse_bool("follow", required(query, "follow")?)?;
        let raw_tail = required(query, "tail")?;
        let tail: i64 = raw_tail.parse().map_err(|_| {
            GatewayError::BadRequest(format!("parameter \"tail\" is not an integer: {raw_tail:?}"))
        })?;
        let tail = match tail {
            -1 => None,
            n if n < -1 => {
                return Err(GatewayError::BadRequest(
                    "parameter \"tail\" contains invalid value".to_string(),
                ))
            }
            n => Some(n.unsigned_abs()),
        };
        Ok(Self {
            follow,
            tail,
            services: parse_services(query)?,
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for LogParams {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_query(&query_map(parts)?)
    }
}

/// Query parameters of the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventParams {
    pub follow: bool,
    pub services: Vec<String>,
}

impl EventParams {
    fn from_query(query: &HashMap<String, String>) -> Result<Self, GatewayError> {
        Ok(Self {
            follow: parse_bool("follow", required(query, "follow")?)?,
            services: parse_services(query)?,
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for EventParams {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_query(&query_map(parts)?)
    }
}

/// Query parameters of the shell endpoint.
///
/// `cmd0`, `cmd1`, ... rebuild argv in index order; the first missing index
/// ends the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellParams {
    pub service: String,
    pub pod_index: u32,
    pub tty: bool,
    pub stdin: bool,
    pub cmd: Vec<String>,
}

impl ShellParams {
    fn from_query(query: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let service = required(query, "service")?.to_string();
        let raw_index = required(query, "podIndex")?;
        let pod_index = raw_index.parse().map_err(|_| {
            GatewayError::BadRequest(format!("parameter \"podIndex\" is invalid: {raw_index:?}"))
        })?;
        let tty = parse_flag("tty", required(query, "tty")?)?;
        let stdin = parse_flag("stdin", required(query, "stdin")?)?;
        let cmd: Vec<String> = (0..)
            .map_while(|i| query.get(&format!("cmd{i}")).cloned())
            .collect();
        if cmd.is_empty() {
            return Err(GatewayError::BadRequest(
                "missing parameter \"cmd0\"".to_string(),
            ));
        }
        Ok(Self {
            service,
            pod_index,
            tty,
            stdin,
            cmd,
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ShellParams {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Self::from_query(&query_map(parts)?)
    }
}
