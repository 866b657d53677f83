//! WebSocket upgrades for log and event streaming.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    Extension,
};

use crate::cluster::LogRequest;
use crate::lease::LeaseId;
use crate::middleware::{EventParams, LogParams};
use crate::state::AppState;
use crate::ws::stream::{stream_events, stream_logs};

/// `GET /lease/{dseq}/{gseq}/{oseq}/logs?follow=&tail=&service=`
pub async fn lease_logs(
    State(state): State<AppState>,
    Extension(lease): Extension<LeaseId>,
    params: LogParams,
    ws: WebSocketUpgrade,
) -> Response {
    let req = LogRequest {
        lease,
        services: params.services,
        follow: params.follow,
        tail: params.tail,
    };
    let logs = state.logs.clone();
    let stream = state.stream_config();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| stream_logs(socket, logs, req, stream, shutdown))
}

/// `GET /lease/{dseq}/{gseq}/{oseq}/kubeevents?follow=&service=`
pub async fn lease_events(
    State(state): State<AppState>,
    Extension(lease): Extension<LeaseId>,
    params: EventParams,
    ws: WebSocketUpgrade,
) -> Response {
    let events = state.events.clone();
    let stream = state.stream_config();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| {
        stream_events(
            socket,
            events,
            lease,
            params.services,
            params.follow,
            stream,
            shutdown,
        )
    })
}
