//! WebSocket upgrade for the lease shell.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    Extension,
};

use crate::cluster::ExecRequest;
use crate::lease::LeaseId;
use crate::middleware::ShellParams;
use crate::state::AppState;
use crate::ws::shell::{self, ShellSession};

/// `GET /lease/{dseq}/{gseq}/{oseq}/shell?service=&podIndex=&tty=&stdin=&cmd0=...`
///
/// Parameters are validated before the upgrade, so a malformed request gets a
/// plain `400` instead of a WebSocket.
pub async fn lease_shell(
    State(state): State<AppState>,
    Extension(lease): Extension<LeaseId>,
    params: ShellParams,
    ws: WebSocketUpgrade,
) -> Response {
    let session = ShellSession {
        execer: state.execer.clone(),
        request: ExecRequest {
            lease,
            service: params.service,
            pod_index: params.pod_index,
            cmd: params.cmd,
            tty: params.tty,
        },
        attach_stdin: params.stdin,
        stream: state.stream_config(),
        shutdown: state.shutdown.clone(),
    };
    ws.on_upgrade(move |socket| shell::run(socket, session))
}
