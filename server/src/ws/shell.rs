//! Server half of the lease shell multiplexer.
//!
//! One WebSocket carries stdin and terminal resizes from the tenant and
//! stdout/stderr plus a single terminal outcome frame back. Three tasks share
//! the socket:
//!
//! - the reader owns the read half: `Stdin` frames go into an in-memory pipe
//!   feeding the remote process, `TerminalResize` frames into a latest-wins
//!   queue, Pongs extend the read deadline, Close/error/timeout cancel the
//!   session;
//! - the pinger;
//! - the session task runs the exec, streams output frames as they are
//!   produced, then sends exactly one `Result` or `Failure` frame and closes.
//!
//! `Result` carries the exit code, or a message for errors that are safe to
//! show the tenant. Anything else becomes an empty `Failure` frame and the
//! cause is only logged.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::cluster::{
    BoxReader, ExecIo, ExecRequest, Execer, TerminalSizeQueue, TerminalSizeSender,
};
use crate::config::StreamConfig;
use crate::protocol::{Frame, ShellResult, Tag, TerminalSize, CLOSE_NORMAL};
use crate::ws::{frame_writer, send_close, send_frame, spawn_pinger, PeerReader, ReadEnd, WsSink};

/// Capacity of the in-memory stdin pipe. Writes from the socket wait once it
/// is full, so a process that stops reading stalls the tenant's input.
const STDIN_PIPE_CAPACITY: usize = 8 * 1024;

/// Everything the session needs besides the socket.
pub struct ShellSession {
    pub execer: Arc<dyn Execer>,
    pub request: ExecRequest,
    pub attach_stdin: bool,
    pub stream: StreamConfig,
    /// Parent token; the session derives its own child from it.
    pub shutdown: CancellationToken,
}

/// Drive one shell session to completion.
pub async fn run(socket: WebSocket, session: ShellSession) {
    let id = Uuid::new_v4();
    let span = tracing::info_span!(
        "shell",
        %id,
        lease = %session.request.lease,
        service = %session.request.service,
        pod = session.request.pod_index,
    );
    run_session(socket, session).instrument(span).await;
}

async fn run_session(socket: WebSocket, session: ShellSession) {
    let ShellSession {
        execer,
        request,
        attach_stdin,
        stream,
        shutdown,
    } = session;
    let cancel = shutdown.child_token();
    let (sink, read_half) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    let (stdin_rx, stdin_tx) = if attach_stdin {
        let (rx, tx) = tokio::io::duplex(STDIN_PIPE_CAPACITY);
        (Some(rx), Some(tx))
    } else {
        (None, None)
    };
    let (resize_tx, resize_rx) = if request.tty {
        let (tx, rx) = TerminalSizeQueue::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let reader = tokio::spawn(
        read_client(
            PeerReader::new(read_half, stream.pong_wait()),
            stdin_tx,
            resize_tx,
            cancel.clone(),
        )
        .in_current_span(),
    );
    let pinger = spawn_pinger(Arc::clone(&sink), stream.ping_period(), cancel.clone());

    let io = ExecIo {
        stdin: stdin_rx.map(|r| Box::new(r) as BoxReader),
        stdout: Box::new(frame_writer(Arc::clone(&sink), Tag::Stdout)),
        stderr: Box::new(frame_writer(Arc::clone(&sink), Tag::Stderr)),
        resize: resize_rx,
    };

    info!(cmd = ?request.cmd, tty = request.tty, stdin = attach_stdin, "exec started");
    let outcome = execer.exec(request, io, cancel.clone()).await;
    let frame = outcome_frame(outcome);

    if let Err(e) = send_frame(&sink, &frame).await {
        debug!(error = %e, "could not deliver shell outcome");
    }
    send_close(&sink, CLOSE_NORMAL, "").await;

    cancel.cancel();
    let _ = pinger.await;
    let _ = reader.await;
}

/// Turn the exec outcome into the final frame.
fn outcome_frame(outcome: Result<crate::cluster::ExecResult, crate::cluster::ClusterError>) -> Frame {
    let result = match outcome {
        Ok(r) => {
            info!(exit_code = r.exit_code, "exec finished");
            ShellResult::exited(r.exit_code)
        }
        Err(e) if e.is_client_safe() => {
            info!(error = %e, "exec refused");
            ShellResult::error(e.to_string())
        }
        Err(e) => {
            error!(error = %e, "exec failed");
            return Frame::new(Tag::Failure, Bytes::new());
        }
    };
    match serde_json::to_vec(&result) {
        Ok(payload) => Frame::new(Tag::Result, payload),
        Err(e) => {
            error!(error = %e, "failed to encode shell result");
            Frame::new(Tag::Failure, Bytes::new())
        }
    }
}

/// Demultiplex tenant frames until the socket ends.
///
/// Dropping `stdin` on the way out delivers EOF to the remote process.
async fn read_client(
    mut reader: PeerReader,
    mut stdin: Option<DuplexStream>,
    resize: Option<TerminalSizeSender>,
    cancel: CancellationToken,
) {
    let end = loop {
        let data = match reader.next(&cancel).await {
            Ok(Message::Binary(data)) => data,
            Ok(_) => continue,
            Err(end) => break end,
        };
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "ignoring malformed frame");
                continue;
            }
        };
        match frame.tag {
            Tag::Stdin => {
                let Some(pipe) = stdin.as_mut() else {
                    continue;
                };
                let written = tokio::select! {
                    () = cancel.cancelled() => break ReadEnd::Cancelled,
                    r = pipe.write_all(&frame.payload) => r,
                };
                if let Err(e) = written {
                    // The process closed its stdin; later input has nowhere to go.
                    debug!(error = %e, "stdin pipe closed");
                    stdin = None;
                }
            }
            Tag::TerminalResize => match TerminalSize::from_bytes(&frame.payload) {
                Ok(size) => {
                    debug!(width = size.width, height = size.height, "terminal resize");
                    if let Some(tx) = &resize {
                        tx.send(size);
                    }
                }
                Err(e) => warn!(error = %e, "ignoring malformed resize"),
            },
            other => debug!(tag = ?other, "ignoring unexpected frame from client"),
        }
    };
    drop(stdin);
    match end {
        ReadEnd::Cancelled => {}
        ReadEnd::Closed => debug!("client closed the shell socket"),
        ReadEnd::Timeout => warn!("client stopped answering pings"),
        ReadEnd::Error(e) => debug!(error = %e, "shell socket read failed"),
    }
    cancel.cancel();
}
