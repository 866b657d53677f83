//! One-way JSON streams: service logs and lease events.
//!
//! Both endpoints only write to the socket. The read half is handed to
//! [`PeerReader::watch`], which keeps the pong deadline and cancels the stream
//! when the tenant goes away.
//!
//! Close codes:
//!
//! | Code | When                                          |
//! |------|-----------------------------------------------|
//! | 1000 | sources exhausted, or the tenant disconnected |
//! | 4000 | the backend failed to open the stream         |
//! | 4001 | nothing to stream                             |

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::cluster::{EventReader, LogReader, LogRequest, LogSource};
use crate::config::StreamConfig;
use crate::lease::LeaseId;
use crate::protocol::{
    ServiceLogMessage, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_NO_SOURCES,
};
use crate::ws::{send_close, spawn_pinger, PeerReader, WsSink};

/// Stream service log lines as `{"name", "message"}` text messages.
///
/// Each source is read by its own task; lines from different sources
/// interleave in arrival order. The stream ends when every source is
/// exhausted or the tenant disconnects.
pub async fn stream_logs(
    socket: WebSocket,
    logs: Arc<dyn LogReader>,
    req: LogRequest,
    stream: StreamConfig,
    shutdown: CancellationToken,
) {
    let span = tracing::info_span!("logs", lease = %req.lease, follow = req.follow);
    async move {
        let cancel = shutdown.child_token();
        let (sink, read_half) = socket.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        let sources = match logs.logs(req, cancel.clone()).await {
            Ok(sources) => sources,
            Err(e) => {
                error!(error = %e, "failed to open log streams");
                send_close(&sink, CLOSE_INTERNAL_ERROR, "").await;
                return;
            }
        };
        if sources.is_empty() {
            info!("no log sources");
            send_close(&sink, CLOSE_NO_SOURCES, "no running pods").await;
            return;
        }
        info!(sources = sources.len(), "log stream started");

        let watcher = tokio::spawn(
            PeerReader::new(read_half, stream.pong_wait())
                .watch(cancel.clone())
                .in_current_span(),
        );
        let pinger = spawn_pinger(Arc::clone(&sink), stream.ping_period(), cancel.clone());

        // Capacity 1: a slow tenant throttles every reader.
        let (tx, mut rx) = mpsc::channel::<ServiceLogMessage>(1);
        let mut workers = JoinSet::new();
        for source in sources {
            workers.spawn(read_source(source, tx.clone(), cancel.clone()).in_current_span());
        }
        drop(tx);

        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => break,
                line = rx.recv() => line,
            };
            let Some(line) = line else {
                debug!("all log sources exhausted");
                break;
            };
            if !send_json(&sink, &line).await {
                break;
            }
        }

        cancel.cancel();
        // Unblock workers parked on a full channel and reap them off the
        // response path.
        tokio::spawn(
            async move {
                while rx.recv().await.is_some() {}
                while workers.join_next().await.is_some() {}
            }
            .in_current_span(),
        );

        send_close(&sink, CLOSE_NORMAL, "").await;
        let _ = pinger.await;
        let _ = watcher.await;
        info!("log stream finished");
    }
    .instrument(span)
    .await;
}

async fn read_source(
    source: LogSource,
    tx: mpsc::Sender<ServiceLogMessage>,
    cancel: CancellationToken,
) {
    let LogSource { name, reader } = source;
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(message)) => {
                let msg = ServiceLogMessage {
                    name: name.clone(),
                    message,
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(source = %name, error = %e, "log source failed");
                break;
            }
        }
    }
}

/// Stream lease events as JSON text messages until the event source ends or
/// the tenant disconnects.
pub async fn stream_events(
    socket: WebSocket,
    events: Arc<dyn EventReader>,
    lease: LeaseId,
    services: Vec<String>,
    follow: bool,
    stream: StreamConfig,
    shutdown: CancellationToken,
) {
    let span = tracing::info_span!("events", %lease, follow);
    async move {
        let cancel = shutdown.child_token();
        let (sink, read_half) = socket.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        let mut events = match events.events(&lease, &services, follow).await {
            Ok(Some(events)) => events,
            Ok(None) => {
                info!("lease unknown to the event source");
                send_close(&sink, CLOSE_NO_SOURCES, "").await;
                return;
            }
            Err(e) => {
                error!(error = %e, "failed to open event stream");
                send_close(&sink, CLOSE_INTERNAL_ERROR, "").await;
                return;
            }
        };

        let watcher = tokio::spawn(
            PeerReader::new(read_half, stream.pong_wait())
                .watch(cancel.clone())
                .in_current_span(),
        );
        let pinger = spawn_pinger(Arc::clone(&sink), stream.ping_period(), cancel.clone());

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.next() => event,
            };
            let Some(event) = event else {
                debug!("event source ended");
                break;
            };
            if !send_json(&sink, &event).await {
                break;
            }
        }

        cancel.cancel();
        drop(events);
        send_close(&sink, CLOSE_NORMAL, "").await;
        let _ = pinger.await;
        let _ = watcher.await;
    }
    .instrument(span)
    .await;
}

/// Serialize and send one text message. Returns false once the socket is
/// unusable.
async fn send_json<T: Serialize>(sink: &WsSink, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "failed to encode stream message");
            return false;
        }
    };
    match sink.lock().await.send(Message::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "stream write failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    fn source(name: &str, text: &'static str) -> LogSource {
        LogSource {
            name: name.to_string(),
            reader: Box::new(BufReader::new(Cursor::new(text.as_bytes()))),
        }
    }

    #[tokio::test]
    async fn source_lines_are_tagged_with_name() {
        let (tx, mut rx) = mpsc::channel(8);
        read_source(source("web-0", "one\ntwo\n"), tx, CancellationToken::new()).await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "web-0");
        assert_eq!(first.message, "one");
        assert_eq!(rx.recv().await.unwrap().message, "two");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_reader_stops_without_sending() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        // The pending side of a duplex never yields a line.
        let (pending, _keep) = tokio::io::duplex(16);
        let src = LogSource {
            name: "web-0".to_string(),
            reader: Box::new(BufReader::new(pending)),
        };
        read_source(src, tx, cancel).await;
        assert!(rx.recv().await.is_none());
    }
}
