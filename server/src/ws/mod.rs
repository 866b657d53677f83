//! WebSocket plumbing shared by the shell and streaming endpoints.
//!
//! ## Keepalive
//!
//! Every gateway WebSocket runs the same liveness scheme:
//!
//! - a pinger task sends a Ping every `ping_period`;
//! - the task that owns the read half keeps a read deadline of `pong_wait`
//!   which is pushed forward **only** when a Pong arrives.
//!
//! A missed deadline is the only idle-peer detector; it ends the read loop and
//! the owner cancels the session. `ping_period < pong_wait` is enforced by
//! [`crate::config::Config::validate`].
//!
//! ## Writers
//!
//! The write half is shared behind one [`tokio::sync::Mutex`] ([`WsSink`]).
//! Every frame (data, ping, result, close) takes the lock for exactly one
//! send, so frames from concurrent writers never interleave.

pub mod shell;
pub mod stream;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::time::{Instant, Sleep};
use tokio_util::io::{CopyToBytes, SinkWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{Frame, Tag};

/// Shared, lock-guarded write half of a WebSocket.
pub type WsSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Why a [`PeerReader`] stopped.
#[derive(Debug)]
pub enum ReadEnd {
    /// The session token was cancelled.
    Cancelled,
    /// The peer sent Close or the stream ended.
    Closed,
    /// No Pong within `pong_wait`.
    Timeout,
    Error(axum::Error),
}

/// Exclusive owner of a WebSocket read half.
///
/// Handles Pong bookkeeping internally and only surfaces data messages.
pub struct PeerReader {
    stream: SplitStream<WebSocket>,
    pong_wait: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl PeerReader {
    pub fn new(stream: SplitStream<WebSocket>, pong_wait: Duration) -> Self {
        Self {
            stream,
            pong_wait,
            deadline: Box::pin(tokio::time::sleep(pong_wait)),
        }
    }

    /// Next Binary or Text message from the peer.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Message, ReadEnd> {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(ReadEnd::Cancelled),
                () = &mut self.deadline => return Err(ReadEnd::Timeout),
                msg = self.stream.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => return Err(ReadEnd::Closed),
                    Some(Err(e)) => return Err(ReadEnd::Error(e)),
                    Some(Ok(Message::Pong(_))) => {
                        self.deadline.as_mut().reset(Instant::now() + self.pong_wait);
                    }
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(msg)) => return Ok(msg),
                },
            }
        }
    }

    /// Consume and discard data until the peer goes away, then cancel.
    ///
    /// Used by one-way streams where the client never sends application data.
    pub async fn watch(mut self, cancel: CancellationToken) -> ReadEnd {
        let end = loop {
            match self.next(&cancel).await {
                Ok(_) => {}
                Err(end) => break end,
            }
        };
        debug!(?end, "peer reader finished");
        cancel.cancel();
        end
    }
}

/// Send a Ping every `period` until `cancel` fires or a send fails. A failed
/// send cancels the session.
pub fn spawn_pinger(
    sink: WsSink,
    period: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let sent = sink.lock().await.send(Message::Ping(Bytes::new())).await;
                    if let Err(e) = sent {
                        debug!(error = %e, "ping failed");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    })
}

/// An [`AsyncWrite`] that wraps every write in a `tag`-prefixed binary frame.
pub fn frame_writer(sink: WsSink, tag: Tag) -> impl AsyncWrite + Send + Unpin + 'static {
    let frames = futures::sink::unfold(sink, move |sink: WsSink, chunk: Bytes| async move {
        let frame = Frame::new(tag, chunk).encode();
        sink.lock()
            .await
            .send(Message::Binary(frame))
            .await
            .map_err(io::Error::other)?;
        Ok::<_, io::Error>(sink)
    });
    Box::pin(SinkWriter::new(CopyToBytes::new(frames)))
}

/// Send one frame under the lock.
pub async fn send_frame(sink: &WsSink, frame: &Frame) -> Result<(), axum::Error> {
    sink.lock().await.send(Message::Binary(frame.encode())).await
}

/// Send a Close frame with `code` and flush. Errors are ignored: the peer may
/// already be gone.
pub async fn send_close(sink: &WsSink, code: u16, reason: &str) {
    let mut sink = sink.lock().await;
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, code, "close frame not delivered");
    }
    let _ = sink.close().await;
}
