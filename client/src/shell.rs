//! Client half of the lease shell multiplexer.
//!
//! Tasks per session:
//!
//! - stdin pump: copies local stdin into `Stdin` frames. Once the session is
//!   cancelled it abandons any pending read and drops (closes) the stdin
//!   source. A read already running inside the source, such as the blocking
//!   thread behind `tokio::io::stdin`, is not interrupted and finishes on its
//!   own.
//! - resize forwarder: turns local terminal size changes into
//!   `TerminalResize` frames.
//! - closer: sends a Close frame once the session is cancelled.
//! - the caller's task demultiplexes output until the `Result` or `Failure`
//!   frame, or until the socket ends.
//!
//! Teardown is always cancel, then close local stdin by joining the pump,
//! then join the resize forwarder and the closer, then report. Frames after
//! the outcome frame are never read.

use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use leasegw::lease::LeaseId;
use leasegw::protocol::{Frame, FrameError, ShellResult, Tag, TerminalSize};

use crate::client::ProviderClient;
use crate::error::ShellError;

const STDIN_CHUNK: usize = 4096;

type SharedSink<S> = Arc<Mutex<SplitSink<S, Message>>>;

/// What to run and where.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub service: String,
    pub pod_index: u32,
    /// argv; must not be empty.
    pub cmd: Vec<String>,
    pub tty: bool,
}

/// Local ends of the session. Without `stdin` the remote process gets none.
///
/// `stdin` is owned by the session and dropped before the session returns.
pub struct ShellIo<I, O, E> {
    pub stdin: Option<I>,
    pub stdout: O,
    pub stderr: E,
    /// Terminal size changes; only forwarded for tty sessions.
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

impl ProviderClient {
    /// Run a command in a lease's service replica.
    ///
    /// Returns the remote exit code, which may be non-zero. Errors the
    /// provider chose to explain come back as [`ShellError::Remote`].
    pub async fn lease_shell<I, O, E>(
        &self,
        lease: &LeaseId,
        request: &ShellRequest,
        io: ShellIo<I, O, E>,
        cancel: CancellationToken,
    ) -> Result<i32, ShellError>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let mut url = self.url("wss", &format!("/lease/{}/shell", lease.route_path()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("service", &request.service)
                .append_pair("podIndex", &request.pod_index.to_string())
                .append_pair("tty", flag(request.tty))
                .append_pair("stdin", flag(io.stdin.is_some()));
            for (i, arg) in request.cmd.iter().enumerate() {
                query.append_pair(&format!("cmd{i}"), arg);
            }
        }
        let ws = self.websocket(&url).await?;
        run(ws, request.tty, io, cancel).await
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

/// Drive one shell session over an upgraded socket.
async fn run<S, I, O, E>(
    ws: S,
    tty: bool,
    io: ShellIo<I, O, E>,
    cancel: CancellationToken,
) -> Result<i32, ShellError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Send
        + Unpin
        + 'static,
    I: AsyncRead + Send + Unpin + 'static,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let ShellIo {
        stdin,
        mut stdout,
        mut stderr,
        resize,
    } = io;
    let session = cancel.child_token();
    let (sink, mut frames) = ws.split();
    let sink: SharedSink<S> = Arc::new(Mutex::new(sink));

    let closer = tokio::spawn(close_on_cancel(Arc::clone(&sink), session.clone()));
    let pump = stdin.map(|stdin| {
        tokio::spawn(pump_stdin(stdin, Arc::clone(&sink), session.clone()))
    });
    let forwarder = match resize {
        Some(rx) if tty => Some(tokio::spawn(forward_resizes(
            rx,
            Arc::clone(&sink),
            session.clone(),
        ))),
        _ => None,
    };

    let outcome = loop {
        let msg = tokio::select! {
            () = session.cancelled() => break Err(ShellError::Closed),
            msg = frames.next() => msg,
        };
        let data = match msg {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => break Err(ShellError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(e.into()),
        };
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => break Err(e.into()),
        };
        let written = match frame.tag {
            Tag::Stdout => write_through(&mut stdout, &frame.payload).await,
            Tag::Stderr => write_through(&mut stderr, &frame.payload).await,
            Tag::Result => break decode_result(&frame.payload),
            Tag::Failure => break Err(ShellError::ProviderFailure),
            Tag::Stdin | Tag::TerminalResize => {
                break Err(FrameError::UnknownTag(frame.tag.as_u8()).into())
            }
        };
        if let Err(e) = written {
            break Err(e.into());
        }
    };

    session.cancel();
    if let Some(pump) = pump {
        let _ = pump.await;
    }
    if let Some(forwarder) = forwarder {
        let _ = forwarder.await;
    }
    let _ = closer.await;
    outcome
}

async fn write_through<W: AsyncWrite + Unpin>(out: &mut W, data: &[u8]) -> std::io::Result<()> {
    out.write_all(data).await?;
    out.flush().await
}

fn decode_result(payload: &[u8]) -> Result<i32, ShellError> {
    let result: ShellResult = serde_json::from_slice(payload)
        .map_err(|e| FrameError::Result(e.to_string()))?;
    if result.message.is_empty() {
        Ok(result.exit_code)
    } else {
        Err(ShellError::Remote(result.message))
    }
}

async fn send<S>(sink: &SharedSink<S>, frame: &Frame) -> bool
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut sink = sink.lock().await;
    match sink.send(Message::Binary(frame.encode())).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, tag = ?frame.tag, "frame write failed");
            false
        }
    }
}

async fn close_on_cancel<S>(sink: SharedSink<S>, session: CancellationToken)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    session.cancelled().await;
    let mut sink = sink.lock().await;
    if let Err(e) = sink.close().await {
        debug!(error = %e, "closing shell socket");
    }
}

/// Returns once stdin is exhausted or the session ends; `stdin` is dropped
/// on the way out either way.
async fn pump_stdin<S, I>(mut stdin: I, sink: SharedSink<S>, session: CancellationToken)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        let read = tokio::select! {
            () = session.cancelled() => break,
            read = stdin.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "reading local stdin");
                break;
            }
        };
        let frame = Frame::new(Tag::Stdin, bytes::Bytes::copy_from_slice(&buf[..n]));
        let sent = tokio::select! {
            () = session.cancelled() => break,
            sent = send(&sink, &frame) => sent,
        };
        if !sent {
            break;
        }
    }
    drop(stdin);
}

async fn forward_resizes<S>(
    mut sizes: mpsc::Receiver<TerminalSize>,
    sink: SharedSink<S>,
    session: CancellationToken,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let size = tokio::select! {
            () = session.cancelled() => return,
            size = sizes.recv() => match size {
                Some(size) => size,
                None => return,
            },
        };
        if !send(&sink, &Frame::resize(size)).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use crate::testserver::{scripted, service, TestGateway};
    use std::time::Duration;

    fn request(cmd: &[&str]) -> ShellRequest {
        ShellRequest {
            service: "web".to_string(),
            pod_index: 0,
            cmd: cmd.iter().map(|s| (*s).to_string()).collect(),
            tty: false,
        }
    }

    type Captured<'a> = ShellIo<tokio::io::Empty, &'a mut Vec<u8>, &'a mut Vec<u8>>;

    fn no_stdin<'a>(stdout: &'a mut Vec<u8>, stderr: &'a mut Vec<u8>) -> Captured<'a> {
        ShellIo {
            stdin: None,
            stdout,
            stderr,
            resize: None,
        }
    }

    fn frame(tag: Tag, payload: &'static [u8]) -> Message {
        Message::Binary(Frame::new(tag, payload).encode())
    }

    fn exited(code: i32) -> Message {
        let payload = serde_json::to_vec(&ShellResult::exited(code)).unwrap();
        Message::Binary(Frame::new(Tag::Result, payload).encode())
    }

    /// Run the demultiplexer against a peer that has already sent `messages`.
    async fn demux(
        messages: Vec<Message>,
        out: &mut Vec<u8>,
        err: &mut Vec<u8>,
    ) -> Result<i32, ShellError> {
        let (client, _server) = scripted(messages).await;
        tokio::time::timeout(
            Duration::from_secs(5),
            run(client, false, no_stdin(out, err), CancellationToken::new()),
        )
        .await
        .expect("demux should stop at the outcome frame")
    }

    #[tokio::test]
    async fn interleaved_output_stops_at_result() {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = demux(
            vec![
                frame(Tag::Stdout, b"one "),
                frame(Tag::Stderr, b"warn1 "),
                frame(Tag::Stdout, b"two"),
                frame(Tag::Stderr, b"warn2"),
                exited(4),
                frame(Tag::Stdout, b" late"),
                frame(Tag::Failure, b""),
            ],
            &mut out,
            &mut err,
        )
        .await
        .unwrap();
        assert_eq!(code, 4);
        assert_eq!(out, b"one two");
        assert_eq!(err, b"warn1 warn2");
    }

    #[tokio::test]
    async fn failure_frame_is_a_provider_failure() {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = demux(
            vec![
                frame(Tag::Stdout, b"partial"),
                frame(Tag::Stderr, b"e"),
                frame(Tag::Failure, b""),
                exited(0),
                frame(Tag::Stdout, b" late"),
            ],
            &mut out,
            &mut err,
        )
        .await;
        assert!(matches!(res, Err(ShellError::ProviderFailure)), "{res:?}");
        assert_eq!(out, b"partial");
        assert_eq!(err, b"e");
    }

    #[tokio::test]
    async fn empty_binary_message_is_a_protocol_error() {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = demux(
            vec![Message::Binary(bytes::Bytes::new()), exited(0)],
            &mut out,
            &mut err,
        )
        .await;
        assert!(
            matches!(res, Err(ShellError::Protocol(FrameError::Empty))),
            "{res:?}"
        );
    }

    #[tokio::test]
    async fn client_only_tags_from_the_provider_are_rejected() {
        for tag in [Tag::Stdin, Tag::TerminalResize] {
            let (mut out, mut err) = (Vec::new(), Vec::new());
            let res = demux(
                vec![frame(Tag::Stdout, b"x"), frame(tag, b"\x00\x50\x00\x18"), exited(0)],
                &mut out,
                &mut err,
            )
            .await;
            assert!(
                matches!(res, Err(ShellError::Protocol(FrameError::UnknownTag(t))) if t == tag.as_u8()),
                "{tag:?}: {res:?}"
            );
            assert_eq!(out, b"x");
        }

        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = demux(vec![Message::Binary(vec![7u8].into())], &mut out, &mut err).await;
        assert!(
            matches!(res, Err(ShellError::Protocol(FrameError::UnknownTag(7)))),
            "{res:?}"
        );
    }

    #[tokio::test]
    async fn close_before_outcome_is_closed() {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = demux(
            vec![frame(Tag::Stdout, b"x"), Message::Close(None)],
            &mut out,
            &mut err,
        )
        .await;
        assert!(matches!(res, Err(ShellError::Closed)), "{res:?}");
        assert_eq!(out, b"x");
    }

    #[tokio::test]
    async fn stdin_is_closed_before_the_session_reports() {
        let (client, _server) = scripted(vec![exited(0)]).await;
        let (stdin, mut writer) = tokio::io::duplex(64);
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let io = ShellIo {
            stdin: Some(stdin),
            stdout: &mut out,
            stderr: &mut err,
            resize: None,
        };
        let code = run(client, false, io, CancellationToken::new()).await.unwrap();
        assert_eq!(code, 0);
        let write = writer.write_all(b"too late").await;
        assert_eq!(write.unwrap_err().kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn result_without_message_is_an_exit_code() {
        assert_eq!(decode_result(br#"{"exit_code":3}"#).unwrap(), 3);
        assert_eq!(decode_result(br#"{"exit_code":0}"#).unwrap(), 0);
    }

    #[test]
    fn result_with_message_is_a_remote_error() {
        let err = decode_result(br#"{"exit_code":0,"message":"pod index out of range"}"#)
            .unwrap_err();
        assert!(matches!(err, ShellError::Remote(m) if m == "pod index out of range"));
    }

    #[test]
    fn garbage_result_is_a_protocol_error() {
        assert!(matches!(
            decode_result(b"not json"),
            Err(ShellError::Protocol(FrameError::Result(_)))
        ));
    }

    #[tokio::test]
    async fn output_streams_and_exit_code() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = gw
            .client()
            .lease_shell(
                &gw.lease(),
                &request(&["sh", "-c", "echo hello; echo oops >&2; exit 3"]),
                no_stdin(&mut out, &mut err),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 3);
        assert_eq!(out, b"hello\n");
        assert_eq!(err, b"oops\n");
    }

    #[tokio::test]
    async fn silent_command_produces_only_a_result() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let code = gw
            .client()
            .lease_shell(
                &gw.lease(),
                &request(&["true"]),
                no_stdin(&mut out, &mut err),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert!(out.is_empty());
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn stdin_reaches_the_remote_process() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let io = ShellIo {
            stdin: Some(&b"ping\n"[..]),
            stdout: &mut out,
            stderr: &mut err,
            resize: None,
        };
        let code = gw
            .client()
            .lease_shell(&gw.lease(), &request(&["head", "-n", "1"]), io, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, b"ping\n");
    }

    #[tokio::test]
    async fn blocked_stdin_does_not_hold_up_the_exit_code() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        // The writer stays alive, so reads on `stdin` block for the whole test.
        let (stdin, _writer) = tokio::io::duplex(64);
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let io = ShellIo {
            stdin: Some(stdin),
            stdout: &mut out,
            stderr: &mut err,
            resize: None,
        };
        let code = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            gw.client()
                .lease_shell(&gw.lease(), &request(&["sh", "-c", "exit 7"]), io, CancellationToken::new()),
        )
        .await
        .expect("shell should finish")
        .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn refusals_carry_the_provider_message() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let mut req = request(&["true"]);
        req.pod_index = 5;
        let res = gw
            .client()
            .lease_shell(&gw.lease(), &req, no_stdin(&mut out, &mut err), CancellationToken::new())
            .await;
        assert!(matches!(res, Err(ShellError::Remote(ref m)) if m.contains("pod")), "{res:?}");

        let mut req = request(&["true"]);
        req.service = "db".to_string();
        let res = gw
            .client()
            .lease_shell(&gw.lease(), &req, no_stdin(&mut out, &mut err), CancellationToken::new())
            .await;
        assert!(matches!(res, Err(ShellError::Remote(_))), "{res:?}");
    }

    #[tokio::test]
    async fn unknown_lease_is_refused_before_upgrade() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let mut lease = gw.lease();
        lease.dseq += 1;
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = gw
            .client()
            .lease_shell(&lease, &request(&["true"]), no_stdin(&mut out, &mut err), CancellationToken::new())
            .await;
        assert!(
            matches!(res, Err(ShellError::Client(ref e)) if e.is_not_found()),
            "{res:?}"
        );
    }

    #[tokio::test]
    async fn tty_session_forwards_resizes() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let (tx, rx) = mpsc::channel(4);
        tx.send(TerminalSize::new(100, 30)).await.unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let io = ShellIo {
            stdin: None::<tokio::io::Empty>,
            stdout: &mut out,
            stderr: &mut err,
            resize: Some(rx),
        };
        let mut req = request(&["sh", "-c", "sleep 0.5; stty size"]);
        req.tty = true;
        let code = gw
            .client()
            .lease_shell(&gw.lease(), &req, io, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("30 100"), "{text:?}");
    }

    #[tokio::test]
    async fn cancelling_ends_the_session() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            stopper.cancel();
        });
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let res = gw
            .client()
            .lease_shell(&gw.lease(), &request(&["sleep", "30"]), no_stdin(&mut out, &mut err), cancel)
            .await;
        assert!(matches!(res, Err(ShellError::Closed)), "{res:?}");
    }

    #[test]
    fn client_error_not_found_helper() {
        let e = ClientError::Status {
            status: 404,
            message: "lease not found".to_string(),
        };
        assert!(e.is_not_found());
    }
}
