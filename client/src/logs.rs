//! Log and event streams from a lease.
//!
//! Both are a WebSocket of JSON text messages. The provider pings every
//! `stream.ping_period`; if no ping arrives within the client's keepalive
//! window ([`ProviderClient::with_keepalive`]) the stream gives up with
//! [`ClientError::KeepaliveTimeout`].

use std::marker::PhantomData;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};

use leasegw::lease::LeaseId;
use leasegw::protocol::{LeaseEvent, ServiceLogMessage, CLOSE_NORMAL};

use crate::client::{ProviderClient, WsStream};
use crate::error::ClientError;

/// Log lines tagged with their source, in per-source order.
pub type ServiceLogs = JsonStream<ServiceLogMessage>;
/// Lease events.
pub type LeaseEvents = JsonStream<LeaseEvent>;

/// Filter and tail settings for [`ProviderClient::lease_logs`].
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Empty means every service.
    pub services: Vec<String>,
    pub follow: bool,
    /// Lines of history per source; `None` for all of it.
    pub tail: Option<u64>,
}

/// A WebSocket of JSON text messages.
pub struct JsonStream<T, S = WsStream> {
    ws: S,
    keepalive: Duration,
    deadline: Instant,
    _item: PhantomData<fn() -> T>,
}

impl<T, S> JsonStream<T, S>
where
    T: DeserializeOwned,
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    fn new(ws: S, keepalive: Duration) -> Self {
        Self {
            ws,
            keepalive,
            deadline: Instant::now() + keepalive,
            _item: PhantomData,
        }
    }

    /// Next message, or `None` once the provider closes the stream normally.
    ///
    /// Any close code other than 1000 becomes [`ClientError::Closed`] with
    /// the provider's reason, e.g. 4001 when the lease has nothing to stream.
    pub async fn next(&mut self) -> Result<Option<T>, ClientError> {
        loop {
            let msg = tokio::select! {
                () = tokio::time::sleep_until(self.deadline) => {
                    return Err(ClientError::KeepaliveTimeout);
                }
                msg = self.ws.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(text.as_str())
                        .map(Some)
                        .map_err(|e| ClientError::Protocol(format!("malformed message: {e}")));
                }
                Some(Ok(Message::Ping(_))) => self.deadline = Instant::now() + self.keepalive,
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if u16::from(frame.code) != CLOSE_NORMAL => {
                            Err(ClientError::Closed {
                                code: frame.code.into(),
                                reason: frame.reason.as_str().to_string(),
                            })
                        }
                        _ => Ok(None),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ClientError::Closed {
                        code: 1006,
                        reason: "connection dropped without a close frame".to_string(),
                    })
                }
            }
        }
    }

    /// Collect every remaining message. Only sensible without `follow`.
    pub async fn collect(mut self) -> Result<Vec<T>, ClientError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

impl ProviderClient {
    /// `GET /lease/{dseq}/{gseq}/{oseq}/logs`
    pub async fn lease_logs(
        &self,
        lease: &LeaseId,
        options: &LogOptions,
    ) -> Result<ServiceLogs, ClientError> {
        let mut url = self.url("wss", &format!("/lease/{}/logs", lease.route_path()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("follow", &options.follow.to_string());
            query.append_pair(
                "tail",
                &options.tail.map_or_else(|| "-1".to_string(), |n| n.to_string()),
            );
            if !options.services.is_empty() {
                query.append_pair("service", &options.services.join(","));
            }
        }
        let ws = self.websocket(&url).await?;
        Ok(JsonStream::new(ws, self.keepalive()))
    }

    /// `GET /lease/{dseq}/{gseq}/{oseq}/kubeevents`
    pub async fn lease_events(
        &self,
        lease: &LeaseId,
        services: &[String],
        follow: bool,
    ) -> Result<LeaseEvents, ClientError> {
        let mut url = self.url("wss", &format!("/lease/{}/kubeevents", lease.route_path()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("follow", &follow.to_string());
            if !services.is_empty() {
                query.append_pair("service", &services.join(","));
            }
        }
        let ws = self.websocket(&url).await?;
        Ok(JsonStream::new(ws, self.keepalive()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testserver::{service, socket_pair, TestGateway};
    use futures::SinkExt;
    use leasegw::protocol::PONG_WAIT;

    fn log_file(lines: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), lines).unwrap();
        file
    }

    #[tokio::test]
    async fn history_then_normal_close() {
        let file = log_file("one\ntwo\nthree\n");
        let gw = TestGateway::start(vec![service("web", vec![file.path().to_path_buf()])]).await;
        let options = LogOptions {
            tail: Some(2),
            ..LogOptions::default()
        };
        let lines = gw
            .client()
            .lease_logs(&gw.lease(), &options)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, ["two", "three"]);
        assert!(lines.iter().all(|l| l.name == "web-0"));
    }

    #[tokio::test]
    async fn nothing_to_stream_closes_with_4001() {
        let mut stopped = service("web", vec!["/nonexistent".into()]);
        stopped.running = false;
        let gw = TestGateway::start(vec![stopped]).await;
        let mut logs = gw
            .client()
            .lease_logs(&gw.lease(), &LogOptions::default())
            .await
            .unwrap();
        match logs.next().await {
            Err(ClientError::Closed { code, .. }) => assert_eq!(code, 4001),
            other => panic!("expected close 4001, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_service_filter_is_rejected_before_upgrade() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let options = LogOptions {
            services: vec!["web".to_string(), String::new()],
            ..LogOptions::default()
        };
        let err = gw
            .client()
            .lease_logs(&gw.lease(), &options)
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, ClientError::Status { status: 400, ref message } if message.contains("trailing comma")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn events_record_shell_activity() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        let client = gw.client();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let io = crate::ShellIo {
            stdin: None::<tokio::io::Empty>,
            stdout: &mut out,
            stderr: &mut err,
            resize: None,
        };
        let request = crate::ShellRequest {
            service: "web".to_string(),
            pod_index: 1,
            cmd: vec!["true".to_string()],
            tty: false,
        };
        client
            .lease_shell(&gw.lease(), &request, io, tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();

        let events = client
            .lease_events(&gw.lease(), &[], false)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.reason == "Exec" && e.object.name == "web-1"));
        assert!(events[1].note.contains("exited with code 0"));
    }

    #[tokio::test]
    async fn silent_provider_trips_the_keepalive() {
        let (client, _server) = socket_pair().await;
        let mut stream =
            JsonStream::<ServiceLogMessage, _>::new(client, Duration::from_millis(100));
        let res = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(matches!(res, Err(ClientError::KeepaliveTimeout)), "{res:?}");
    }

    #[tokio::test]
    async fn pings_extend_the_keepalive_window() {
        let (client, mut server) = socket_pair().await;
        let provider = tokio::spawn(async move {
            for _ in 0..4 {
                tokio::time::sleep(Duration::from_millis(150)).await;
                server.send(Message::Ping(bytes::Bytes::new())).await.unwrap();
            }
            let line = r#"{"name":"web-0","message":"still here"}"#;
            server.send(Message::text(line.to_string())).await.unwrap();
            server.send(Message::Close(None)).await.unwrap();
            server
        });
        let lines = JsonStream::<ServiceLogMessage, _>::new(client, Duration::from_millis(400))
            .collect()
            .await
            .unwrap();
        assert_eq!(
            lines,
            [ServiceLogMessage {
                name: "web-0".to_string(),
                message: "still here".to_string(),
            }]
        );
        drop(provider.await.unwrap());
    }

    #[tokio::test]
    async fn keepalive_window_is_configurable() {
        let gw = TestGateway::start(vec![service("web", Vec::new())]).await;
        assert_eq!(gw.client().keepalive(), PONG_WAIT);
        let client = gw.client().with_keepalive(Duration::from_secs(90));
        assert_eq!(client.keepalive(), Duration::from_secs(90));
    }
}
