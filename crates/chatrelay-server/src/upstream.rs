//! Upstream connection: reads chat frames from the source WebSocket and
//! publishes them to the hub.
//!
//! The connector keeps one connection open. When it fails or drops, it
//! waits a fixed delay and dials again, forever, until shutdown.
//! Subscribers never see the outage except as a pause in messages.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatrelay_shared::{decode_upstream_frame, ConnectError};

use crate::hub::HubHandle;

type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a receive loop ended without an error.
enum Stop {
    Cancelled,
    HubStopped,
}

pub struct UpstreamConnector {
    url: String,
    hub: HubHandle,
    reconnect_delay: Duration,
}

impl UpstreamConnector {
    pub fn new(url: impl Into<String>, hub: HubHandle, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            hub,
            reconnect_delay,
        }
    }

    /// Open a connection to the upstream endpoint.
    pub async fn connect(&self) -> Result<UpstreamStream, ConnectError> {
        let request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::InvalidUrl(format!("{}: {e}", self.url)))?;

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        Ok(stream)
    }

    /// Connect, relay, and reconnect after `reconnect_delay` on any failure.
    /// Returns on cancellation or once the hub has stopped.
    pub async fn run(self, cancel: CancellationToken) {
        info!(url = %self.url, delay = ?self.reconnect_delay, "Upstream connector started");

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    info!(url = %self.url, "Connected to upstream");
                    match self.receive(stream, &cancel).await {
                        Ok(Stop::Cancelled) => break,
                        Ok(Stop::HubStopped) => {
                            warn!("Relay hub stopped, closing upstream connection");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Upstream connection dropped"),
                    }
                }
                Err(e) => warn!(error = %e, "Upstream connect failed"),
            }

            debug!(delay = ?self.reconnect_delay, "Waiting before reconnecting to upstream");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Upstream connector stopped");
    }

    async fn receive(
        &self,
        stream: UpstreamStream,
        cancel: &CancellationToken,
    ) -> Result<Stop, ConnectError> {
        let (mut sink, mut frames) = stream.split();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(Stop::Cancelled);
                }
                frame = frames.next() => frame,
            };

            let data = match frame {
                Some(Ok(WsMessage::Text(text))) => text.as_bytes().to_vec(),
                Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(frame = ?frame, "Upstream sent close");
                    return Err(ConnectError::Closed);
                }
                // Ping replies are handled by tungstenite.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ConnectError::Lost(e.to_string())),
                None => return Err(ConnectError::Closed),
            };

            let decoded = decode_upstream_frame(&data);
            if let Some(issue) = &decoded.issue {
                debug!(
                    message = %decoded.message.id(),
                    issue = %issue,
                    "Upstream frame relayed with best-effort fields"
                );
            }

            if self.hub.publish(decoded.message).await.is_err() {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(Stop::HubStopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use chatrelay_shared::constants::UPSTREAM_AUTHOR;

    use crate::hub::{ChatLog, HubConfig, RelayHub};
    use chatrelay_shared::{LogError, Message};

    struct NullLog;

    #[async_trait::async_trait]
    impl ChatLog for NullLog {
        async fn append(&self, _msg: &Message) -> Result<(), LogError> {
            Ok(())
        }
    }

    fn spawn_hub(cancel: &CancellationToken) -> HubHandle {
        let config = HubConfig {
            replay_capacity: 10,
            subscriber_queue: 16,
        };
        let (hub, handle) = RelayHub::new(config, Arc::new(NullLog));
        tokio::spawn(hub.run(cancel.clone()));
        handle
    }

    async fn next_text(sub: &mut crate::hub::Subscription) -> Arc<Message> {
        tokio::time::timeout(Duration::from_secs(5), sub.messages.recv())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_reconnects_after_drop_and_resumes_for_existing_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel::<Instant>();

        // First connection sends A then drops; the second sends B and stays open.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            accepted_tx.send(Instant::now()).unwrap();
            ws.send(WsMessage::Text(r#"{"username":"alice","msg":"A"}"#.into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            drop(ws);

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            accepted_tx.send(Instant::now()).unwrap();
            ws.send(WsMessage::Text(r#"{"username":"bob","msg":"B"}"#.into()))
                .await
                .unwrap();
            // Hold the connection open.
            while ws.next().await.is_some() {}
        });

        let cancel = CancellationToken::new();
        let hub = spawn_hub(&cancel);
        let mut sub = hub.subscribe().await.unwrap();

        let delay = Duration::from_millis(200);
        let connector = UpstreamConnector::new(format!("ws://{addr}"), hub.clone(), delay);
        let connector_task = tokio::spawn(connector.run(cancel.clone()));

        let a = next_text(&mut sub).await;
        assert_eq!((a.author(), a.text()), ("alice", "A"));
        let b = next_text(&mut sub).await;
        assert_eq!((b.author(), b.text()), ("bob", "B"));

        let first = accepted_rx.recv().await.unwrap();
        let second = accepted_rx.recv().await.unwrap();
        assert!(second.duration_since(first) >= delay);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), connector_task)
            .await
            .expect("connector did not stop")
            .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_unparseable_frames_are_relayed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(WsMessage::Text("not json at all".into())).await.unwrap();
            ws.send(WsMessage::Binary(vec![0xde, 0xad].into())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let cancel = CancellationToken::new();
        let hub = spawn_hub(&cancel);
        let mut sub = hub.subscribe().await.unwrap();

        let connector =
            UpstreamConnector::new(format!("ws://{addr}"), hub.clone(), Duration::from_secs(5));
        tokio::spawn(connector.run(cancel.clone()));

        let text = next_text(&mut sub).await;
        assert_eq!(text.author(), UPSTREAM_AUTHOR);
        assert_eq!(text.text(), "not json at all");

        let binary = next_text(&mut sub).await;
        assert_eq!(binary.author(), UPSTREAM_AUTHOR);
        assert!(!binary.text().is_empty());

        cancel.cancel();
        server.abort();
    }

    #[tokio::test]
    async fn test_invalid_url_is_a_connect_error() {
        let cancel = CancellationToken::new();
        let hub = spawn_hub(&cancel);
        let connector = UpstreamConnector::new("not a url", hub, Duration::from_secs(1));
        assert!(matches!(
            connector.connect().await,
            Err(ConnectError::InvalidUrl(_))
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        // Nothing listens on this port once the listener is dropped.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let cancel = CancellationToken::new();
        let hub = spawn_hub(&cancel);
        let connector =
            UpstreamConnector::new(format!("ws://{addr}"), hub, Duration::from_secs(3600));
        let task = tokio::spawn(connector.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connector stuck in backoff")
            .unwrap();
    }
}
