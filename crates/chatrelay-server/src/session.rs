//! One downstream WebSocket connection.
//!
//! A session is two tasks. The writer drains the subscriber queue the hub
//! fills and writes each message as a JSON text frame. The reader turns
//! valid inbound frames into publishes. Whichever side stops first takes
//! the other down with it, and the subscriber is always unregistered
//! before the session returns.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatrelay_shared::{DeliveryError, HubError, InboundFrame, Message, MessageRecord};

use crate::hub::{HubHandle, Subscription};

pub struct SubscriberSession {
    hub: HubHandle,
    subscription: Subscription,
    write_timeout: Duration,
}

impl SubscriberSession {
    /// Register with the hub. Called once the WebSocket handshake has
    /// completed; the subscription queue already holds the replay.
    pub async fn register(hub: HubHandle, write_timeout: Duration) -> Result<Self, HubError> {
        let subscription = hub.subscribe().await?;
        info!(subscriber = %subscription.id, "Subscriber connected");
        Ok(Self {
            hub,
            subscription,
            write_timeout,
        })
    }

    /// Serve the connection until either side fails, the peer closes, or
    /// `shutdown` fires.
    pub async fn run(self, socket: WebSocket, shutdown: CancellationToken) {
        let Self {
            hub,
            subscription: Subscription { id, messages },
            write_timeout,
        } = self;

        let (sink, mut frames) = socket.split();
        let done = shutdown.child_token();

        let writer = tokio::spawn({
            let done = done.clone();
            async move {
                let result = write_loop(sink, messages, write_timeout).await;
                done.cancel();
                result
            }
        });

        loop {
            let frame = tokio::select! {
                _ = done.cancelled() => break,
                frame = frames.next() => frame,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => match InboundFrame::parse(text.as_str()) {
                    Ok(inbound) => {
                        if hub.publish(inbound.into_message()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(subscriber = %id, error = %e, "Ignoring inbound frame"),
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(subscriber = %id, error = %e, "Subscriber read failed");
                    break;
                }
            }
        }

        // Dropping the hub side of the queue ends the writer.
        if let Err(e) = hub.unsubscribe(id).await {
            debug!(subscriber = %id, error = %e, "Unsubscribe after hub stop");
        }

        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(subscriber = %id, error = %e, "Subscriber write failed"),
            Err(e) => warn!(subscriber = %id, error = %e, "Subscriber writer task failed"),
        }

        info!(subscriber = %id, "Subscriber disconnected");
    }
}

/// Drain the subscriber queue onto the socket. Sends a close frame once the
/// hub has let go of the queue.
async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut messages: mpsc::Receiver<Arc<Message>>,
    write_timeout: Duration,
) -> Result<(), DeliveryError> {
    while let Some(msg) = messages.recv().await {
        let json = MessageRecord::from(msg.as_ref())
            .to_json()
            .map_err(|e| DeliveryError::WriteFailed(e.to_string()))?;
        send(&mut sink, WsMessage::Text(json.into()), write_timeout).await?;
    }

    send(&mut sink, WsMessage::Close(None), write_timeout).await
}

async fn send(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: WsMessage,
    write_timeout: Duration,
) -> Result<(), DeliveryError> {
    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeliveryError::WriteFailed(e.to_string())),
        Err(_) => Err(DeliveryError::WriteTimeout),
    }
}
