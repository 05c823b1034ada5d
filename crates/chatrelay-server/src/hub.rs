//! The relay hub: one task that owns the subscriber set and the replay
//! buffer.
//!
//! Everything that touches hub state goes through a single command channel
//! and is applied in arrival order by [`RelayHub::run`]. That ordering is
//! what guarantees a new subscriber sees the replayed history followed by
//! every later message, with no gap and no duplicate.
//!
//! The loop never awaits a subscriber. Each subscriber gets a bounded queue
//! drained by its own writer task; a full or closed queue gets the
//! subscriber dropped on the spot.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chatrelay_shared::{DeliveryError, HubError, LogError, Message};

use crate::logger::RotatingLogger;
use crate::replay::ReplayBuffer;

/// Depth of the hub command channel.
const COMMAND_BUFFER: usize = 256;

/// Durable sink for every published message.
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn append(&self, msg: &Message) -> Result<(), LogError>;
}

#[async_trait]
impl ChatLog for RotatingLogger {
    async fn append(&self, msg: &Message) -> Result<(), LogError> {
        RotatingLogger::append(self, msg).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live registration. `messages` yields the replayed history first,
/// then live messages; it ends when the hub drops the subscriber.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub messages: mpsc::Receiver<Arc<Message>>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub replay_capacity: usize,
    /// Live queue depth per subscriber, on top of room for a full replay.
    pub subscriber_queue: usize,
}

enum HubCommand {
    Subscribe(oneshot::Sender<Subscription>),
    Unsubscribe(SubscriberId),
    Publish(Message),
    Snapshot(oneshot::Sender<Vec<Message>>),
    SubscriberCount(oneshot::Sender<usize>),
}

/// Cloneable entry point into the hub task.
#[derive(Clone, Debug)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Register a new subscriber. The returned queue already holds the
    /// current replay buffer, oldest first.
    pub async fn subscribe(&self) -> Result<Subscription, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Subscribe(reply)).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Remove a subscriber. Unknown or already removed ids are ignored.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), HubError> {
        self.send(HubCommand::Unsubscribe(id)).await
    }

    pub async fn publish(&self, msg: Message) -> Result<(), HubError> {
        self.send(HubCommand::Publish(msg)).await
    }

    /// Copy of the replay buffer, oldest first.
    pub async fn snapshot(&self) -> Result<Vec<Message>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    pub async fn subscriber_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::SubscriberCount(reply)).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

pub struct RelayHub {
    commands: mpsc::Receiver<HubCommand>,
    log: Arc<dyn ChatLog>,
    buffer: ReplayBuffer,
    subscribers: HashMap<SubscriberId, mpsc::Sender<Arc<Message>>>,
    subscriber_queue: usize,
    next_id: u64,
}

impl RelayHub {
    pub fn new(config: HubConfig, log: Arc<dyn ChatLog>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let hub = Self {
            commands: rx,
            log,
            buffer: ReplayBuffer::new(config.replay_capacity),
            subscribers: HashMap::new(),
            subscriber_queue: config.subscriber_queue.max(1),
            next_id: 0,
        };
        (hub, HubHandle { commands: tx })
    }

    /// Process commands until cancelled or until every handle is dropped.
    ///
    /// A command that has been picked up always runs to completion, so a
    /// publish is never half-applied on shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            replay_capacity = self.buffer.capacity(),
            subscriber_queue = self.subscriber_queue,
            "Relay hub started"
        );

        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command).await;
        }

        info!(
            subscribers = self.subscribers.len(),
            buffered = self.buffer.len(),
            "Relay hub stopped"
        );
        // Dropping the senders closes every subscriber queue.
        self.subscribers.clear();
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Subscribe(reply) => self.subscribe(reply),
            HubCommand::Unsubscribe(id) => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(subscriber = %id, remaining = self.subscribers.len(), "Subscriber left");
                }
            }
            HubCommand::Publish(msg) => self.publish(msg).await,
            HubCommand::Snapshot(reply) => {
                let _ = reply.send(self.buffer.snapshot());
            }
            HubCommand::SubscriberCount(reply) => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn subscribe(&mut self, reply: oneshot::Sender<Subscription>) {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;

        // Room for a full replay, so the history below always fits.
        let (tx, rx) = mpsc::channel(self.buffer.capacity() + self.subscriber_queue);
        for msg in self.buffer.iter() {
            if let Err(e) = tx.try_send(Arc::clone(msg)) {
                warn!(subscriber = %id, error = %e, "Replay failed, not registering");
                return;
            }
        }

        if reply.send(Subscription { id, messages: rx }).is_err() {
            debug!(subscriber = %id, "Subscriber went away before registration completed");
            return;
        }

        self.subscribers.insert(id, tx);
        debug!(
            subscriber = %id,
            replayed = self.buffer.len(),
            total = self.subscribers.len(),
            "Subscriber joined"
        );
    }

    /// Buffer, log, then deliver. A log failure is reported but does not
    /// stop delivery.
    async fn publish(&mut self, msg: Message) {
        let msg = Arc::new(msg);
        self.buffer.push(Arc::clone(&msg));

        if let Err(e) = self.log.append(&msg).await {
            warn!(message = %msg.id(), error = %e, "Chat log append failed");
        }

        let mut failed = Vec::new();
        for (id, tx) in &self.subscribers {
            if let Err(e) = tx.try_send(Arc::clone(&msg)) {
                let reason = match e {
                    TrySendError::Full(_) => DeliveryError::QueueFull,
                    TrySendError::Closed(_) => DeliveryError::Closed,
                };
                failed.push((*id, reason));
            }
        }

        for (id, reason) in failed {
            self.subscribers.remove(&id);
            warn!(subscriber = %id, error = %reason, "Dropping subscriber");
        }
    }
}
