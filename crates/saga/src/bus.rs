//! Event bus abstraction and the in-process implementation.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::BusError;
use crate::message::{InboundMessage, MessageEnvelope};

/// Stream of inbound messages produced by [`EventBus::consume`].
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, BusError>> + Send>>;

/// Transport collaborator used by contexts to emit messages and by the
/// worker to receive them.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Declares that `handler_type` wants messages of `message_type`.
    async fn subscribe(&self, _message_type: &str, _handler_type: &str) -> Result<(), BusError> {
        Ok(())
    }

    /// Point-to-point delivery to one consumer.
    async fn send(
        &self,
        envelope: MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), BusError>;

    /// Broadcast delivery to every subscriber.
    async fn publish(
        &self,
        envelope: MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), BusError>;

    /// Opens the inbound stream. It ends when `cancel` fires.
    async fn consume(&self, cancel: CancellationToken) -> Result<InboundStream, BusError>;
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<String, Vec<String>>,
    queue: VecDeque<InboundMessage>,
    history: Vec<MessageEnvelope>,
}

/// In-process event bus.
///
/// `publish` enqueues one copy per subscribed handler, stamped with that
/// handler's type; `send` enqueues a single copy. Everything emitted is
/// also kept in a history for inspection. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, messages: Vec<InboundMessage>) {
        let count = messages.len();
        self.lock().queue.extend(messages);
        for _ in 0..count {
            self.notify.notify_one();
        }
    }

    /// Removes and returns every queued message, oldest first.
    pub fn take_pending(&self) -> Vec<InboundMessage> {
        self.lock().queue.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Every envelope sent or published so far, in emission order.
    pub fn history(&self) -> Vec<MessageEnvelope> {
        self.lock().history.clone()
    }

    /// Emitted envelopes of one message type.
    pub fn history_of(&self, message_type: &str) -> Vec<MessageEnvelope> {
        self.lock()
            .history
            .iter()
            .filter(|e| e.message_type == message_type)
            .cloned()
            .collect()
    }

    pub fn subscribers(&self, message_type: &str) -> Vec<String> {
        self.lock()
            .subscriptions
            .get(message_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn subscribe(&self, message_type: &str, handler_type: &str) -> Result<(), BusError> {
        let mut state = self.lock();
        let handlers = state
            .subscriptions
            .entry(message_type.to_string())
            .or_default();
        if !handlers.iter().any(|h| h == handler_type) {
            handlers.push(handler_type.to_string());
        }
        Ok(())
    }

    async fn send(
        &self,
        envelope: MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Transport("send cancelled".into()));
        }

        let inbound = {
            let mut state = self.lock();
            let subscribed = state
                .subscriptions
                .get(&envelope.message_type)
                .is_some_and(|handlers| !handlers.is_empty());
            if envelope.handler_type.is_none() && !subscribed {
                return Err(BusError::NoSubscriber {
                    message_type: envelope.message_type,
                });
            }
            state.history.push(envelope.clone());
            envelope.to_inbound()?
        };

        tracing::debug!(message_type = %inbound.message_type, "message sent");
        self.enqueue(vec![inbound]);
        Ok(())
    }

    async fn publish(
        &self,
        envelope: MessageEnvelope,
        cancel: &CancellationToken,
    ) -> Result<(), BusError> {
        if cancel.is_cancelled() {
            return Err(BusError::Transport("publish cancelled".into()));
        }

        let copies = {
            let mut state = self.lock();
            let targets = match &envelope.handler_type {
                Some(handler_type) => vec![handler_type.clone()],
                None => state
                    .subscriptions
                    .get(&envelope.message_type)
                    .cloned()
                    .unwrap_or_default(),
            };
            state.history.push(envelope.clone());

            targets
                .into_iter()
                .map(|handler_type| {
                    let mut copy = envelope.clone();
                    copy.handler_type = Some(handler_type);
                    copy.to_inbound()
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        tracing::debug!(
            message_type = %envelope.message_type,
            subscribers = copies.len(),
            "message published"
        );
        self.enqueue(copies);
        Ok(())
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<InboundStream, BusError> {
        let bus = self.clone();
        let stream = futures_util::stream::unfold((bus, cancel), |(bus, cancel)| async move {
            loop {
                let next = bus.lock().queue.pop_front();
                if let Some(message) = next {
                    return Some((Ok(message), (bus, cancel)));
                }
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = bus.notify.notified() => {}
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
