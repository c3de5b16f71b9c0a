//! In-process transport backed by tokio channels.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Transport, TransportError};

/// An outbound event captured by [`LocalTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedEvent {
    pub event: String,
    pub first: String,
    pub second: String,
}

/// Transport whose peer lives in the same process.
///
/// Inbound messages are injected with [`LocalTransport::publish`]; outbound
/// events are delivered to the receiver returned by [`LocalTransport::new`].
pub struct LocalTransport {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
    emitted_tx: mpsc::UnboundedSender<EmittedEvent>,
}

impl LocalTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EmittedEvent>) {
        let (emitted_tx, emitted_rx) = mpsc::unbounded_channel();
        let transport = Self {
            subscribers: Mutex::new(HashMap::new()),
            emitted_tx,
        };
        (transport, emitted_rx)
    }

    /// Deliver `payload` to every live subscriber of `event`. Returns how many
    /// received it.
    pub fn publish(&self, event: &str, payload: &str) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = subscribers.get_mut(event) else {
            trace!(event, "No subscribers for event");
            return 0;
        };
        subs.retain(|tx| tx.send(payload.to_string()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            subscribers.remove(event);
        }
        delivered
    }

    /// Live subscribers of `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers
            .get(event)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

impl Transport for LocalTransport {
    fn subscribe(&self, event: &str) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        if event.is_empty() {
            return Err(TransportError::Subscribe {
                event: String::new(),
                reason: "empty event name".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(tx);
        debug!(event, "Subscribed to inbound event");
        Ok(rx)
    }

    fn emit(&self, event: &str, first: &str, second: &str) -> Result<(), TransportError> {
        self.emitted_tx
            .send(EmittedEvent {
                event: event.to_string(),
                first: first.to_string(),
                second: second.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }
}
