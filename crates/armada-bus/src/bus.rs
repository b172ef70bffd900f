//! Bus trait and the in-process implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),
}

/// A subscription to one subject. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Receive the next message, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Stateless publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;
    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;
}

/// In-process bus: subject → live subscriber channels.
///
/// Closed subscribers are pruned on publish, so a dropped `Subscription`
/// is effectively unsubscribed.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let mut topics = self.topics.lock().unwrap();
        if let Some(subscribers) = topics.get_mut(subject) {
            subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
            if subscribers.is_empty() {
                topics.remove(subject);
            }
        } else {
            trace!(%subject, "publish with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription {
            subject: subject.to_string(),
            rx,
        })
    }
}
