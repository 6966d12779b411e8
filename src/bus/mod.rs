//! Pub/sub transport between relay nodes
//!
//! The bus replicates every published frame to all nodes subscribed to the
//! topic. Delivery is at-most-once and FIFO per topic per publisher,
//! whatever the transport provides; the relay never relies on more.

mod memory;
mod redis;

pub use self::redis::RedisBus;
pub use memory::MemoryBus;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Thin adapter over the external pub/sub transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish one frame to a topic.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Open a stream of frames published to a topic.
    async fn subscribe(&self, topic: &str) -> Result<BusSubscription>;
}

/// A live topic subscription. Dropping it unsubscribes.
pub struct BusSubscription {
    messages: mpsc::Receiver<Vec<u8>>,
    pump: JoinHandle<()>,
}

impl BusSubscription {
    pub(crate) fn new(messages: mpsc::Receiver<Vec<u8>>, pump: JoinHandle<()>) -> Self {
        Self { messages, pump }
    }

    /// Next frame, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.messages.recv().await
    }

    /// Unsubscribe. Frames already buffered are discarded.
    pub fn close(&mut self) {
        self.pump.abort();
        self.messages.close();
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

pub(crate) fn ensure_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Bus("Empty topic name".to_string()));
    }
    Ok(())
}
