//! In-process bus for development and tests
//!
//! Nodes sharing one `MemoryBus` instance see each other's frames, which
//! lets the multi-node paths run inside a single test process.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::Result;

use super::{ensure_topic, Bus, BusSubscription};

const TOPIC_CAPACITY: usize = 256;

/// Per-topic broadcast fan-out held in a process-local map.
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().expect("bus topics lock");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        ensure_topic(topic)?;
        // No subscribers is not an error; the frame is simply lost,
        // matching pub/sub semantics.
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription> {
        ensure_topic(topic)?;
        let mut upstream = self.sender(topic).subscribe();
        let (tx, messages) = mpsc::channel(TOPIC_CAPACITY);
        let topic = topic.to_string();

        let pump = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(topic = %topic, missed, "Subscriber lagged, frames lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(BusSubscription::new(messages, pump))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = MemoryBus::new();
        let mut first = bus.subscribe("room").await.unwrap();
        let mut second = bus.subscribe("room").await.unwrap();

        bus.publish("room", b"hello".to_vec()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), b"hello");
        assert_eq!(second.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = MemoryBus::new();
        let mut room = bus.subscribe("room").await.unwrap();
        let mut other = bus.subscribe("other").await.unwrap();

        bus.publish("room", b"hello".to_vec()).await.unwrap();
        bus.publish("other", b"goodbye".to_vec()).await.unwrap();

        assert_eq!(room.recv().await.unwrap(), b"hello");
        assert_eq!(other.recv().await.unwrap(), b"goodbye");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("empty-room", b"hello".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_order_preserved_per_topic() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("room").await.unwrap();

        for i in 0..10u8 {
            bus.publish("room", vec![i]).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(sub.recv().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_closed_subscription_stops() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("room").await.unwrap();
        sub.close();
        assert_eq!(sub.recv().await, None);
    }
}
