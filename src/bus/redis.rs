//! Redis-backed bus
//!
//! One multiplexed connection serves all publishes; each subscription gets
//! its own pub/sub connection, torn down when the subscription is dropped.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

use super::{ensure_topic, Bus, BusSubscription};

const SUBSCRIPTION_CAPACITY: usize = 256;

pub struct RedisBus {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBus {
    /// Connect and verify the server responds.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| Error::Bus(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        ensure_topic(topic)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(topic, payload)
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BusSubscription> {
        ensure_topic(topic)?;
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;

        let (tx, messages) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let topic = topic.to_string();

        // Holding the pub/sub connection inside the pump keeps the
        // subscription alive; aborting the pump drops and closes it.
        let pump = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        debug!(topic = %topic, "Unreadable bus payload: {}", err);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(BusSubscription::new(messages, pump))
    }
}
