//! In-memory stores for development and tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{ChannelRecord, ChannelStore, Subscriber, SubscriberStore};

/// Channel rows held in a process-local map.
#[derive(Default)]
pub struct MemoryChannelStore {
    rows: Mutex<HashMap<String, ChannelRecord>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn add(&self, channel: &ChannelRecord) -> Result<()> {
        let mut rows = self.rows.lock().expect("channel store lock");
        if rows.contains_key(&channel.name) {
            return Err(Error::AlreadyExists(channel.name.clone()));
        }
        rows.insert(channel.name.clone(), channel.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<ChannelRecord>> {
        Ok(self.rows.lock().expect("channel store lock").get(name).cloned())
    }

    async fn get_all(&self) -> Result<Vec<ChannelRecord>> {
        Ok(self
            .rows
            .lock()
            .expect("channel store lock")
            .values()
            .cloned()
            .collect())
    }
}

/// Subscriber rows held in a process-local map.
#[derive(Default)]
pub struct MemorySubscriberStore {
    rows: Mutex<HashMap<String, Subscriber>>,
    transient: Mutex<HashMap<String, Subscriber>>,
}

impl MemorySubscriberStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded anonymous identities.
    pub fn transient_count(&self) -> usize {
        self.transient.lock().expect("subscriber store lock").len()
    }
}

#[async_trait]
impl SubscriberStore for MemorySubscriberStore {
    async fn add(&self, subscriber: &Subscriber) -> Result<()> {
        let mut rows = self.rows.lock().expect("subscriber store lock");
        if rows.contains_key(&subscriber.id)
            || rows.values().any(|row| row.name == subscriber.name)
        {
            return Err(Error::AlreadyExists(subscriber.name.clone()));
        }
        rows.insert(subscriber.id.clone(), subscriber.clone());
        Ok(())
    }

    async fn add_transient(&self, subscriber: &Subscriber) -> Result<()> {
        let mut rows = self.transient.lock().expect("subscriber store lock");
        if rows.contains_key(&subscriber.id) {
            return Err(Error::AlreadyExists(subscriber.id.clone()));
        }
        rows.insert(subscriber.id.clone(), subscriber.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Subscriber>> {
        Ok(self.rows.lock().expect("subscriber store lock").get(id).cloned())
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Subscriber>> {
        Ok(self
            .rows
            .lock()
            .expect("subscriber store lock")
            .values()
            .find(|row| row.name == name)
            .cloned())
    }

    async fn get_all(&self) -> Result<Vec<Subscriber>> {
        Ok(self
            .rows
            .lock()
            .expect("subscriber store lock")
            .values()
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.rows.lock().expect("subscriber store lock").remove(id);
        Ok(())
    }
}
