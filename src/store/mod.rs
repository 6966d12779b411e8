//! Channel and subscriber persistence
//!
//! Narrow store traits over the relational database, plus in-memory
//! implementations used in development and tests. `add` is idempotent in the
//! sense that a duplicate unique key surfaces as the recoverable
//! [`Error::AlreadyExists`](crate::error::Error::AlreadyExists).

mod memory;
mod postgres;

pub use memory::{MemoryChannelStore, MemorySubscriberStore};
pub use postgres::{connect, setup_schema, PgChannelStore, PgSubscriberStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// How the identity was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberKind {
    /// Logged in with a password; backed by a `subscriber` row.
    Registered,
    /// Guest identified only by a display name.
    #[default]
    Anonymous,
}

/// A chat participant. Identity is immutable for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Subscriber {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: SubscriberKind,

    /// bcrypt hash; never serialized onto the wire.
    #[serde(skip)]
    pub password_hash: Option<String>,
}

impl Subscriber {
    /// A guest identity with a server-generated id.
    pub fn anonymous(name: impl Into<String>, email: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            email,
            kind: SubscriberKind::Anonymous,
            password_hash: None,
        }
    }

    /// A registered identity restored from a verified token.
    pub fn registered(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            kind: SubscriberKind::Registered,
            password_hash: None,
        }
    }
}

/// A persisted channel row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub private: bool,
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Insert a channel row; duplicate names yield `Error::AlreadyExists`.
    async fn add(&self, channel: &ChannelRecord) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<ChannelRecord>>;

    async fn get_all(&self) -> Result<Vec<ChannelRecord>>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Insert a subscriber row; duplicate id or name yields
    /// `Error::AlreadyExists`.
    async fn add(&self, subscriber: &Subscriber) -> Result<()>;

    /// Record an anonymous identity in the `transient` table.
    async fn add_transient(&self, subscriber: &Subscriber) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Subscriber>>;

    async fn get_by_name(&self, name: &str) -> Result<Option<Subscriber>>;

    async fn get_all(&self) -> Result<Vec<Subscriber>>;

    async fn remove(&self, id: &str) -> Result<()>;
}
