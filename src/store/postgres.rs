//! PostgreSQL-backed stores

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

use super::{ChannelRecord, ChannelStore, Subscriber, SubscriberKind, SubscriberStore};

/// Connect and spawn the connection driver.
pub async fn connect(config: &DatabaseConfig) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(&config.conn_string(), NoTls).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Create the schema described in the deployment docs. Idempotent.
pub async fn setup_schema(client: &Client) -> Result<()> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS channel (
                id VARCHAR(255) NOT NULL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                private INT NULL
            );
            CREATE TABLE IF NOT EXISTS subscriber (
                id VARCHAR(255) NOT NULL PRIMARY KEY,
                name VARCHAR(255) UNIQUE NOT NULL,
                password VARCHAR(255) NULL,
                email VARCHAR(255) UNIQUE NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE TABLE IF NOT EXISTS transient (
                id VARCHAR(255) NOT NULL PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                email VARCHAR(255) NULL
            );",
        )
        .await?;
    Ok(())
}

fn map_unique_violation(err: tokio_postgres::Error, key: &str) -> Error {
    if err.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        Error::AlreadyExists(key.to_string())
    } else {
        Error::Database(err)
    }
}

pub struct PgChannelStore {
    client: Arc<Client>,
}

impl PgChannelStore {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

fn channel_from_row(row: &Row) -> ChannelRecord {
    let private: Option<i32> = row.get("private");
    ChannelRecord {
        id: row.get("id"),
        name: row.get("name"),
        private: private.unwrap_or(0) != 0,
    }
}

#[async_trait]
impl ChannelStore for PgChannelStore {
    async fn add(&self, channel: &ChannelRecord) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO channel (id, name, private) VALUES ($1, $2, $3)",
                &[&channel.id, &channel.name, &(channel.private as i32)],
            )
            .await
            .map_err(|e| map_unique_violation(e, &channel.name))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<ChannelRecord>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, name, private FROM channel WHERE name = $1",
                &[&name],
            )
            .await?;
        Ok(row.as_ref().map(channel_from_row))
    }

    async fn get_all(&self) -> Result<Vec<ChannelRecord>> {
        let rows = self
            .client
            .query("SELECT id, name, private FROM channel", &[])
            .await?;
        Ok(rows.iter().map(channel_from_row).collect())
    }
}

pub struct PgSubscriberStore {
    client: Arc<Client>,
}

impl PgSubscriberStore {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }
}

fn subscriber_from_row(row: &Row) -> Subscriber {
    Subscriber {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        kind: SubscriberKind::Registered,
        password_hash: row.get("password"),
    }
}

#[async_trait]
impl SubscriberStore for PgSubscriberStore {
    async fn add(&self, subscriber: &Subscriber) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO subscriber (id, name, password, email)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &subscriber.id,
                    &subscriber.name,
                    &subscriber.password_hash,
                    &subscriber.email,
                ],
            )
            .await
            .map_err(|e| map_unique_violation(e, &subscriber.name))?;
        Ok(())
    }

    async fn add_transient(&self, subscriber: &Subscriber) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO transient (id, name, email) VALUES ($1, $2, $3)",
                &[&subscriber.id, &subscriber.name, &subscriber.email],
            )
            .await
            .map_err(|e| map_unique_violation(e, &subscriber.id))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Subscriber>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, name, password, email FROM subscriber WHERE id = $1",
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(subscriber_from_row))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Subscriber>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, name, password, email FROM subscriber WHERE name = $1",
                &[&name],
            )
            .await?;
        Ok(row.as_ref().map(subscriber_from_row))
    }

    async fn get_all(&self) -> Result<Vec<Subscriber>> {
        let rows = self
            .client
            .query("SELECT id, name, password, email FROM subscriber", &[])
            .await?;
        Ok(rows.iter().map(subscriber_from_row).collect())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.client
            .execute("DELETE FROM subscriber WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }
}
