use crate::config::SqliteTopicConfig;
use crate::{ClaimedMessage, TopicError};
use async_trait::async_trait;
use chrono::Utc;
use evochora_config::{registry::Registry, Configurable};
use evochora_error::{EvochoraError, WrappedSqlxError};
use evochora_sqlite::SqliteDb;
use sqlx::Row;
use std::time::Duration;

/// Durable topic backend. Messages and claims live in two tables; a claim
/// row per (message, consumer group) carries the lease.
///
/// The pool behind [`SqliteDb`] is capped at one connection, so the
/// read-then-claim transaction serializes across competing consumers.
#[derive(Clone, Debug)]
pub struct SqliteTopic {
    db: SqliteDb,
    claim_timeout: Duration,
    poll_interval: Duration,
}

impl SqliteTopic {
    pub async fn new(
        db: SqliteDb,
        claim_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<SqliteTopic, TopicError> {
        let topic = SqliteTopic {
            db,
            claim_timeout,
            poll_interval,
        };
        topic.ensure_tables().await?;
        Ok(topic)
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn ensure_tables(&self) -> Result<(), TopicError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topic_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                published_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_topic_messages_topic ON topic_messages(topic, id)",
        )
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topic_claims (
                message_id INTEGER NOT NULL,
                consumer_group TEXT NOT NULL,
                claimed_at_ms INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 1,
                acked INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, consumer_group)
            )
            "#,
        )
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        Ok(())
    }

    pub(crate) async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TopicError> {
        sqlx::query(
            "INSERT INTO topic_messages (topic, payload, published_at_ms) VALUES (?, ?, ?)",
        )
        .bind(topic)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        Ok(())
    }

    /// Claim the lowest-id message without a live claim for the group.
    /// Expired claims are taken over in place, bumping `delivery_count`.
    pub(crate) async fn claim_next(
        &self,
        topic: &str,
        consumer_group: &str,
        claim_timeout: Duration,
    ) -> Result<Option<ClaimedMessage>, TopicError> {
        let now_ms = Utc::now().timestamp_millis();
        let expired_before = now_ms - claim_timeout.as_millis() as i64;

        let mut tx = self.db.get_conn().begin().await.map_err(WrappedSqlxError)?;
        let row = sqlx::query(
            r#"
            SELECT m.id AS id, m.payload AS payload, c.delivery_count AS delivery_count
            FROM topic_messages m
            LEFT JOIN topic_claims c
                ON c.message_id = m.id AND c.consumer_group = ?
            WHERE m.topic = ?
              AND (c.message_id IS NULL OR (c.acked = 0 AND c.claimed_at_ms <= ?))
            ORDER BY m.id ASC
            LIMIT 1
            "#,
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(expired_before)
        .fetch_optional(&mut *tx)
        .await
        .map_err(WrappedSqlxError)?;

        let Some(row) = row else {
            tx.commit().await.map_err(WrappedSqlxError)?;
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let payload: Vec<u8> = row.get("payload");
        let previous_deliveries: Option<i64> = row.get("delivery_count");
        let delivery_count = previous_deliveries.unwrap_or(0) + 1;
        if previous_deliveries.is_some() {
            tracing::warn!(message_id = id, topic, consumer_group, "redelivering expired claim");
        }

        sqlx::query(
            r#"
            INSERT INTO topic_claims (message_id, consumer_group, claimed_at_ms, delivery_count, acked)
            VALUES (?, ?, ?, ?, 0)
            ON CONFLICT (message_id, consumer_group)
            DO UPDATE SET claimed_at_ms = excluded.claimed_at_ms,
                          delivery_count = excluded.delivery_count
            "#,
        )
        .bind(id)
        .bind(consumer_group)
        .bind(now_ms)
        .bind(delivery_count)
        .execute(&mut *tx)
        .await
        .map_err(WrappedSqlxError)?;
        tx.commit().await.map_err(WrappedSqlxError)?;

        Ok(Some(ClaimedMessage {
            id,
            payload,
            delivery_count,
        }))
    }

    pub(crate) async fn ack(&self, message_id: i64, consumer_group: &str) -> Result<(), TopicError> {
        let result = sqlx::query(
            "UPDATE topic_claims SET acked = 1 WHERE message_id = ? AND consumer_group = ?",
        )
        .bind(message_id)
        .bind(consumer_group)
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        if result.rows_affected() == 0 {
            return Err(TopicError::NotClaimed(message_id));
        }
        Ok(())
    }

    pub(crate) async fn list_topic_names(&self) -> Result<Vec<String>, TopicError> {
        let rows = sqlx::query("SELECT DISTINCT topic FROM topic_messages ORDER BY topic")
            .fetch_all(self.db.get_conn())
            .await
            .map_err(WrappedSqlxError)?;
        Ok(rows.into_iter().map(|row| row.get("topic")).collect())
    }

    pub(crate) async fn delete_topic(&self, topic: &str) -> Result<u64, TopicError> {
        sqlx::query(
            "DELETE FROM topic_claims WHERE message_id IN (SELECT id FROM topic_messages WHERE topic = ?)",
        )
        .bind(topic)
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        let result = sqlx::query("DELETE FROM topic_messages WHERE topic = ?")
            .bind(topic)
            .execute(self.db.get_conn())
            .await
            .map_err(WrappedSqlxError)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Configurable<SqliteTopicConfig> for SqliteTopic {
    async fn try_from_config(
        config: &SqliteTopicConfig,
        registry: &Registry,
    ) -> Result<Self, Box<dyn EvochoraError>> {
        // Reuse a registered pool when one exists so the topic and the
        // metadata store can share a database file.
        let db = match registry.get::<SqliteDb>() {
            Ok(db) => db,
            Err(_) => {
                let db = SqliteDb::try_from_config(&config.db, registry).await?;
                registry.register(db.clone());
                db
            }
        };
        SqliteTopic::new(db, config.claim_timeout, config.poll_interval)
            .await
            .map_err(|err| err.boxed())
    }
}
