use application::{MessageStore, StoreError};
use async_trait::async_trait;
use domain::DurableRecord;
use sqlx::PgPool;
use tracing::debug;

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => StoreError::Rejected(db.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn persist(&self, record: &DurableRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, log_partition, log_offset, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id)
        .bind(record.envelope.conversation_id().as_str())
        .bind(record.envelope.sender_id().as_str())
        .bind(record.envelope.body().as_str())
        .bind(record.partition)
        .bind(record.offset)
        .bind(record.persisted_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        debug!(id = %record.id, offset = record.offset, "消息已写入数据库");
        Ok(())
    }
}
