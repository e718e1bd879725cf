use async_trait::async_trait;
use domain::DurableRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store unavailable: {0}")]
    Unavailable(String),
    #[error("message store rejected record: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// 消息的长期存储
#[async_trait]
pub trait MessageStore: Send + Sync {
    // 每条记录都在提交偏移量之前落库；重复投递可能导致同一信封写入多次
    async fn persist(&self, record: &DurableRecord) -> Result<(), StoreError>;
}
