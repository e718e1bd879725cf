//! 持久化日志端口
//!
//! 追加写入的分区日志（Kafka 或内存实现）对应用层暴露的最小能力：
//! 主题开通、记录追加、按消费者组拉取批次并提交偏移量。

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use config::KafkaConfig;
use thiserror::Error;
use tracing::info;

/// 持久化日志操作错误
#[derive(Error, Debug)]
pub enum LogError {
    /// 连接错误
    #[error("日志连接错误: {message}")]
    Connection { message: String },

    /// 生产者错误
    #[error("向主题 {topic} 追加失败: {message}")]
    Produce { topic: String, message: String },

    /// 消费者错误
    #[error("日志消费错误: {message}")]
    Consume { message: String },

    /// 主题开通错误
    #[error("主题 {topic} 开通失败: {message}")]
    Provision { topic: String, message: String },

    /// 超时错误
    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    Config { message: String },
}

impl LogError {
    pub fn produce(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Produce {
            topic: topic.into(),
            message: message.into(),
        }
    }

    pub fn consume(message: impl Into<String>) -> Self {
        Self::Consume {
            message: message.into(),
        }
    }
}

/// 主题清理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    Delete,
}

impl CleanupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupPolicy::Delete => "delete",
        }
    }
}

/// 主题定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub retention: Duration,
    pub cleanup_policy: CleanupPolicy,
}

/// 主消息主题与死信主题的定义
pub fn topic_specs(config: &KafkaConfig) -> Vec<TopicSpec> {
    vec![
        TopicSpec {
            name: config.messages_topic.clone(),
            partitions: config.partitions,
            replication_factor: config.replication_factor,
            retention: Duration::from_millis(config.messages_retention_ms),
            cleanup_policy: CleanupPolicy::Delete,
        },
        TopicSpec {
            name: config.dead_letter_topic.clone(),
            partitions: config.partitions,
            replication_factor: config.replication_factor,
            retention: Duration::from_millis(config.dead_letter_retention_ms),
            cleanup_policy: CleanupPolicy::Delete,
        },
    ]
}

/// 主题管理
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// 创建主题；主题已存在视为成功
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<(), LogError>;
}

/// 启动时幂等地开通所有主题，失败即启动失败
pub async fn ensure_topics(admin: &dyn TopicAdmin, topics: &[TopicSpec]) -> Result<(), LogError> {
    admin.create_topics(topics).await?;
    for topic in topics {
        info!(
            topic = %topic.name,
            partitions = topic.partitions,
            retention_ms = topic.retention.as_millis() as u64,
            "主题已就绪"
        );
    }
    Ok(())
}

/// 记录生产者
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// 追加一条记录，`key` 决定分区
    async fn send(&self, topic: &str, key: Option<&str>, payload: &str) -> Result<(), LogError>;

    /// 刷新尚未发送完成的记录
    async fn flush(&self) -> Result<(), LogError>;
}

/// 消费到的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl ConsumedRecord {
    /// 负载为空（墓碑或压缩后）的记录
    pub fn is_empty(&self) -> bool {
        self.payload.as_ref().is_none_or(|p| p.is_empty())
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload_bytes())
    }
}

/// 消费者组成员
///
/// 每个实例只由其所属的消费循环驱动，不需要加锁。
#[async_trait]
pub trait LogConsumer: Send {
    /// 拉取下一批记录；在拉取超时内没有新记录时返回空批次
    async fn next_batch(&mut self) -> Result<Vec<ConsumedRecord>, LogError>;

    /// 标记记录已处理，随下一次提交生效
    fn resolve_offset(&mut self, record: &ConsumedRecord) -> Result<(), LogError>;

    /// 提交所有已标记的偏移量
    async fn commit(&mut self) -> Result<(), LogError>;

    /// 向组协调者报告存活
    async fn heartbeat(&mut self) -> Result<(), LogError>;

    /// 暂停分区，暂停期间不再投递该分区的记录
    fn pause(&mut self, partition: i32) -> Result<(), LogError>;

    /// 从指定偏移量恢复分区消费
    fn resume(&mut self, partition: i32, from_offset: i64) -> Result<(), LogError>;

    /// 提交剩余偏移量并离开消费者组
    async fn disconnect(&mut self) -> Result<(), LogError>;
}

#[async_trait]
impl<C: LogConsumer + ?Sized> LogConsumer for Box<C> {
    async fn next_batch(&mut self) -> Result<Vec<ConsumedRecord>, LogError> {
        (**self).next_batch().await
    }

    fn resolve_offset(&mut self, record: &ConsumedRecord) -> Result<(), LogError> {
        (**self).resolve_offset(record)
    }

    async fn commit(&mut self) -> Result<(), LogError> {
        (**self).commit().await
    }

    async fn heartbeat(&mut self) -> Result<(), LogError> {
        (**self).heartbeat().await
    }

    fn pause(&mut self, partition: i32) -> Result<(), LogError> {
        (**self).pause(partition)
    }

    fn resume(&mut self, partition: i32, from_offset: i64) -> Result<(), LogError> {
        (**self).resume(partition, from_offset)
    }

    async fn disconnect(&mut self) -> Result<(), LogError> {
        (**self).disconnect().await
    }
}

/// 连续拉取失败的上限，超过后消费循环退出
pub(crate) const MAX_RECEIVE_RETRIES: u32 = 5;

/// 拉取失败后的指数退避
pub(crate) fn receive_backoff(retry_count: u32) -> Duration {
    Duration::from_millis(1000 * 2_u64.pow(retry_count.saturating_sub(1)))
}
