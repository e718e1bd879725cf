//! 持久化日志客户端
//!
//! 追加失败时不丢弃负载：主主题追加失败后，在延迟到期时把负载包装成死信记录
//! 追加到死信主题；死信追加再失败则按指数退避重试，达到次数上限后记录并丢弃。

use std::sync::Arc;
use std::time::Duration;

use config::{KafkaConfig, PipelineConfig};
use domain::{DeadLetterRecord, DomainError, MessageEnvelope};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::log::RecordProducer;

/// 主主题与死信主题名称
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub messages: String,
    pub dead_letter: String,
}

impl TopicNames {
    pub fn from_config(config: &KafkaConfig) -> Self {
        Self {
            messages: config.messages_topic.clone(),
            dead_letter: config.dead_letter_topic.clone(),
        }
    }
}

/// 死信重定向的退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl DeadLetterPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            initial_delay: config.initial_retry_delay(),
            max_attempts: config.max_dead_letter_attempts,
        }
    }

    /// 每次死信追加前的等待时间，从初始延迟开始逐次翻倍
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_attempts)
            .map(|attempt| self.initial_delay.saturating_mul(1 << attempt.min(20)))
            .collect()
    }
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

/// 单次追加的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 记录已写入目标主题
    Delivered,
    /// 写入失败，已安排在 `first_delay` 后追加到死信主题
    RetryScheduled { first_delay: Duration },
    /// 写入失败且不再重试
    Dropped,
}

/// 持久化日志客户端
///
/// 持有进程内唯一的生产者连接，由网关和物化消费者共享。
pub struct DurableLogClient {
    producer: Arc<dyn RecordProducer>,
    topics: TopicNames,
    policy: DeadLetterPolicy,
    retries: TaskTracker,
    shutdown: CancellationToken,
}

impl DurableLogClient {
    pub fn new(producer: Arc<dyn RecordProducer>, topics: TopicNames, policy: DeadLetterPolicy) -> Self {
        Self {
            producer,
            topics,
            policy,
            retries: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn topics(&self) -> &TopicNames {
        &self.topics
    }

    pub fn policy(&self) -> DeadLetterPolicy {
        self.policy
    }

    /// 尚未完成的死信重试任务数
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// 追加一条记录
    ///
    /// 传输失败不会返回错误：目标是死信主题时直接丢弃，否则安排死信重定向。
    pub async fn append(&self, topic: &str, key: Option<&str>, value: &str) -> AppendOutcome {
        let err = match self.producer.send(topic, key, value).await {
            Ok(()) => {
                debug!(topic, key, "记录已追加");
                return AppendOutcome::Delivered;
            }
            Err(err) => err,
        };

        if topic == self.topics.dead_letter {
            error!(topic, key, error = %err, payload = value, "死信追加失败，负载已丢弃");
            return AppendOutcome::Dropped;
        }

        let wrapped = match DeadLetterRecord::from_failed_append(value, err.to_string()).encode() {
            Ok(wrapped) => wrapped,
            Err(encode_err) => {
                error!(topic, error = %encode_err, payload = value, "无法编码死信记录，负载已丢弃");
                return AppendOutcome::Dropped;
            }
        };

        let delays = self.policy.delays();
        let Some(first_delay) = delays.first().copied() else {
            error!(topic, error = %err, payload = value, "未配置死信重试，负载已丢弃");
            return AppendOutcome::Dropped;
        };

        warn!(
            topic,
            key,
            error = %err,
            delay_ms = first_delay.as_millis() as u64,
            "追加失败，已安排转入死信主题"
        );

        self.retries.spawn(retry_into_dead_letter(
            Arc::clone(&self.producer),
            self.topics.dead_letter.clone(),
            key.map(str::to_owned),
            wrapped,
            delays,
            self.shutdown.child_token(),
        ));

        AppendOutcome::RetryScheduled { first_delay }
    }

    /// 以会话标识为分区键，把信封追加到主主题
    pub async fn append_message(&self, envelope: &MessageEnvelope) -> Result<AppendOutcome, DomainError> {
        let payload = envelope.to_payload()?;
        Ok(self
            .append(&self.topics.messages, Some(envelope.conversation_id().as_str()), &payload)
            .await)
    }

    /// 直接向死信主题写入一条死信记录，失败即丢弃
    pub async fn dead_letter(
        &self,
        record: &DeadLetterRecord,
        key: Option<&str>,
    ) -> Result<AppendOutcome, DomainError> {
        let payload = record.encode()?;
        Ok(self.append(&self.topics.dead_letter, key, &payload).await)
    }

    /// 关闭客户端
    ///
    /// 仍在等待的死信重试立即各执行一次，最多等待 `grace`，随后刷新生产者。
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.retries.close();

        let pending = self.retries.len();
        if pending > 0 {
            info!(pending, "等待死信重试任务完成");
        }
        if tokio::time::timeout(grace, self.retries.wait()).await.is_err() {
            warn!(
                pending = self.retries.len(),
                "死信重试任务未在关闭宽限期内完成"
            );
        }

        if let Err(err) = self.producer.flush().await {
            error!(error = %err, "刷新生产者失败");
        }
        info!("持久化日志客户端已关闭");
    }
}

async fn retry_into_dead_letter(
    producer: Arc<dyn RecordProducer>,
    topic: String,
    key: Option<String>,
    payload: String,
    delays: Vec<Duration>,
    shutdown: CancellationToken,
) {
    let max_attempts = delays.len();
    for (index, delay) in delays.into_iter().enumerate() {
        let attempt = index + 1;
        let shutting_down = tokio::select! {
            _ = sleep(delay) => false,
            _ = shutdown.cancelled() => true,
        };

        match producer.send(&topic, key.as_deref(), &payload).await {
            Ok(()) => {
                info!(topic = %topic, attempt, "负载已转入死信主题");
                return;
            }
            Err(err) if shutting_down => {
                error!(topic = %topic, attempt, error = %err, payload = %payload, "关闭期间死信追加失败，负载已丢弃");
                return;
            }
            Err(err) => {
                warn!(topic = %topic, attempt, max_attempts, error = %err, "死信追加失败");
            }
        }
    }

    error!(
        topic = %topic,
        max_attempts,
        payload = %payload,
        "死信追加达到最大重试次数，负载已丢弃"
    );
}
