//! 日志物化消费者
//!
//! 按消费者组读取主主题，逐条落库，落库成功后才标记偏移量。落库失败的记录写入死信主题，
//! 所在分区暂停一个冷却期，冷却结束后从失败的偏移量继续。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{DeadLetterRecord, DurableRecord, MessageEnvelope};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::durable_log::DurableLogClient;
use crate::error::ApplicationError;
use crate::log::{receive_backoff, ConsumedRecord, LogConsumer, LogError, MAX_RECEIVE_RETRIES};
use crate::store::MessageStore;

/// 消费循环所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializerState {
    Idle,
    Connected,
    ConsumingBatch,
    DeadLettering,
    Paused,
}

#[derive(Debug, Clone, Copy)]
struct PausedPartition {
    until: Instant,
    resume_from: i64,
}

pub struct Materializer<C: LogConsumer> {
    consumer: C,
    store: Arc<dyn MessageStore>,
    log: Arc<DurableLogClient>,
    cooldown: Duration,
    paused: HashMap<i32, PausedPartition>,
    state: MaterializerState,
}

impl<C: LogConsumer> Materializer<C> {
    pub fn new(
        consumer: C,
        store: Arc<dyn MessageStore>,
        log: Arc<DurableLogClient>,
        cooldown: Duration,
    ) -> Self {
        Self {
            consumer,
            store,
            log,
            cooldown,
            paused: HashMap::new(),
            state: MaterializerState::Idle,
        }
    }

    pub fn state(&self) -> MaterializerState {
        self.state
    }

    /// 运行消费循环直到收到关闭信号
    ///
    /// 连续拉取失败超过上限时返回错误；退出前总会提交已标记的偏移量并断开连接。
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ApplicationError> {
        self.transition(MaterializerState::Connected);
        info!("物化消费者已启动");

        let mut retry_count = 0;
        let result = loop {
            if let Err(err) = self.resume_due() {
                break Err(err);
            }

            let next_resume = self.next_resume_deadline();
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = wait_until(next_resume) => continue,
                batch = self.consumer.next_batch() => batch,
            };

            match batch {
                Ok(records) => {
                    retry_count = 0;
                    if let Err(err) = self.process_batch(records).await {
                        break Err(err);
                    }
                }
                Err(err) => {
                    retry_count += 1;
                    if retry_count > MAX_RECEIVE_RETRIES {
                        error!(error = %err, "拉取消息连续失败，已达最大重试次数");
                        break Err(err);
                    }
                    let delay = receive_backoff(retry_count);
                    warn!(
                        error = %err,
                        attempt = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        "拉取消息失败，稍后重试"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = sleep(delay) => {}
                    }
                }
            }
        };

        if let Err(err) = self.consumer.disconnect().await {
            error!(error = %err, "断开物化消费者失败");
        }
        self.transition(MaterializerState::Idle);
        info!("物化消费者已停止");
        result.map_err(ApplicationError::from)
    }

    async fn process_batch(&mut self, records: Vec<ConsumedRecord>) -> Result<(), LogError> {
        if records.is_empty() {
            return Ok(());
        }
        if self.paused.is_empty() {
            self.transition(MaterializerState::ConsumingBatch);
        }
        debug!(records = records.len(), "处理消息批次");

        for record in records {
            if self.paused.contains_key(&record.partition) {
                continue;
            }

            if record.is_empty() {
                debug!(partition = record.partition, offset = record.offset, "跳过空负载记录");
                self.resolve(&record).await;
                continue;
            }

            let envelope = match MessageEnvelope::from_payload(record.payload_bytes()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    error!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %err,
                        "无法解析的记录，转入死信主题"
                    );
                    self.dead_letter(&record, err.to_string()).await;
                    self.resolve(&record).await;
                    continue;
                }
            };

            let durable = DurableRecord::new(envelope, record.partition, record.offset);
            match self.store.persist(&durable).await {
                Ok(()) => {
                    debug!(
                        conversation_id = %durable.envelope.conversation_id(),
                        partition = record.partition,
                        offset = record.offset,
                        "消息已落库"
                    );
                    self.resolve(&record).await;
                }
                Err(err) => {
                    error!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %err,
                        "消息落库失败"
                    );
                    self.dead_letter(&record, err.to_string()).await;
                    self.pause(&record)?;
                }
            }
        }

        if let Err(err) = self.consumer.commit().await {
            warn!(error = %err, "提交偏移量失败");
        }
        Ok(())
    }

    async fn resolve(&mut self, record: &ConsumedRecord) {
        if self.paused.is_empty() {
            self.transition(MaterializerState::ConsumingBatch);
        }
        if let Err(err) = self.consumer.resolve_offset(record) {
            warn!(partition = record.partition, offset = record.offset, error = %err, "标记偏移量失败");
            return;
        }
        if let Err(err) = self.consumer.heartbeat().await {
            warn!(error = %err, "心跳失败");
        }
    }

    async fn dead_letter(&mut self, record: &ConsumedRecord, error: String) {
        self.transition(MaterializerState::DeadLettering);
        let dead_letter = DeadLetterRecord::from_consumed(
            record.payload_lossy(),
            error,
            record.partition,
            record.offset,
        );
        if let Err(err) = self.log.dead_letter(&dead_letter, record.key.as_deref()).await {
            error!(error = %err, "无法编码死信记录");
        }
    }

    fn pause(&mut self, record: &ConsumedRecord) -> Result<(), LogError> {
        self.consumer.pause(record.partition)?;
        self.paused.insert(
            record.partition,
            PausedPartition {
                until: Instant::now() + self.cooldown,
                resume_from: record.offset,
            },
        );
        self.transition(MaterializerState::Paused);
        warn!(
            partition = record.partition,
            offset = record.offset,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "分区已暂停"
        );
        Ok(())
    }

    fn resume_due(&mut self) -> Result<(), LogError> {
        let now = Instant::now();
        let due: Vec<(i32, PausedPartition)> = self
            .paused
            .iter()
            .filter(|(_, paused)| paused.until <= now)
            .map(|(partition, paused)| (*partition, *paused))
            .collect();

        for (partition, paused) in due {
            self.consumer.resume(partition, paused.resume_from)?;
            self.paused.remove(&partition);
            info!(partition, offset = paused.resume_from, "分区已恢复消费");
        }

        if self.paused.is_empty() && self.state == MaterializerState::Paused {
            self.transition(MaterializerState::ConsumingBatch);
        }
        Ok(())
    }

    fn next_resume_deadline(&self) -> Option<Instant> {
        self.paused.values().map(|paused| paused.until).min()
    }

    fn transition(&mut self, next: MaterializerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "物化消费者状态变更");
            self.state = next;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
