//! Kafka 消费者组成员
//!
//! 关闭自动存储偏移量，只有应用层显式标记过的记录才会随自动提交生效，
//! 从而实现“落库成功后才确认”的至少一次语义。

use std::time::Duration;

use application::{ConsumedRecord, LogConsumer, LogError};
use async_trait::async_trait;
use config::KafkaConfig;
use futures_util::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError as RdKafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::types::RDKafkaErrorCode;
use tracing::{debug, info, warn};

use crate::kafka::{KafkaError, KafkaResult};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka 消费者
///
/// 作为消费者组成员，利用 Kafka 自动分区重平衡机制。
pub struct KafkaLogConsumer {
    consumer: StreamConsumer,
    topic: String,
    group: String,
    batch_size: usize,
    poll_timeout: Duration,
}

impl KafkaLogConsumer {
    /// 创建消费者并订阅主题，首次加入消费者组时从最早的保留偏移量开始
    pub fn new(config: &KafkaConfig, group: &str, topic: &str) -> KafkaResult<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group)
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", format!("{}-{}", config.client_id, group))
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "10000")
            .set("heartbeat.interval.ms", "3000")
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 消费者失败: {}", e),
            })?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| KafkaError::ConsumerError {
                message: format!("订阅主题失败: {}", e),
            })?;

        info!("Kafka 消费者创建成功，消费者组: {}，主题: {}", group, topic);

        Ok(Self {
            consumer,
            topic: topic.to_owned(),
            group: group.to_owned(),
            batch_size: config.batch_size.max(1),
            poll_timeout: config.poll_timeout(),
        })
    }

    fn partition_list(&self, partition: i32) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition(&self.topic, partition);
        list
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> ConsumedRecord {
    ConsumedRecord {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

fn is_nothing_to_commit(err: &RdKafkaError) -> bool {
    matches!(err, RdKafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset))
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    async fn next_batch(&mut self) -> Result<Vec<ConsumedRecord>, LogError> {
        let first = match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(message) => message.map_err(KafkaError::from)?,
        };

        let mut batch = Vec::with_capacity(self.batch_size);
        batch.push(to_record(&first));
        drop(first);

        // 只取已在本地队列中的记录，不再等待网络
        while batch.len() < self.batch_size {
            match self.consumer.recv().now_or_never() {
                Some(Ok(message)) => batch.push(to_record(&message)),
                Some(Err(err)) => {
                    warn!(error = %err, "批次内拉取失败，提前结束批次");
                    break;
                }
                None => break,
            }
        }

        debug!(group = %self.group, records = batch.len(), "拉取到消息批次");
        Ok(batch)
    }

    fn resolve_offset(&mut self, record: &ConsumedRecord) -> Result<(), LogError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(KafkaError::from)?;
        self.consumer.store_offsets(&list).map_err(KafkaError::from)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LogError> {
        match self.consumer.commit_consumer_state(CommitMode::Async) {
            Ok(()) => Ok(()),
            Err(err) if is_nothing_to_commit(&err) => Ok(()),
            Err(err) => Err(KafkaError::from(err).into()),
        }
    }

    async fn heartbeat(&mut self) -> Result<(), LogError> {
        // librdkafka 在后台线程维持组心跳，这里无需额外请求
        Ok(())
    }

    fn pause(&mut self, partition: i32) -> Result<(), LogError> {
        self.consumer
            .pause(&self.partition_list(partition))
            .map_err(KafkaError::from)?;
        Ok(())
    }

    fn resume(&mut self, partition: i32, from_offset: i64) -> Result<(), LogError> {
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(from_offset), SEEK_TIMEOUT)
            .map_err(KafkaError::from)?;
        self.consumer
            .resume(&self.partition_list(partition))
            .map_err(KafkaError::from)?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LogError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {}
            Err(err) if is_nothing_to_commit(&err) => {}
            Err(err) => warn!(group = %self.group, error = %err, "关闭前提交偏移量失败"),
        }
        self.consumer.unsubscribe();
        info!("Kafka 消费者已断开，消费者组: {}", self.group);
        Ok(())
    }
}
