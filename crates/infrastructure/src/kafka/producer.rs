//! Kafka 记录生产者
//!
//! 以会话标识为分区键，保证同一会话的记录在单一分区内有序。

use std::time::Duration;

use application::{LogError, RecordProducer};
use async_trait::async_trait;
use config::KafkaConfig;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::kafka::{KafkaError, KafkaResult};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka 记录生产者
///
/// 底层连接在第一次发送时建立，此后整个进程复用同一个连接。
pub struct KafkaRecordProducer {
    config: KafkaConfig,
    producer: OnceCell<FutureProducer>,
}

impl KafkaRecordProducer {
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            config: config.clone(),
            producer: OnceCell::new(),
        }
    }

    /// 连接是否已建立
    pub fn is_connected(&self) -> bool {
        self.producer.initialized()
    }

    async fn producer(&self) -> KafkaResult<&FutureProducer> {
        self.producer
            .get_or_try_init(|| async {
                let producer: FutureProducer = ClientConfig::new()
                    .set("bootstrap.servers", self.config.bootstrap_servers())
                    .set("client.id", &self.config.client_id)
                    .set("message.timeout.ms", self.config.send_timeout_ms.to_string())
                    .set("acks", "all")
                    .set("enable.idempotence", "true")
                    .set("max.in.flight.requests.per.connection", "5")
                    .create()
                    .map_err(|e| KafkaError::ConfigError {
                        message: format!("创建 Kafka 生产者失败: {}", e),
                    })?;
                info!("Kafka 生产者创建成功，连接到: {}", self.config.bootstrap_servers());
                Ok(producer)
            })
            .await
    }
}

#[async_trait]
impl RecordProducer for KafkaRecordProducer {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &str) -> Result<(), LogError> {
        let producer = self.producer().await?;

        let mut record = FutureRecord::<str, str>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        producer
            .send(record, Timeout::After(self.config.send_timeout()))
            .await
            .map_err(|(err, _)| LogError::produce(topic, err.to_string()))?;

        debug!(topic, key, "记录已发送");
        Ok(())
    }

    async fn flush(&self) -> Result<(), LogError> {
        let Some(producer) = self.producer.get() else {
            return Ok(());
        };
        producer
            .flush(Timeout::After(FLUSH_TIMEOUT))
            .map_err(|e| KafkaError::ProducerError {
                message: format!("刷新生产者缓冲区失败: {}", e),
            })?;
        info!("Kafka 生产者缓冲区已刷新");
        Ok(())
    }
}
