//! Kafka 主题管理

use std::time::Duration;

use application::{LogError, TopicAdmin, TopicSpec};
use async_trait::async_trait;
use config::KafkaConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;
use tracing::{debug, info};

use crate::kafka::{KafkaError, KafkaResult};

const ADMIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// 基于 AdminClient 的主题开通
pub struct KafkaTopicAdmin {
    client: AdminClient<DefaultClientContext>,
}

impl KafkaTopicAdmin {
    /// 创建管理客户端，连接失败即启动失败
    pub fn new(config: &KafkaConfig) -> KafkaResult<Self> {
        let client: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", format!("{}-admin", config.client_id))
            .create()
            .map_err(|e| KafkaError::ConfigError {
                message: format!("创建 Kafka 管理客户端失败: {}", e),
            })?;

        info!("Kafka 管理客户端创建成功，连接到: {}", config.bootstrap_servers());
        Ok(Self { client })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<(), LogError> {
        let retention: Vec<String> = topics
            .iter()
            .map(|topic| topic.retention.as_millis().to_string())
            .collect();
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .zip(&retention)
            .map(|(topic, retention_ms)| {
                NewTopic::new(
                    &topic.name,
                    topic.partitions,
                    TopicReplication::Fixed(topic.replication_factor),
                )
                .set("retention.ms", retention_ms)
                .set("cleanup.policy", topic.cleanup_policy.as_str())
            })
            .collect();

        let options = AdminOptions::new().operation_timeout(Some(ADMIN_OPERATION_TIMEOUT));
        let results = self
            .client
            .create_topics(&new_topics, &options)
            .await
            .map_err(KafkaError::from)?;

        for result in results {
            match result {
                Ok(name) => info!(topic = %name, "主题已创建"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "主题已存在")
                }
                Err((name, code)) => {
                    return Err(KafkaError::AdminError {
                        topic: name,
                        message: code.to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(())
    }
}
