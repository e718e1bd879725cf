//! Kafka 错误类型定义

use application::LogError;
use thiserror::Error;

/// Kafka 操作错误
#[derive(Error, Debug)]
pub enum KafkaError {
    /// 连接错误
    #[error("Kafka 连接错误: {message}")]
    ConnectionError { message: String },

    /// 生产者错误
    #[error("Kafka 生产者错误: {message}")]
    ProducerError { message: String },

    /// 消费者错误
    #[error("Kafka 消费者错误: {message}")]
    ConsumerError { message: String },

    /// 主题管理错误
    #[error("Kafka 主题管理错误: {topic}: {message}")]
    AdminError { topic: String, message: String },

    /// 超时错误
    #[error("操作超时: {operation}")]
    TimeoutError { operation: String },

    /// 配置错误
    #[error("配置错误: {message}")]
    ConfigError { message: String },
}

/// Kafka 结果类型
pub type KafkaResult<T> = Result<T, KafkaError>;

impl From<rdkafka::error::KafkaError> for KafkaError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        match err {
            rdkafka::error::KafkaError::ClientConfig(..) | rdkafka::error::KafkaError::ClientCreation(_) => {
                KafkaError::ConfigError {
                    message: err.to_string(),
                }
            }
            rdkafka::error::KafkaError::ConsumerCommit(_)
            | rdkafka::error::KafkaError::MessageConsumption(_)
            | rdkafka::error::KafkaError::Subscription(_)
            | rdkafka::error::KafkaError::Seek(_)
            | rdkafka::error::KafkaError::PauseResume(_)
            | rdkafka::error::KafkaError::StoreOffset(_) => KafkaError::ConsumerError {
                message: err.to_string(),
            },
            rdkafka::error::KafkaError::MessageProduction(_) | rdkafka::error::KafkaError::Flush(_) => {
                KafkaError::ProducerError {
                    message: err.to_string(),
                }
            }
            rdkafka::error::KafkaError::Canceled => KafkaError::ProducerError {
                message: "操作被取消".to_string(),
            },
            _ => KafkaError::ConnectionError {
                message: err.to_string(),
            },
        }
    }
}

impl From<KafkaError> for LogError {
    fn from(err: KafkaError) -> Self {
        match err {
            KafkaError::ConnectionError { message } => LogError::Connection { message },
            KafkaError::ProducerError { message } => LogError::Produce {
                topic: String::new(),
                message,
            },
            KafkaError::ConsumerError { message } => LogError::Consume { message },
            KafkaError::AdminError { topic, message } => LogError::Provision { topic, message },
            KafkaError::TimeoutError { operation } => LogError::Timeout { operation },
            KafkaError::ConfigError { message } => LogError::Config { message },
        }
    }
}
