//! Kafka 持久化日志适配器
//!
//! 主题开通、生产者与消费者组成员，分别对应应用层的 `TopicAdmin`、`RecordProducer`、`LogConsumer`。

pub mod admin;
pub mod consumer;
pub mod error;
pub mod producer;

pub use admin::KafkaTopicAdmin;
pub use consumer::KafkaLogConsumer;
pub use error::{KafkaError, KafkaResult};
pub use producer::KafkaRecordProducer;
