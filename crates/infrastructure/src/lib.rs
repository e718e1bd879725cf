//! 基础设施层实现。
//!
//! 提供 Kafka 持久化日志、Redis 广播总线、Postgres 存储与成员校验、OpenFGA 成员校验，
//! 以及单进程运行和测试使用的内存适配器，实现应用层定义的端口。

pub mod builder;
pub mod kafka;
pub mod memory;
pub mod openfga;
pub mod postgres;
pub mod redis;

pub use builder::{Infrastructure, InfrastructureError};
pub use kafka::{KafkaLogConsumer, KafkaRecordProducer, KafkaTopicAdmin};
pub use memory::{InMemoryConsumer, InMemoryLog, InMemoryMessageStore, LocalMessageBus};
pub use openfga::OpenFgaMembershipGate;
pub use postgres::{create_pg_pool, PgMembershipGate, PgMessageStore, MIGRATOR};
pub use redis::RedisMessageBus;
