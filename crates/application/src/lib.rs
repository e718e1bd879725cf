//! 应用层实现。
//!
//! 定义消息分发管道依赖的端口（持久化日志、广播总线、存储、成员校验），
//! 并在这些端口之上实现网关、持久化日志客户端、物化消费者与死信观察者。

pub mod bus;
pub mod dead_letter_observer;
pub mod durable_log;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod log;
pub mod materializer;
pub mod membership;
pub mod store;

pub use bus::{BusError, BusSubscription, MessageBus};
pub use dead_letter_observer::{DeadLetterObserver, DeadLetterReporter, TracingReporter};
pub use durable_log::{AppendOutcome, DeadLetterPolicy, DurableLogClient, TopicNames};
pub use error::ApplicationError;
pub use gateway::RealtimeGateway;
pub use hub::{ConnectionHub, ConnectionId};
pub use log::{
    ensure_topics, topic_specs, CleanupPolicy, ConsumedRecord, LogConsumer, LogError,
    RecordProducer, TopicAdmin, TopicSpec,
};
pub use materializer::{Materializer, MaterializerState};
pub use membership::{MembershipError, MembershipGate, StaticMembershipGate};
pub use store::{MessageStore, StoreError};
