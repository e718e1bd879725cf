//! 消息分发管道的核心领域模型
//!
//! 包含消息信封、持久化记录、死信记录以及相关标识与校验规则。

pub mod dead_letter;
pub mod errors;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use dead_letter::DeadLetterRecord;
pub use errors::DomainError;
pub use message::{BusFrame, DurableRecord, MessageEnvelope};
pub use value_objects::{ConversationId, InstanceId, MessageBody, UserId};
