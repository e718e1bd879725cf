use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, InstanceId, MessageBody, UserId};

/// 消息信封
///
/// 网关完成成员校验后生成，创建后不可变。线上格式为
/// `{ "conversationId": .., "senderId": .., "body": .. }`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageEnvelope {
    conversation_id: ConversationId,
    sender_id: UserId,
    body: MessageBody,
}

impl MessageEnvelope {
    pub fn new(conversation_id: ConversationId, sender_id: UserId, body: MessageBody) -> Self {
        Self {
            conversation_id,
            sender_id,
            body,
        }
    }

    /// 从原始字符串构造并校验信封
    pub fn parse(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, DomainError> {
        Ok(Self::new(
            ConversationId::parse(conversation_id)?,
            UserId::parse(sender_id)?,
            MessageBody::new(body)?,
        ))
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn sender_id(&self) -> &UserId {
        &self.sender_id
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// 序列化为日志/推送使用的 JSON 负载
    pub fn to_payload(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|err| DomainError::malformed("envelope", err.to_string()))
    }

    /// 解析日志中的原始负载
    pub fn from_payload(payload: &[u8]) -> Result<Self, DomainError> {
        serde_json::from_slice(payload)
            .map_err(|err| DomainError::malformed("envelope", err.to_string()))
    }
}

/// 广播总线上传输的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// 一条已通过成员校验的消息，`origin` 为发布该帧的网关实例
    Message {
        origin: InstanceId,
        envelope: MessageEnvelope,
    },
}

impl BusFrame {
    pub fn message(origin: InstanceId, envelope: MessageEnvelope) -> Self {
        Self::Message { origin, envelope }
    }

    pub fn origin(&self) -> &InstanceId {
        match self {
            Self::Message { origin, .. } => origin,
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        match self {
            Self::Message { envelope, .. } => envelope,
        }
    }

    pub fn encode(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|err| DomainError::malformed("bus frame", err.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, DomainError> {
        serde_json::from_str(raw).map_err(|err| DomainError::malformed("bus frame", err.to_string()))
    }

    /// 当前实例是否为该帧的持久化写入方
    pub fn is_originated_by(&self, instance: &InstanceId) -> bool {
        self.origin() == instance
    }
}

/// 已持久化的消息记录
///
/// 持久化时才分配唯一标识；分区与偏移量只用于诊断和死信关联。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub id: Uuid,
    pub envelope: MessageEnvelope,
    pub partition: i32,
    pub offset: i64,
    pub persisted_at: DateTime<Utc>,
}

impl DurableRecord {
    pub fn new(envelope: MessageEnvelope, partition: i32, offset: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope,
            partition,
            offset,
            persisted_at: Utc::now(),
        }
    }
}
