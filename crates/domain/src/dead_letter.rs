use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// 死信记录
///
/// 包装一条无法持久化、或根本无法追加到主日志的负载。追加失败时没有来源分区和偏移量。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_payload: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_partition: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_offset: Option<i64>,
}

impl DeadLetterRecord {
    /// 消费端持久化失败产生的死信
    pub fn from_consumed(
        original_payload: impl Into<String>,
        error: impl Into<String>,
        partition: i32,
        offset: i64,
    ) -> Self {
        Self {
            original_payload: original_payload.into(),
            error: error.into(),
            source_partition: Some(partition),
            source_offset: Some(offset),
        }
    }

    /// 生产端追加主题失败产生的死信
    pub fn from_failed_append(original_payload: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            original_payload: original_payload.into(),
            error: error.into(),
            source_partition: None,
            source_offset: None,
        }
    }

    pub fn encode(&self) -> Result<String, DomainError> {
        serde_json::to_string(self)
            .map_err(|err| DomainError::malformed("dead letter record", err.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DomainError> {
        serde_json::from_slice(payload)
            .map_err(|err| DomainError::malformed("dead letter record", err.to_string()))
    }
}
