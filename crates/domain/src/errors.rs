//! 领域模型错误定义

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 线路上的负载无法解析为约定的结构
    #[error("malformed {kind}: {message}")]
    MalformedPayload { kind: &'static str, message: String },
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(kind: &'static str, message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind,
            message: message.into(),
        }
    }

    /// 是否为负载解析错误
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedPayload { .. })
    }
}
