use domain::{ConversationId, DomainError, UserId};
use thiserror::Error;

use crate::bus::BusError;
use crate::log::LogError;
use crate::membership::MembershipError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("User is not a member of this chat: {sender} -> {conversation}")]
    MembershipDenied {
        sender: UserId,
        conversation: ConversationId,
    },
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("membership check failed: {0}")]
    Membership(#[from] MembershipError),
    #[error("broadcast error: {0}")]
    Bus(#[from] BusError),
    #[error("durable log error: {0}")]
    Log(#[from] LogError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ApplicationError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ApplicationError::MembershipDenied { .. })
    }

    /// 输入或负载不合法（参数校验失败或无法解析）
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, ApplicationError::Domain(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, ApplicationError::Domain(err) if err.is_malformed())
    }
}
