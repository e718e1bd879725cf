//! 会话成员校验

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use domain::{ConversationId, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("membership backend unavailable: {0}")]
    Unavailable(String),
    #[error("membership backend returned unexpected response: {0}")]
    Unexpected(String),
}

/// 成员关系判定
///
/// 返回 `Ok(false)` 表示发送者不属于该会话；后端故障以错误返回，调用方不得当作允许。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipGate: Send + Sync {
    async fn check_membership(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<bool, MembershipError>;
}

/// 基于内存集合的成员关系表，用于本地开发和测试
#[derive(Debug, Default)]
pub struct StaticMembershipGate {
    allow_all: bool,
    members: RwLock<HashSet<(String, String)>>,
}

impl StaticMembershipGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 允许任何发送者向任何会话发消息
    pub fn allow_all() -> Self {
        Self {
            allow_all: true,
            members: RwLock::default(),
        }
    }

    pub fn grant(&self, sender: &str, conversation: &str) {
        if let Ok(mut members) = self.members.write() {
            members.insert((sender.to_owned(), conversation.to_owned()));
        }
    }

    pub fn revoke(&self, sender: &str, conversation: &str) {
        if let Ok(mut members) = self.members.write() {
            members.remove(&(sender.to_owned(), conversation.to_owned()));
        }
    }

    /// 链式授予成员关系
    pub fn with_member(self, sender: &str, conversation: &str) -> Self {
        self.grant(sender, conversation);
        self
    }
}

#[async_trait]
impl MembershipGate for StaticMembershipGate {
    async fn check_membership(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<bool, MembershipError> {
        if self.allow_all {
            return Ok(true);
        }
        let members = self
            .members
            .read()
            .map_err(|err| MembershipError::Unavailable(err.to_string()))?;
        Ok(members.contains(&(sender.as_str().to_owned(), conversation.as_str().to_owned())))
    }
}
