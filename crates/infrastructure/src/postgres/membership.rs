use application::{MembershipError, MembershipGate};
use async_trait::async_trait;
use domain::{ConversationId, UserId};
use sqlx::PgPool;

/// 以 `chat_memberships` 表判定成员关系，行存在即允许
#[derive(Clone)]
pub struct PgMembershipGate {
    pool: PgPool,
}

impl PgMembershipGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipGate for PgMembershipGate {
    async fn check_membership(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<bool, MembershipError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM chat_memberships WHERE chat_id = $1 AND user_id = $2)",
        )
        .bind(conversation.as_str())
        .bind(sender.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| MembershipError::Unavailable(err.to_string()))
    }
}
