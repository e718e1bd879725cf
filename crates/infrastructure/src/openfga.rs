//! OpenFGA 成员校验
//!
//! 调用 `POST {api_url}/stores/{store_id}/check`，判定 `user:<sender>` 是否为
//! `chat:<conversation>` 的 `member`。

use application::{MembershipError, MembershipGate};
use async_trait::async_trait;
use config::OpenFgaConfig;
use domain::{ConversationId, UserId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

const MEMBER_RELATION: &str = "member";

#[derive(Debug, Serialize)]
struct TupleKey {
    user: String,
    relation: &'static str,
    object: String,
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    tuple_key: TupleKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization_model_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    allowed: bool,
}

pub struct OpenFgaMembershipGate {
    http: reqwest::Client,
    check_url: String,
    authorization_model_id: Option<String>,
}

impl OpenFgaMembershipGate {
    pub fn new(config: &OpenFgaConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: &OpenFgaConfig) -> Self {
        Self {
            http,
            check_url: format!(
                "{}/stores/{}/check",
                config.api_url.trim_end_matches('/'),
                config.store_id
            ),
            authorization_model_id: config.authorization_model_id.clone(),
        }
    }
}

#[async_trait]
impl MembershipGate for OpenFgaMembershipGate {
    async fn check_membership(
        &self,
        sender: &UserId,
        conversation: &ConversationId,
    ) -> Result<bool, MembershipError> {
        let request = CheckRequest {
            tuple_key: TupleKey {
                user: format!("user:{}", sender),
                relation: MEMBER_RELATION,
                object: format!("chat:{}", conversation),
            },
            authorization_model_id: self.authorization_model_id.as_deref(),
        };

        let response = self
            .http
            .post(&self.check_url)
            .json(&request)
            .send()
            .await
            .map_err(|err| MembershipError::Unavailable(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(sender_id = %sender, conversation_id = %conversation, "OpenFGA 未找到关系");
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MembershipError::Unexpected(format!("{status}: {body}")));
        }

        let body: CheckResponse = response
            .json()
            .await
            .map_err(|err| MembershipError::Unexpected(err.to_string()))?;
        Ok(body.allowed)
    }
}
