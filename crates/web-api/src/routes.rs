use axum::{
    extract::{rejection::JsonRejection, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::{error::ApiError, state::AppState, websocket};

/// 提交消息的请求体；缺失字段按空串处理，由领域校验拒绝
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SendMessagePayload {
    #[serde(alias = "chatId")]
    conversation_id: String,
    sender_id: String,
    #[serde(alias = "message")]
    body: String,
}

#[derive(Debug, Serialize)]
struct SendMessageResponse {
    success: bool,
    message: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(send_message))
        .route("/ws", get(websocket_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn send_message(
    State(state): State<AppState>,
    payload: Result<Json<SendMessagePayload>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let Json(payload) = payload?;
    state
        .gateway
        .publish_message(&payload.conversation_id, &payload.sender_id, &payload.body)
        .await?;

    Ok(Json(SendMessageResponse {
        success: true,
        message: "Message sent successfully",
    }))
}

async fn websocket_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| websocket::serve_connection(socket, state))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use application::{
        ConnectionHub, DeadLetterPolicy, DurableLogClient, MessageBus, RealtimeGateway,
        StaticMembershipGate, TopicNames,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use domain::InstanceId;
    use infrastructure::{InMemoryLog, LocalMessageBus};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    struct Harness {
        router: Router,
        bus: LocalMessageBus,
    }

    fn harness(membership: StaticMembershipGate) -> Harness {
        let bus = LocalMessageBus::default();
        let log = InMemoryLog::new();
        let client = Arc::new(DurableLogClient::new(
            Arc::new(log),
            TopicNames {
                messages: "MESSAGES".into(),
                dead_letter: "MESSAGES_DLQ".into(),
            },
            DeadLetterPolicy::default(),
        ));
        let gateway = Arc::new(RealtimeGateway::new(
            InstanceId::parse("test").unwrap(),
            Arc::new(membership),
            Arc::new(bus.clone()) as Arc<dyn MessageBus>,
            client,
            Arc::new(ConnectionHub::new()),
        ));
        Harness {
            router: router(AppState::new(gateway)),
            bus,
        }
    }

    async fn post_json(router: Router, body: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::post("/api/messages")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let h = harness(StaticMembershipGate::new());
        let response = h
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn member_message_is_published() {
        let h = harness(StaticMembershipGate::new().with_member("alice", "c1"));
        let mut subscription = h.bus.subscribe().await.unwrap();

        let (status, body) = post_json(
            h.router,
            json!({ "conversationId": "c1", "senderId": "alice", "body": "hi" }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "message": "Message sent successfully" }));
        let frame = subscription.recv().await.unwrap();
        assert!(frame.contains("\"body\":\"hi\""));
    }

    #[tokio::test]
    async fn chat_id_and_message_aliases_are_accepted() {
        let h = harness(StaticMembershipGate::new().with_member("alice", "c1"));
        let (status, _) = post_json(
            h.router,
            json!({ "chatId": "c1", "senderId": "alice", "message": "hi" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn non_member_is_forbidden() {
        let h = harness(StaticMembershipGate::new().with_member("alice", "c1"));
        let (status, body) = post_json(
            h.router,
            json!({ "conversationId": "c1", "senderId": "attacker", "body": "hi" }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "NOT_CONVERSATION_MEMBER");
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn malformed_body_uses_error_shape() {
        for (content_type, body) in [
            ("application/json", "{not json"),
            ("application/json", r#"{"conversationId":"c1","senderId":7,"body":"hi"}"#),
            ("text/plain", r#"{"conversationId":"c1","senderId":"alice","body":"hi"}"#),
        ] {
            let h = harness(StaticMembershipGate::allow_all());
            let response = h
                .router
                .oneshot(
                    Request::post("/api/messages")
                        .header(header::CONTENT_TYPE, content_type)
                        .body(Body::from(body))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["success"], false);
            assert_eq!(body["code"], "INVALID_ARGUMENT");
        }
    }

    #[tokio::test]
    async fn missing_fields_are_rejected() {
        let h = harness(StaticMembershipGate::allow_all());
        let (status, body) = post_json(h.router, json!({ "conversationId": "c1" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_ARGUMENT");
    }
}
