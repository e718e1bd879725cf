//! 实时推送连接
//!
//! 每个连接在 [`application::ConnectionHub`] 中注册，接收本实例扇出的每条消息。
//! 入站文本不会触发任何业务事件。

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::state::AppState;

pub(crate) async fn serve_connection(socket: WebSocket, state: AppState) {
    let hub = state.hub().clone();
    let (connection_id, mut outbound) = hub.register().await;
    debug!(connection_id = %connection_id, "WebSocket 连接已建立");

    let (mut sender, mut incoming) = socket.split();

    loop {
        tokio::select! {
            pushed = outbound.recv() => {
                let Some(payload) = pushed else { break };
                if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(WsMessage::Ping(data))) => {
                    if sender.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Text(text))) => {
                    debug!(connection_id = %connection_id, len = text.len(), "忽略入站文本消息");
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(connection_id = %connection_id, error = %err, "WebSocket 读取失败");
                    break;
                }
            }
        }
    }

    hub.unregister(connection_id).await;
    debug!(connection_id = %connection_id, "WebSocket 连接已断开");
}
