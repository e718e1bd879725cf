//! Web API 层。
//!
//! 提供 Axum 路由：提交消息、WebSocket 推送与健康检查，请求委托给应用层的实时网关。

mod error;
mod routes;
mod state;
mod websocket;

pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
