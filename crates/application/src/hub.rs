//! 本实例的实时连接表
//!
//! 总线上收到的每一帧都会推送给这里登记的所有连接，推送不确认也不重试。

use std::collections::HashMap;
use std::fmt;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<String>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新连接，返回连接标识和推送接收端
    pub async fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let mut connections = self.connections.write().await;
        connections.insert(id, sender);
        info!(connection_id = %id, active = connections.len(), "客户端已连接");
        (id, receiver)
    }

    pub async fn unregister(&self, id: ConnectionId) {
        let mut connections = self.connections.write().await;
        if connections.remove(&id).is_some() {
            info!(connection_id = %id, active = connections.len(), "客户端已断开");
        }
    }

    /// 向所有本地连接推送负载，返回成功投递的连接数
    ///
    /// 接收端已关闭的连接会被顺带清理。
    pub async fn broadcast(&self, payload: &str) -> usize {
        let mut closed = Vec::new();
        let delivered = {
            let connections = self.connections.read().await;
            let mut delivered = 0;
            for (id, sender) in connections.iter() {
                if sender.send(payload.to_owned()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
            delivered
        };

        if !closed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in closed {
                connections.remove(&id);
                debug!(connection_id = %id, "清理已关闭的连接");
            }
        }

        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
