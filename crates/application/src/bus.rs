use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broadcast bus publish failed: {0}")]
    Publish(String),
    #[error("broadcast bus subscribe failed: {0}")]
    Subscribe(String),
}

impl BusError {
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }

    pub fn subscribe(message: impl Into<String>) -> Self {
        Self::Subscribe(message.into())
    }
}

/// 跨实例的广播总线
///
/// 每个订阅者都会收到每一帧（包括发布者自己发出的帧），投递不保证持久。
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, payload: String) -> Result<(), BusError>;

    async fn subscribe(&self) -> Result<BusSubscription, BusError>;
}

/// 总线订阅句柄
pub enum BusSubscription {
    /// 进程内广播通道
    Local(broadcast::Receiver<String>),
    /// 由后台转发任务喂入的远端订阅
    Remote(mpsc::Receiver<String>),
}

impl BusSubscription {
    /// 等待下一帧；总线关闭后返回 `None`
    pub async fn recv(&mut self) -> Option<String> {
        match self {
            BusSubscription::Local(receiver) => loop {
                match receiver.recv().await {
                    Ok(payload) => return Some(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "总线订阅落后，部分帧未推送给本地连接");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            BusSubscription::Remote(receiver) => receiver.recv().await,
        }
    }
}
