// 进程内广播总线，语义与 Redis 频道一致：无订阅者时消息直接丢失
use application::{BusError, BusSubscription, MessageBus};
use async_trait::async_trait;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct LocalMessageBus {
    sender: broadcast::Sender<String>,
}

impl LocalMessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalMessageBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    async fn publish(&self, payload: String) -> Result<(), BusError> {
        if self.sender.receiver_count() == 0 {
            return Ok(());
        }
        self.sender
            .send(payload)
            .map_err(|err| BusError::publish(err.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusSubscription, BusError> {
        Ok(BusSubscription::Local(self.sender.subscribe()))
    }
}
