//! 基于 Redis 频道的广播总线
//!
//! 发布走共享的 `ConnectionManager`；每个订阅独占一个 PubSub 连接，
//! 由后台任务把频道消息转发到订阅句柄，连接断开后按指数退避重连。

use application::{BusError, BusSubscription, MessageBus};
use async_trait::async_trait;
use config::RedisConfig;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::redis::{RedisError, RedisResult};

const SUBSCRIPTION_BUFFER: usize = 1024;
const MAX_RECONNECT_RETRIES: u32 = 5;
const RECONNECT_BASE_DELAY_MS: u64 = 500;

pub struct RedisMessageBus {
    client: Client,
    publisher: ConnectionManager,
    channel: String,
}

impl RedisMessageBus {
    /// 连接 Redis 并准备发布连接
    pub async fn connect(config: &RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| RedisError::ConfigError {
            message: format!("创建 Redis 客户端失败: {}", e),
        })?;
        let publisher = client
            .get_connection_manager()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("连接 Redis 失败: {}", e),
            })?;

        info!("Redis 广播总线已连接，频道: {}", config.channel);
        Ok(Self {
            client,
            publisher,
            channel: config.channel.clone(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn open_subscription(client: &Client, channel: &str) -> RedisResult<PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RedisError::ConnectionError {
            message: format!("获取 PubSub 连接失败: {}", e),
        })?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| RedisError::SubscribeError {
            message: format!("订阅频道 {} 失败: {}", channel, e),
        })?;
    Ok(pubsub)
}

/// 把频道消息转发给订阅者；订阅者关闭后返回 `true`
async fn forward(pubsub: PubSub, sender: &mpsc::Sender<String>) -> bool {
    let mut messages = pubsub.into_on_message();
    while let Some(message) = messages.next().await {
        match message.get_payload::<String>() {
            Ok(payload) => {
                if sender.send(payload).await.is_err() {
                    return true;
                }
            }
            Err(e) => warn!("获取消息负载失败: {}", e),
        }
    }
    false
}

async fn run_forwarder(client: Client, channel: String, first: PubSub, sender: mpsc::Sender<String>) {
    let mut pubsub = Some(first);
    let mut retry_count = 0;

    loop {
        if let Some(active) = pubsub.take() {
            retry_count = 0;
            if forward(active, &sender).await {
                debug!("订阅者已关闭，停止转发");
                return;
            }
            warn!("Redis 订阅连接已断开，准备重连");
        }

        if sender.is_closed() {
            return;
        }
        retry_count += 1;
        if retry_count > MAX_RECONNECT_RETRIES {
            error!("Redis 订阅重连失败，已达最大重试次数");
            return;
        }
        let delay = Duration::from_millis(RECONNECT_BASE_DELAY_MS * 2_u64.pow(retry_count - 1));
        sleep(delay).await;

        match open_subscription(&client, &channel).await {
            Ok(reconnected) => {
                info!("Redis 订阅已恢复，频道: {}", channel);
                pubsub = Some(reconnected);
            }
            Err(e) => error!("Redis 订阅重连失败: {}", e),
        }
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, payload: String) -> Result<(), BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(&self.channel, payload)
            .await
            .map_err(|e| RedisError::PublishError {
                message: e.to_string(),
            })?;
        debug!(channel = %self.channel, receivers, "已发布到广播频道");
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusSubscription, BusError> {
        let pubsub = open_subscription(&self.client, &self.channel).await?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(run_forwarder(
            self.client.clone(),
            self.channel.clone(),
            pubsub,
            sender,
        ));
        info!("已订阅广播频道: {}", self.channel);
        Ok(BusSubscription::Remote(receiver))
    }
}
