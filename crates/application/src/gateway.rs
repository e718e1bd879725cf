//! 实时网关
//!
//! 发布路径：成员校验 → 广播总线 → 持久化日志追加（只由发布实例执行）。
//! 接收路径：总线帧 → 本地连接推送，不再触发追加。

use std::sync::Arc;

use domain::{BusFrame, InstanceId, MessageEnvelope};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, BusSubscription, MessageBus};
use crate::durable_log::{AppendOutcome, DurableLogClient};
use crate::error::ApplicationError;
use crate::hub::ConnectionHub;
use crate::membership::MembershipGate;

pub struct RealtimeGateway {
    instance_id: InstanceId,
    membership: Arc<dyn MembershipGate>,
    bus: Arc<dyn MessageBus>,
    log: Arc<DurableLogClient>,
    hub: Arc<ConnectionHub>,
}

impl RealtimeGateway {
    pub fn new(
        instance_id: InstanceId,
        membership: Arc<dyn MembershipGate>,
        bus: Arc<dyn MessageBus>,
        log: Arc<DurableLogClient>,
        hub: Arc<ConnectionHub>,
    ) -> Self {
        Self {
            instance_id,
            membership,
            bus,
            log,
            hub,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// 校验发送者身份后把消息发布到广播总线，再追加到持久化日志
    ///
    /// 发送者不是会话成员时返回 [`ApplicationError::MembershipDenied`]，此时既不发布也不追加。
    /// 总线发布失败时同样不追加。追加失败由日志客户端转入死信通道，不会返回给调用方。
    pub async fn publish_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<MessageEnvelope, ApplicationError> {
        let envelope = MessageEnvelope::parse(conversation_id, sender_id, body)?;

        let allowed = self
            .membership
            .check_membership(envelope.sender_id(), envelope.conversation_id())
            .await?;
        if !allowed {
            warn!(
                conversation_id = %envelope.conversation_id(),
                sender_id = %envelope.sender_id(),
                "发送者不是会话成员，拒绝发布"
            );
            return Err(ApplicationError::MembershipDenied {
                sender: envelope.sender_id().clone(),
                conversation: envelope.conversation_id().clone(),
            });
        }

        let frame = BusFrame::message(self.instance_id.clone(), envelope.clone());
        self.bus.publish(frame.encode()?).await?;

        // 发布实例是唯一写入方，追加不依赖本实例能否收到自己的总线帧
        let outcome = self.log.append_message(&envelope).await?;
        if outcome != AppendOutcome::Delivered {
            warn!(
                conversation_id = %envelope.conversation_id(),
                outcome = ?outcome,
                "消息追加失败，已转入死信通道"
            );
        }

        info!(
            conversation_id = %envelope.conversation_id(),
            sender_id = %envelope.sender_id(),
            "消息已发布到广播总线"
        );
        Ok(envelope)
    }

    /// 把一帧总线消息推送给本地连接，返回收到推送的连接数
    pub async fn handle_bus_payload(&self, raw: &str) -> Result<usize, ApplicationError> {
        let frame = BusFrame::decode(raw)?;
        let envelope = frame.envelope();
        let payload = envelope.to_payload()?;

        let local_clients = self.hub.broadcast(&payload).await;
        debug!(
            conversation_id = %envelope.conversation_id(),
            local_clients,
            own_frame = frame.is_originated_by(&self.instance_id),
            "总线消息已推送给本地连接"
        );
        Ok(local_clients)
    }

    /// 持续消费总线订阅直到关闭
    ///
    /// 订阅在关闭信号之前结束时返回错误，由调用方决定是否停止整个进程。
    pub async fn run_bus_listener(
        self: Arc<Self>,
        mut subscription: BusSubscription,
        shutdown: CancellationToken,
    ) -> Result<(), BusError> {
        info!(instance_id = %self.instance_id, "总线监听已启动");
        loop {
            let raw = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(raw) => raw,
                    None => {
                        error!(instance_id = %self.instance_id, "总线订阅意外结束");
                        return Err(BusError::subscribe("subscription closed"));
                    }
                },
            };

            if let Err(err) = self.handle_bus_payload(&raw).await {
                if err.is_malformed() {
                    error!(error = %err, payload = %raw, "丢弃无法解析的总线帧");
                } else {
                    error!(error = %err, "处理总线帧失败");
                }
            }
        }
        info!(instance_id = %self.instance_id, "总线监听已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use domain::{ConversationId, UserId};

    use super::*;
    use crate::durable_log::{DeadLetterPolicy, TopicNames};
    use crate::log::{LogError, RecordProducer};
    use crate::membership::{MembershipError, MockMembershipGate};

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, payload: String) -> Result<(), BusError> {
            self.published.lock().unwrap().push(payload);
            Ok(())
        }

        async fn subscribe(&self) -> Result<BusSubscription, BusError> {
            Err(BusError::subscribe("not supported"))
        }
    }

    #[derive(Default)]
    struct RecordingProducer {
        sent: Mutex<Vec<(String, Option<String>)>>,
    }

    #[async_trait]
    impl RecordProducer for RecordingProducer {
        async fn send(&self, topic: &str, key: Option<&str>, _payload: &str) -> Result<(), LogError> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_owned(), key.map(str::to_owned)));
            Ok(())
        }

        async fn flush(&self) -> Result<(), LogError> {
            Ok(())
        }
    }

    struct Fixture {
        gateway: RealtimeGateway,
        bus: Arc<RecordingBus>,
        producer: Arc<RecordingProducer>,
    }

    fn fixture(instance: &str, membership: impl MembershipGate + 'static) -> Fixture {
        let bus = Arc::new(RecordingBus::default());
        let producer = Arc::new(RecordingProducer::default());
        let log = Arc::new(DurableLogClient::new(
            producer.clone(),
            TopicNames {
                messages: "MESSAGES".into(),
                dead_letter: "MESSAGES_DLQ".into(),
            },
            DeadLetterPolicy::default(),
        ));
        let gateway = RealtimeGateway::new(
            InstanceId::parse(instance).unwrap(),
            Arc::new(membership),
            bus.clone(),
            log,
            Arc::new(ConnectionHub::new()),
        );
        Fixture {
            gateway,
            bus,
            producer,
        }
    }

    #[tokio::test]
    async fn non_member_is_rejected_without_side_effects() {
        let mut gate = MockMembershipGate::new();
        gate.expect_check_membership()
            .withf(|sender: &UserId, conversation: &ConversationId| {
                sender.as_str() == "attacker" && conversation.as_str() == "c1"
            })
            .times(1)
            .returning(|_, _| Ok(false));
        let fx = fixture("node-a", gate);

        let err = fx.gateway.publish_message("c1", "attacker", "hi").await.unwrap_err();

        assert!(err.is_permission_denied());
        assert!(fx.bus.published.lock().unwrap().is_empty());
        assert!(fx.producer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn membership_backend_failure_is_not_a_denial() {
        let mut gate = MockMembershipGate::new();
        gate.expect_check_membership()
            .returning(|_, _| Err(MembershipError::Unavailable("timeout".into())));
        let fx = fixture("node-a", gate);

        let err = fx.gateway.publish_message("c1", "alice", "hi").await.unwrap_err();

        assert!(!err.is_permission_denied());
        assert!(matches!(err, ApplicationError::Membership(_)));
        assert!(fx.bus.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_membership_check() {
        let mut gate = MockMembershipGate::new();
        gate.expect_check_membership().never();
        let fx = fixture("node-a", gate);

        let err = fx.gateway.publish_message("c1", "alice", "   ").await.unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn member_publish_tags_frame_and_appends_once() {
        let mut gate = MockMembershipGate::new();
        gate.expect_check_membership().returning(|_, _| Ok(true));
        let fx = fixture("node-a", gate);

        fx.gateway.publish_message("c1", "alice", "hi").await.unwrap();

        let published = fx.bus.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let frame = BusFrame::decode(&published[0]).unwrap();
        assert_eq!(frame.origin().as_str(), "node-a");
        assert_eq!(frame.envelope().body().as_str(), "hi");
        assert_eq!(
            *fx.producer.sent.lock().unwrap(),
            vec![("MESSAGES".to_string(), Some("c1".to_string()))]
        );
    }

    #[tokio::test]
    async fn failed_bus_publish_is_not_appended() {
        struct DownBus;

        #[async_trait]
        impl MessageBus for DownBus {
            async fn publish(&self, _payload: String) -> Result<(), BusError> {
                Err(BusError::publish("connection refused"))
            }

            async fn subscribe(&self) -> Result<BusSubscription, BusError> {
                Err(BusError::subscribe("connection refused"))
            }
        }

        let mut gate = MockMembershipGate::new();
        gate.expect_check_membership().returning(|_, _| Ok(true));
        let producer = Arc::new(RecordingProducer::default());
        let gateway = RealtimeGateway::new(
            InstanceId::parse("node-a").unwrap(),
            Arc::new(gate),
            Arc::new(DownBus),
            Arc::new(DurableLogClient::new(
                producer.clone(),
                TopicNames {
                    messages: "MESSAGES".into(),
                    dead_letter: "MESSAGES_DLQ".into(),
                },
                DeadLetterPolicy::default(),
            )),
            Arc::new(ConnectionHub::new()),
        );

        let err = gateway.publish_message("c1", "alice", "hi").await.unwrap_err();
        assert!(matches!(err, ApplicationError::Bus(_)));
        assert!(producer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bus_frames_are_only_fanned_out() {
        let envelope = MessageEnvelope::parse("c1", "alice", "hi").unwrap();
        let raw = BusFrame::message(InstanceId::parse("node-a").unwrap(), envelope)
            .encode()
            .unwrap();

        for instance in ["node-a", "node-b"] {
            let fx = fixture(instance, MockMembershipGate::new());
            let (_, mut client) = fx.gateway.hub().register().await;
            let delivered = fx.gateway.handle_bus_payload(&raw).await.unwrap();
            assert_eq!(delivered, 1);
            let pushed: serde_json::Value =
                serde_json::from_str(&client.recv().await.unwrap()).unwrap();
            assert_eq!(pushed["conversationId"], "c1");
            assert!(fx.producer.sent.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn listener_reports_subscription_that_ends_before_shutdown() {
        let fx = fixture("node-a", MockMembershipGate::new());
        let gateway = Arc::new(fx.gateway);

        let (sender, receiver) = tokio::sync::mpsc::channel(1);
        drop(sender);
        let result = Arc::clone(&gateway)
            .run_bus_listener(BusSubscription::Remote(receiver), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(BusError::Subscribe(_))));

        let (_sender, receiver) = tokio::sync::mpsc::channel(1);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let result = gateway
            .run_bus_listener(BusSubscription::Remote(receiver), shutdown)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn malformed_frame_is_a_distinct_error() {
        let fx = fixture("node-a", MockMembershipGate::new());
        let err = fx.gateway.handle_bus_payload("{\"hello\":1}").await.unwrap_err();
        assert!(err.is_malformed());
    }
}
