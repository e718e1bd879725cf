use std::sync::Arc;

use application::{
    LogConsumer, MembershipGate, MessageBus, MessageStore, RecordProducer, StaticMembershipGate,
    TopicAdmin,
};
use config::{AppConfig, BusBackend, KafkaConfig, LogBackend, MembershipBackend, StoreBackend};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::kafka::{KafkaError, KafkaLogConsumer, KafkaRecordProducer, KafkaTopicAdmin};
use crate::memory::{InMemoryLog, InMemoryMessageStore, LocalMessageBus};
use crate::openfga::OpenFgaMembershipGate;
use crate::postgres::{create_pg_pool, PgMembershipGate, PgMessageStore, MIGRATOR};
use crate::redis::{RedisError, RedisMessageBus};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
    #[error("configuration error: {0}")]
    Config(String),
}

enum LogHandle {
    Kafka(KafkaConfig),
    Memory(InMemoryLog),
}

/// 按配置装配好的适配器集合
pub struct Infrastructure {
    pub producer: Arc<dyn RecordProducer>,
    pub admin: Arc<dyn TopicAdmin>,
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn MessageStore>,
    pub membership: Arc<dyn MembershipGate>,
    log: LogHandle,
    batch_size: usize,
    poll_timeout: std::time::Duration,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let (producer, admin, log): (Arc<dyn RecordProducer>, Arc<dyn TopicAdmin>, LogHandle) =
            match config.pipeline.log {
                LogBackend::Kafka => (
                    Arc::new(KafkaRecordProducer::new(&config.kafka)),
                    Arc::new(KafkaTopicAdmin::new(&config.kafka)?),
                    LogHandle::Kafka(config.kafka.clone()),
                ),
                LogBackend::Memory => {
                    warn!("使用进程内日志，重启后日志内容丢失");
                    let log = InMemoryLog::with_partitions(config.kafka.partitions.max(1) as usize);
                    (Arc::new(log.clone()), Arc::new(log.clone()), LogHandle::Memory(log))
                }
            };

        let bus: Arc<dyn MessageBus> = match config.pipeline.bus {
            BusBackend::Redis => Arc::new(RedisMessageBus::connect(&config.redis).await?),
            BusBackend::Local => {
                warn!("使用进程内广播总线，只适用于单实例");
                Arc::new(LocalMessageBus::default())
            }
        };

        let needs_database = config.pipeline.store == StoreBackend::Postgres
            || config.pipeline.membership == MembershipBackend::Postgres;
        let pool = if needs_database {
            Some(connect_database(config).await?)
        } else {
            None
        };

        let store: Arc<dyn MessageStore> = match (config.pipeline.store, &pool) {
            (StoreBackend::Postgres, Some(pool)) => Arc::new(PgMessageStore::new(pool.clone())),
            (StoreBackend::Postgres, None) => {
                return Err(InfrastructureError::Config("postgres store without pool".into()))
            }
            (StoreBackend::Memory, _) => Arc::new(InMemoryMessageStore::new()),
        };

        let membership: Arc<dyn MembershipGate> = match (config.pipeline.membership, &pool) {
            (MembershipBackend::Postgres, Some(pool)) => Arc::new(PgMembershipGate::new(pool.clone())),
            (MembershipBackend::Postgres, None) => {
                return Err(InfrastructureError::Config(
                    "postgres membership without pool".into(),
                ))
            }
            (MembershipBackend::Openfga, _) => {
                let fga = config.openfga.as_ref().ok_or_else(|| {
                    InfrastructureError::Config("openfga settings are required".into())
                })?;
                Arc::new(OpenFgaMembershipGate::new(fga))
            }
            (MembershipBackend::AllowAll, _) => {
                warn!("成员校验已关闭，任何发送者都可以向任何会话发消息");
                Arc::new(StaticMembershipGate::allow_all())
            }
        };

        Ok(Self {
            producer,
            admin,
            bus,
            store,
            membership,
            log,
            batch_size: config.kafka.batch_size,
            poll_timeout: config.kafka.poll_timeout(),
        })
    }

    /// 为指定消费者组创建日志消费者
    pub fn consumer(&self, group: &str, topic: &str) -> Result<Box<dyn LogConsumer>, InfrastructureError> {
        match &self.log {
            LogHandle::Kafka(kafka) => Ok(Box::new(KafkaLogConsumer::new(kafka, group, topic)?)),
            LogHandle::Memory(log) => Ok(Box::new(log.consumer(
                group,
                topic,
                self.batch_size,
                self.poll_timeout,
            ))),
        }
    }
}

async fn connect_database(config: &AppConfig) -> Result<PgPool, InfrastructureError> {
    let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
    MIGRATOR.run(&pool).await?;
    info!("数据库已连接，迁移完成");
    Ok(pool)
}
