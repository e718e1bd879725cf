//! 进程内持久化日志
//!
//! 与 Kafka 相同的语义：按键哈希分区、分区内有序、消费者组独立记录已提交偏移量，
//! 已标记但未提交的偏移量在消费者丢弃后失效。

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use application::{ConsumedRecord, LogConsumer, LogError, RecordProducer, TopicAdmin, TopicSpec};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct LogState {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    committed: HashMap<(String, String, i32), i64>,
    heartbeats: HashMap<String, usize>,
    failing_appends: HashMap<String, usize>,
    unavailable: HashSet<String>,
}

impl LogState {
    fn partitions_mut(&mut self, topic: &str, default_partitions: usize) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| vec![Vec::new(); default_partitions.max(1)])
    }
}

struct Inner {
    state: Mutex<LogState>,
    appended: Notify,
    default_partitions: usize,
}

/// 进程内日志，克隆后共享同一份数据
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<Inner>,
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::with_partitions(1)
    }
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 自动创建的主题使用 `partitions` 个分区
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LogState::default()),
                appended: Notify::new(),
                default_partitions: partitions.max(1),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, LogState>, LogError> {
        self.inner.state.lock().map_err(|_| LogError::Connection {
            message: "in-memory log poisoned".into(),
        })
    }

    /// 加入消费者组并订阅主题
    pub fn consumer(
        &self,
        group: &str,
        topic: &str,
        batch_size: usize,
        poll_timeout: Duration,
    ) -> InMemoryConsumer {
        InMemoryConsumer {
            log: self.clone(),
            group: group.to_owned(),
            topic: topic.to_owned(),
            batch_size: batch_size.max(1),
            poll_timeout,
            positions: HashMap::new(),
            stored: HashMap::new(),
            paused: HashSet::new(),
        }
    }

    /// 主题中的全部记录，按分区再按偏移量排列
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, record)| ConsumedRecord {
                    topic: topic.to_owned(),
                    partition: partition as i32,
                    offset: offset as i64,
                    key: record.key.clone(),
                    payload: Some(record.payload.clone()),
                })
            })
            .collect()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.state().ok()?.topics.get(topic).map(Vec::len)
    }

    /// 消费者组在分区上已提交的下一个待消费偏移量
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .ok()?
            .committed
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    pub fn heartbeats(&self, group: &str) -> usize {
        self.state()
            .ok()
            .and_then(|state| state.heartbeats.get(group).copied())
            .unwrap_or(0)
    }

    /// 让接下来 `count` 次向 `topic` 的追加失败
    pub fn fail_next_appends(&self, topic: &str, count: usize) {
        if let Ok(mut state) = self.state() {
            state.failing_appends.insert(topic.to_owned(), count);
        }
    }

    /// 切换主题是否可写
    pub fn set_unavailable(&self, topic: &str, unavailable: bool) {
        if let Ok(mut state) = self.state() {
            if unavailable {
                state.unavailable.insert(topic.to_owned());
            } else {
                state.unavailable.remove(topic);
            }
        }
    }

    fn partition_for(key: Option<&str>, partitions: usize) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as usize
            }
            None => 0,
        }
    }
}

#[async_trait]
impl TopicAdmin for InMemoryLog {
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<(), LogError> {
        let mut state = self.state()?;
        for spec in topics {
            state
                .topics
                .entry(spec.name.clone())
                .or_insert_with(|| vec![Vec::new(); spec.partitions.max(1) as usize]);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordProducer for InMemoryLog {
    async fn send(&self, topic: &str, key: Option<&str>, payload: &str) -> Result<(), LogError> {
        {
            let mut state = self.state()?;
            if state.unavailable.contains(topic) {
                return Err(LogError::produce(topic, "topic unavailable"));
            }
            if let Some(remaining) = state.failing_appends.get_mut(topic) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LogError::produce(topic, "injected append failure"));
                }
            }

            let partitions = state.partitions_mut(topic, self.inner.default_partitions);
            let partition = Self::partition_for(key, partitions.len());
            partitions[partition].push(StoredRecord {
                key: key.map(str::to_owned),
                payload: payload.as_bytes().to_vec(),
            });
            debug!(topic, partition, "记录已追加到内存日志");
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }

    async fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }
}

/// 内存日志的消费者组成员
pub struct InMemoryConsumer {
    log: InMemoryLog,
    group: String,
    topic: String,
    batch_size: usize,
    poll_timeout: Duration,
    /// 下一次拉取的位置
    positions: HashMap<i32, i64>,
    /// 已标记、待提交的下一个偏移量
    stored: HashMap<i32, i64>,
    paused: HashSet<i32>,
}

impl InMemoryConsumer {
    fn take_available(&mut self) -> Result<Vec<ConsumedRecord>, LogError> {
        let state = self.log.state()?;
        let Some(partitions) = state.topics.get(&self.topic) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for (index, records) in partitions.iter().enumerate() {
            let partition = index as i32;
            if self.paused.contains(&partition) {
                continue;
            }
            let position = *self.positions.entry(partition).or_insert_with(|| {
                state
                    .committed
                    .get(&(self.group.clone(), self.topic.clone(), partition))
                    .copied()
                    .unwrap_or(0)
            });

            let mut next = position;
            while batch.len() < self.batch_size {
                let Some(record) = records.get(next as usize) else {
                    break;
                };
                batch.push(ConsumedRecord {
                    topic: self.topic.clone(),
                    partition,
                    offset: next,
                    key: record.key.clone(),
                    payload: Some(record.payload.clone()),
                });
                next += 1;
            }
            self.positions.insert(partition, next);
            if batch.len() >= self.batch_size {
                break;
            }
        }
        Ok(batch)
    }

    fn commit_stored(&mut self) -> Result<(), LogError> {
        let mut state = self.log.state()?;
        for (partition, offset) in &self.stored {
            state
                .committed
                .insert((self.group.clone(), self.topic.clone(), *partition), *offset);
        }
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for InMemoryConsumer {
    async fn next_batch(&mut self) -> Result<Vec<ConsumedRecord>, LogError> {
        let deadline = Instant::now() + self.poll_timeout;
        let inner = Arc::clone(&self.log.inner);
        loop {
            let notified = inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_available()?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn resolve_offset(&mut self, record: &ConsumedRecord) -> Result<(), LogError> {
        let next = record.offset + 1;
        let stored = self.stored.entry(record.partition).or_insert(next);
        *stored = (*stored).max(next);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), LogError> {
        self.commit_stored()
    }

    async fn heartbeat(&mut self) -> Result<(), LogError> {
        let mut state = self.log.state()?;
        *state.heartbeats.entry(self.group.clone()).or_insert(0) += 1;
        Ok(())
    }

    fn pause(&mut self, partition: i32) -> Result<(), LogError> {
        self.paused.insert(partition);
        Ok(())
    }

    fn resume(&mut self, partition: i32, from_offset: i64) -> Result<(), LogError> {
        self.paused.remove(&partition);
        self.positions.insert(partition, from_offset);
        self.log.inner.appended.notify_waiters();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LogError> {
        self.commit_stored()?;
        debug!(group = %self.group, topic = %self.topic, "内存消费者已断开");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn same_key_lands_in_same_partition_in_order() {
        let log = InMemoryLog::with_partitions(4);
        for i in 0..10 {
            log.send("t", Some("c1"), &i.to_string()).await.unwrap();
        }
        let records = log.records("t");
        assert_eq!(records.len(), 10);
        let partition = records[0].partition;
        assert!(records.iter().all(|r| r.partition == partition));
        let payloads: Vec<String> = records.iter().map(|r| r.payload_lossy().into_owned()).collect();
        assert_eq!(payloads, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn topic_creation_is_idempotent() {
        let log = InMemoryLog::new();
        let spec = TopicSpec {
            name: "t".into(),
            partitions: 3,
            replication_factor: 1,
            retention: Duration::from_secs(60),
            cleanup_policy: application::CleanupPolicy::Delete,
        };
        log.create_topics(std::slice::from_ref(&spec)).await.unwrap();
        log.send("t", None, "x").await.unwrap();
        log.create_topics(&[spec]).await.unwrap();
        assert_eq!(log.partition_count("t"), Some(3));
        assert_eq!(log.records("t").len(), 1);
    }

    #[tokio::test]
    async fn uncommitted_offsets_are_redelivered_to_new_member() {
        let log = InMemoryLog::new();
        for i in 0..3 {
            log.send("t", None, &i.to_string()).await.unwrap();
        }

        let mut first = log.consumer("g", "t", 10, POLL);
        let batch = first.next_batch().await.unwrap();
        assert_eq!(batch.len(), 3);
        first.resolve_offset(&batch[0]).unwrap();
        first.commit().await.unwrap();
        first.resolve_offset(&batch[1]).unwrap();
        drop(first);

        assert_eq!(log.committed_offset("g", "t", 0), Some(1));
        let mut second = log.consumer("g", "t", 10, POLL);
        let batch = second.next_batch().await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn paused_partition_is_not_delivered_until_resumed() {
        let log = InMemoryLog::new();
        log.send("t", None, "a").await.unwrap();
        let mut consumer = log.consumer("g", "t", 10, POLL);
        assert_eq!(consumer.next_batch().await.unwrap().len(), 1);

        consumer.pause(0).unwrap();
        log.send("t", None, "b").await.unwrap();
        assert!(consumer.next_batch().await.unwrap().is_empty());

        consumer.resume(0, 0).unwrap();
        let batch = consumer.next_batch().await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_append() {
        let log = InMemoryLog::new();
        let mut consumer = log.consumer("g", "t", 10, Duration::from_secs(5));
        let producer = log.clone();
        let handle = tokio::spawn(async move { consumer.next_batch().await });
        tokio::task::yield_now().await;
        producer.send("t", None, "late").await.unwrap();
        let batch = handle.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let log = InMemoryLog::new();
        log.fail_next_appends("t", 1);
        assert!(log.send("t", None, "x").await.is_err());
        assert!(log.send("t", None, "x").await.is_ok());

        log.set_unavailable("t", true);
        assert!(log.send("t", None, "y").await.is_err());
        log.set_unavailable("t", false);
        assert_eq!(log.records("t").len(), 1);
    }
}
