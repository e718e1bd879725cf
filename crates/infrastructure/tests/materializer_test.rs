use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{
    ConsumedRecord, DeadLetterObserver, DeadLetterPolicy, DeadLetterReporter, DurableLogClient,
    Materializer, MessageStore, StoreError, TopicNames,
};
use async_trait::async_trait;
use domain::{DeadLetterRecord, DomainError, DurableRecord, MessageEnvelope};
use infrastructure::{InMemoryLog, InMemoryMessageStore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const MESSAGES: &str = "MESSAGES";
const DEAD_LETTER: &str = "MESSAGES_DLQ";
const GROUP: &str = "chat-materializer";
const POLL: Duration = Duration::from_millis(50);
const COOLDOWN: Duration = Duration::from_secs(10);

fn log_client(log: &InMemoryLog) -> Arc<DurableLogClient> {
    Arc::new(DurableLogClient::new(
        Arc::new(log.clone()),
        TopicNames {
            messages: MESSAGES.into(),
            dead_letter: DEAD_LETTER.into(),
        },
        DeadLetterPolicy::default(),
    ))
}

fn materializer(log: &InMemoryLog, store: Arc<dyn MessageStore>) -> Materializer<infrastructure::InMemoryConsumer> {
    Materializer::new(
        log.consumer(GROUP, MESSAGES, 100, POLL),
        store,
        log_client(log),
        COOLDOWN,
    )
}

async fn append(client: &DurableLogClient, conversation: &str, body: &str) -> MessageEnvelope {
    let envelope = MessageEnvelope::parse(conversation, "alice", body).unwrap();
    client.append_message(&envelope).await.unwrap();
    envelope
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(Duration::from_secs(30), async {
        while !done() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn bodies_for(records: &[DurableRecord], conversation: &str) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.envelope.conversation_id().as_str() == conversation)
        .map(|r| r.envelope.body().as_str().to_owned())
        .collect()
}

/// 持久化成功后、提交前崩溃一次
struct CrashAfterPersist {
    inner: Arc<InMemoryMessageStore>,
    crash_offset: i64,
    crashed: AtomicBool,
}

#[async_trait]
impl MessageStore for CrashAfterPersist {
    async fn persist(&self, record: &DurableRecord) -> Result<(), StoreError> {
        self.inner.persist(record).await?;
        if record.offset == self.crash_offset && !self.crashed.swap(true, Ordering::SeqCst) {
            panic!("simulated crash after persisting offset {}", record.offset);
        }
        Ok(())
    }
}

/// 指定偏移量的前几次写入失败
struct FailAtOffset {
    inner: Arc<InMemoryMessageStore>,
    offset: i64,
    remaining: AtomicUsize,
}

#[async_trait]
impl MessageStore for FailAtOffset {
    async fn persist(&self, record: &DurableRecord) -> Result<(), StoreError> {
        if record.offset == self.offset
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::unavailable("connection reset"));
        }
        self.inner.persist(record).await
    }
}

#[derive(Clone, Default)]
struct Collector {
    seen: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl DeadLetterReporter for Collector {
    fn report(&self, _source: &ConsumedRecord, record: &DeadLetterRecord) {
        self.seen.lock().unwrap().push(record.clone());
    }

    fn report_unreadable(&self, _source: &ConsumedRecord, _error: &DomainError) {}
}

#[tokio::test]
async fn records_of_one_conversation_are_persisted_in_append_order() {
    let log = InMemoryLog::with_partitions(4);
    let client = log_client(&log);
    let store = Arc::new(InMemoryMessageStore::new());
    let shutdown = CancellationToken::new();

    let mut expected: HashMap<&str, Vec<String>> = HashMap::new();
    for i in 0..20 {
        for conversation in ["c1", "c2", "c3"] {
            let body = format!("{conversation}-{i}");
            append(&client, conversation, &body).await;
            expected.entry(conversation).or_default().push(body);
        }
    }

    let handle = tokio::spawn(materializer(&log, store.clone()).run(shutdown.clone()));
    wait_until(|| store.records().len() == 60).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let persisted = store.records();
    for (conversation, bodies) in expected {
        assert_eq!(bodies_for(&persisted, conversation), bodies);
    }
    assert_eq!(log.heartbeats(GROUP), 60);
    assert!(log.records(DEAD_LETTER).is_empty());
}

#[tokio::test]
async fn crash_before_commit_redelivers_the_persisted_record() {
    let log = InMemoryLog::new();
    let client = log_client(&log);
    for i in 0..5 {
        append(&client, "c1", &format!("m{i}")).await;
    }

    let inner = Arc::new(InMemoryMessageStore::new());
    let crashing = Arc::new(CrashAfterPersist {
        inner: inner.clone(),
        crash_offset: 2,
        crashed: AtomicBool::new(false),
    });
    let shutdown = CancellationToken::new();
    let crashed = tokio::spawn(materializer(&log, crashing).run(shutdown.clone()))
        .await
        .unwrap_err();
    assert!(crashed.is_panic());
    assert_eq!(log.committed_offset(GROUP, MESSAGES, 0), None);

    let handle = tokio::spawn(materializer(&log, inner.clone()).run(shutdown.clone()));
    wait_until(|| inner.records().len() == 8).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let offsets: Vec<i64> = inner.records().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 0, 1, 2, 3, 4]);
    assert_eq!(log.committed_offset(GROUP, MESSAGES, 0), Some(5));
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_dead_letters_and_pauses_the_partition() {
    let log = InMemoryLog::new();
    let client = log_client(&log);
    let mut envelopes = Vec::new();
    for i in 0..3 {
        envelopes.push(append(&client, "c1", &format!("m{i}")).await);
    }

    let inner = Arc::new(InMemoryMessageStore::new());
    let store = Arc::new(FailAtOffset {
        inner: inner.clone(),
        offset: 1,
        remaining: AtomicUsize::new(1),
    });
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(materializer(&log, store).run(shutdown.clone()));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(inner.records().len(), 1);
    let dead = log.records(DEAD_LETTER);
    assert_eq!(dead.len(), 1);
    let record = DeadLetterRecord::decode(dead[0].payload_bytes()).unwrap();
    assert_eq!(record.original_payload, envelopes[1].to_payload().unwrap());
    assert_eq!(record.source_partition, Some(0));
    assert_eq!(record.source_offset, Some(1));
    assert!(record.error.contains("connection reset"));
    assert_eq!(log.committed_offset(GROUP, MESSAGES, 0), Some(1));

    envelopes.push(append(&client, "c1", "m3").await);
    sleep(Duration::from_secs(4)).await;
    assert_eq!(inner.records().len(), 1, "paused partition delivers nothing");

    sleep(Duration::from_secs(2)).await;
    let offsets: Vec<i64> = inner.records().iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3]);
    assert_eq!(log.records(DEAD_LETTER).len(), 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(log.committed_offset(GROUP, MESSAGES, 0), Some(4));
}

#[tokio::test]
async fn malformed_and_empty_records_do_not_block_the_partition() {
    let log = InMemoryLog::new();
    let client = log_client(&log);
    append(&client, "c1", "before").await;
    client.append(MESSAGES, Some("c1"), "not json").await;
    client.append(MESSAGES, Some("c1"), "").await;
    append(&client, "c1", "after").await;

    let store = Arc::new(InMemoryMessageStore::new());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(materializer(&log, store.clone()).run(shutdown.clone()));
    wait_until(|| store.records().len() == 2).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(bodies_for(&store.records(), "c1"), vec!["before", "after"]);
    let dead = log.records(DEAD_LETTER);
    assert_eq!(dead.len(), 1);
    let record = DeadLetterRecord::decode(dead[0].payload_bytes()).unwrap();
    assert_eq!(record.original_payload, "not json");
    assert_eq!(record.source_offset, Some(1));
    assert_eq!(log.committed_offset(GROUP, MESSAGES, 0), Some(4));
}

#[tokio::test(start_paused = true)]
async fn every_dead_letter_reaches_the_observer() {
    let log = InMemoryLog::new();
    let client = log_client(&log);
    let envelope = append(&client, "c1", "doomed").await;

    let store = Arc::new(InMemoryMessageStore::new());
    store.fail_next(1);
    let collector = Collector::default();
    let shutdown = CancellationToken::new();

    let materializer = tokio::spawn(materializer(&log, store.clone()).run(shutdown.clone()));
    let observer = tokio::spawn(
        DeadLetterObserver::with_reporter(
            log.consumer("chat-dead-letter", DEAD_LETTER, 100, POLL),
            collector.clone(),
        )
        .run(shutdown.clone()),
    );

    sleep(Duration::from_secs(1)).await;
    let seen = collector.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].original_payload, envelope.to_payload().unwrap());
    assert_eq!(seen[0].source_offset, Some(0));

    // 冷却期结束后重新投递并落库，不再产生新的死信
    sleep(COOLDOWN).await;
    assert_eq!(store.records().len(), 1);
    assert_eq!(collector.seen.lock().unwrap().len(), 1);

    shutdown.cancel();
    materializer.await.unwrap().unwrap();
    observer.await.unwrap().unwrap();
    assert_eq!(log.committed_offset("chat-dead-letter", DEAD_LETTER, 0), Some(1));
}
