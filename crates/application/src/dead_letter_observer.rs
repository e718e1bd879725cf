//! 死信观察者
//!
//! 独立消费者组读取死信主题，把每条死信记录交给运维可见的上报通道。不做任何恢复或回放。

use domain::{DeadLetterRecord, DomainError};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ApplicationError;
use crate::log::{receive_backoff, ConsumedRecord, LogConsumer, MAX_RECEIVE_RETRIES};

/// 死信上报通道
pub trait DeadLetterReporter: Send + Sync {
    fn report(&self, source: &ConsumedRecord, record: &DeadLetterRecord);

    /// 死信主题上出现无法解析的记录
    fn report_unreadable(&self, source: &ConsumedRecord, error: &DomainError);
}

/// 以告警日志形式上报
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl DeadLetterReporter for TracingReporter {
    fn report(&self, source: &ConsumedRecord, record: &DeadLetterRecord) {
        warn!(
            dlq_partition = source.partition,
            dlq_offset = source.offset,
            source_partition = record.source_partition,
            source_offset = record.source_offset,
            error = %record.error,
            original_payload = %record.original_payload,
            "收到死信记录"
        );
    }

    fn report_unreadable(&self, source: &ConsumedRecord, error: &DomainError) {
        error!(
            dlq_partition = source.partition,
            dlq_offset = source.offset,
            error = %error,
            payload = %source.payload_lossy(),
            "死信记录无法解析"
        );
    }
}

pub struct DeadLetterObserver<C: LogConsumer, R: DeadLetterReporter = TracingReporter> {
    consumer: C,
    reporter: R,
}

impl<C: LogConsumer> DeadLetterObserver<C> {
    pub fn new(consumer: C) -> Self {
        Self::with_reporter(consumer, TracingReporter)
    }
}

impl<C: LogConsumer, R: DeadLetterReporter> DeadLetterObserver<C, R> {
    pub fn with_reporter(consumer: C, reporter: R) -> Self {
        Self { consumer, reporter }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ApplicationError> {
        info!("死信观察者已启动");
        let mut retry_count = 0;
        let result = loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                batch = self.consumer.next_batch() => batch,
            };

            match batch {
                Ok(records) => {
                    retry_count = 0;
                    if records.is_empty() {
                        continue;
                    }
                    for record in &records {
                        self.observe(record);
                        if let Err(err) = self.consumer.resolve_offset(record) {
                            warn!(offset = record.offset, error = %err, "标记死信偏移量失败");
                        }
                    }
                    if let Err(err) = self.consumer.commit().await {
                        warn!(error = %err, "提交死信偏移量失败");
                    }
                }
                Err(err) => {
                    retry_count += 1;
                    if retry_count > MAX_RECEIVE_RETRIES {
                        error!(error = %err, "拉取死信连续失败，已达最大重试次数");
                        break Err(err);
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = sleep(receive_backoff(retry_count)) => {}
                    }
                }
            }
        };

        if let Err(err) = self.consumer.disconnect().await {
            error!(error = %err, "断开死信消费者失败");
        }
        info!("死信观察者已停止");
        result.map_err(ApplicationError::from)
    }

    fn observe(&self, record: &ConsumedRecord) {
        if record.is_empty() {
            return;
        }
        match DeadLetterRecord::decode(record.payload_bytes()) {
            Ok(dead_letter) => self.reporter.report(record, &dead_letter),
            Err(err) => self.reporter.report_unreadable(record, &err),
        }
    }
}
