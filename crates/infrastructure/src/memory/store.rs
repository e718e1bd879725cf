use std::sync::Mutex;

use application::{MessageStore, StoreError};
use async_trait::async_trait;
use domain::DurableRecord;

/// 内存消息存储，可注入失败
#[derive(Default)]
pub struct InMemoryMessageStore {
    records: Mutex<Vec<DurableRecord>>,
    failures: Mutex<usize>,
    unavailable: Mutex<bool>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DurableRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// 接下来 `count` 次写入失败
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = count;
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = unavailable;
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn persist(&self, record: &DurableRecord) -> Result<(), StoreError> {
        if self.unavailable.lock().map(|flag| *flag).unwrap_or(false) {
            return Err(StoreError::unavailable("store offline"));
        }
        {
            let mut failures = self
                .failures
                .lock()
                .map_err(|err| StoreError::unavailable(err.to_string()))?;
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::unavailable("injected persistence failure"));
            }
        }
        self.records
            .lock()
            .map_err(|err| StoreError::unavailable(err.to_string()))?
            .push(record.clone());
        Ok(())
    }
}
