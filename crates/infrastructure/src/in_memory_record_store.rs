use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use taskgate_application::RecordStore;
use taskgate_core::AppResult;
use tokio::sync::Mutex;

/// In-memory record store implementation.
///
/// A single mutex covers the whole map so compare_and_swap observes and
/// replaces the record in one critical section.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<String, Value>>,
}

impl InMemoryRecordStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load_by_key(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn upsert(&self, key: &str, record: Value) -> AppResult<()> {
        self.records.lock().await.insert(key.to_owned(), record);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &Value,
        record: Value,
    ) -> AppResult<bool> {
        let mut records = self.records.lock().await;

        match records.get(key) {
            Some(current) if current == expected => {
                records.insert(key.to_owned(), record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_keys(&self, keys: &[String]) -> AppResult<()> {
        let mut records = self.records.lock().await;
        for key in keys {
            records.remove(key);
        }
        Ok(())
    }

    async fn load_all_by_prefix(&self, prefix: &str) -> AppResult<Vec<(String, Value)>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
