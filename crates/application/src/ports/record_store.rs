use async_trait::async_trait;
use serde_json::Value;
use taskgate_core::AppResult;

/// Key prefix for persisted approval requests.
pub const APPROVAL_KEY_PREFIX: &str = "approval:";

/// Key prefix for persisted job records.
pub const JOB_KEY_PREFIX: &str = "job:";

/// Returns the record key for one approval request id.
#[must_use]
pub fn approval_key(approval_id: &str) -> String {
    format!("{APPROVAL_KEY_PREFIX}{approval_id}")
}

/// Returns the record key for one job id.
#[must_use]
pub fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

/// Keyed JSON record persistence port.
///
/// Approval requests and job records share this abstraction under distinct
/// key prefixes; the backing store is interchangeable.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns one record by key.
    async fn load_by_key(&self, key: &str) -> AppResult<Option<Value>>;

    /// Creates or replaces one record.
    async fn upsert(&self, key: &str, record: Value) -> AppResult<()>;

    /// Replaces one record only when its current value equals `expected`.
    ///
    /// Returns false when the stored value differs or the key is absent. This
    /// conditional write is what serializes concurrent approval resolutions;
    /// a read-then-write without it would lose the single-winner guarantee.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &Value,
        record: Value,
    ) -> AppResult<bool>;

    /// Deletes the given keys; missing keys are ignored.
    async fn delete_by_keys(&self, keys: &[String]) -> AppResult<()>;

    /// Returns every record whose key starts with `prefix`.
    async fn load_all_by_prefix(&self, prefix: &str) -> AppResult<Vec<(String, Value)>>;
}
