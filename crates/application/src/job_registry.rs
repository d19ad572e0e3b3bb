use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskgate_core::{AppError, AppResult};
use taskgate_domain::{JobRecord, JobRecordPatch, JobSpec};
use tracing::warn;

use crate::ports::{JOB_KEY_PREFIX, RecordStore, WorkspaceCleaner, job_key};

/// Retention limits applied by `enforce_cleanup`.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    /// Maximum number of resumable-type records kept after age eviction.
    pub max_entries: Option<usize>,
    /// Maximum record age in seconds; older records are always evicted.
    pub max_age_seconds: Option<i64>,
    /// Job types that participate in count-based eviction.
    pub resumable_job_types: BTreeSet<String>,
}

/// Persisted job registry.
///
/// Owns every job record; workers mutate through `update` calls only. Record
/// removal also removes the job's working directory best-effort.
#[derive(Clone)]
pub struct JobRegistry {
    records: Arc<dyn RecordStore>,
    workspaces: Arc<dyn WorkspaceCleaner>,
}

impl JobRegistry {
    /// Creates a registry over a record store and a workspace cleaner.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>, workspaces: Arc<dyn WorkspaceCleaner>) -> Self {
        Self {
            records,
            workspaces,
        }
    }

    /// Persists a freshly queued record for the given job.
    pub async fn save_queued(
        &self,
        job: JobSpec,
        workdir: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<JobRecord> {
        let record = JobRecord::queued(job, workdir, now);
        self.persist(&record).await?;
        Ok(record)
    }

    /// Returns one job record by id.
    pub async fn load(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        let record = self.records.load_by_key(job_key(job_id).as_str()).await?;
        record.map(|value| decode_record(job_id, value)).transpose()
    }

    /// Merges a patch into one record and bumps its update timestamp.
    pub async fn update(
        &self,
        job_id: &str,
        patch: JobRecordPatch,
        now: DateTime<Utc>,
    ) -> AppResult<JobRecord> {
        let Some(mut record) = self.load(job_id).await? else {
            return Err(AppError::NotFound(format!(
                "job record '{job_id}' does not exist"
            )));
        };

        record.apply_patch(patch, now);
        self.persist(&record).await?;
        Ok(record)
    }

    /// Returns every decodable job record; undecodable records are skipped.
    pub async fn load_all(&self) -> AppResult<Vec<JobRecord>> {
        let raw = self.records.load_all_by_prefix(JOB_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(raw.len());

        for (key, value) in raw {
            match serde_json::from_value::<JobRecord>(value) {
                Ok(record) => records.push(record),
                Err(error) => {
                    warn!(record_key = %key, error = %error, "skipping undecodable job record");
                }
            }
        }

        Ok(records)
    }

    /// Deletes the given records and their working directories.
    ///
    /// Directory removal is best-effort: failures are logged, never fatal.
    pub async fn delete(&self, job_ids: &[String]) -> AppResult<()> {
        for job_id in job_ids {
            let record = match self.load(job_id.as_str()).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    warn!(
                        job_id = %job_id,
                        error = %error,
                        "failed to load job record before deletion; skipping workdir removal"
                    );
                    continue;
                }
            };
            let Some(workdir) = record.workdir else {
                continue;
            };
            if let Err(error) = self.workspaces.remove_workspace(workdir.as_str()).await {
                warn!(
                    job_id = %job_id,
                    workdir = %workdir,
                    error = %error,
                    "failed to remove job working directory"
                );
            }
        }

        let keys: Vec<String> = job_ids.iter().map(|job_id| job_key(job_id)).collect();
        self.records.delete_by_keys(keys.as_slice()).await
    }

    /// Stamps a durable soft-delete deadline onto one record.
    ///
    /// Deletion happens when `sweep_due_deletions` next runs past the
    /// deadline, so a process restart never loses the scheduled removal.
    pub async fn mark_for_deletion(
        &self,
        job_id: &str,
        ttl_ms: u64,
        now: DateTime<Utc>,
    ) -> AppResult<JobRecord> {
        let ttl_ms = i64::try_from(ttl_ms).map_err(|error| {
            AppError::Validation(format!("invalid deletion ttl_ms value: {error}"))
        })?;
        let patch = JobRecordPatch {
            delete_at: Some(now + Duration::milliseconds(ttl_ms)),
            ..JobRecordPatch::default()
        };

        self.update(job_id, patch, now).await
    }

    /// Deletes every record whose soft-delete deadline has passed.
    pub async fn sweep_due_deletions(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let due: Vec<String> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|record| record.delete_at.is_some_and(|delete_at| delete_at <= now))
            .map(|record| record.job.job_id)
            .collect();

        if !due.is_empty() {
            self.delete(due.as_slice()).await?;
        }

        Ok(due)
    }

    /// Returns the most recent record matching one channel/thread identity.
    pub async fn find_latest_by_channel_thread(
        &self,
        provider: &str,
        channel_id: &str,
        thread_id: Option<&str>,
        agent_id: Option<&str>,
    ) -> AppResult<Option<JobRecord>> {
        self.find_latest(provider, channel_id, thread_id, agent_id, None)
            .await
    }

    /// Returns the most recent record matching a channel/thread identity and
    /// one of the given job types.
    pub async fn find_latest_by_channel_thread_and_types(
        &self,
        provider: &str,
        channel_id: &str,
        thread_id: Option<&str>,
        agent_id: Option<&str>,
        job_types: &BTreeSet<String>,
    ) -> AppResult<Option<JobRecord>> {
        self.find_latest(provider, channel_id, thread_id, agent_id, Some(job_types))
            .await
    }

    /// Applies the retention policy: age eviction first, then count eviction
    /// of the oldest resumable-type records. Returns the removed job ids.
    pub async fn enforce_cleanup(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<String>> {
        let mut records = self.load_all().await?;
        let mut removed: Vec<String> = Vec::new();

        if let Some(max_age_seconds) = policy.max_age_seconds {
            let cutoff = now - Duration::seconds(max_age_seconds);
            let (expired, kept): (Vec<JobRecord>, Vec<JobRecord>) = records
                .into_iter()
                .partition(|record| record.created_at < cutoff);
            removed.extend(expired.into_iter().map(|record| record.job.job_id));
            records = kept;
        }

        if let Some(max_entries) = policy.max_entries {
            let mut resumable: Vec<&JobRecord> = records
                .iter()
                .filter(|record| policy.resumable_job_types.contains(&record.job.job_type))
                .collect();

            if resumable.len() > max_entries {
                resumable.sort_by_key(|record| record.created_at);
                let excess = resumable.len() - max_entries;
                removed.extend(
                    resumable
                        .iter()
                        .take(excess)
                        .map(|record| record.job.job_id.clone()),
                );
            }
        }

        if !removed.is_empty() {
            self.delete(removed.as_slice()).await?;
        }

        Ok(removed)
    }

    async fn find_latest(
        &self,
        provider: &str,
        channel_id: &str,
        thread_id: Option<&str>,
        agent_id: Option<&str>,
        job_types: Option<&BTreeSet<String>>,
    ) -> AppResult<Option<JobRecord>> {
        let records = self.load_all().await?;
        let mut latest: Option<JobRecord> = None;

        for record in records {
            if record.job.provider != provider || record.job.channel_id != channel_id {
                continue;
            }
            if record.job.thread_id.as_deref() != thread_id {
                continue;
            }
            if let Some(agent_id) = agent_id
                && record.job.agent_id.as_deref() != Some(agent_id)
            {
                continue;
            }
            if let Some(job_types) = job_types
                && !job_types.contains(&record.job.job_type)
            {
                continue;
            }

            // Strictly-greater keeps the incumbent on timestamp ties.
            match &latest {
                Some(best) if record.created_at <= best.created_at => {}
                _ => latest = Some(record),
            }
        }

        Ok(latest)
    }

    async fn persist(&self, record: &JobRecord) -> AppResult<()> {
        let value = serde_json::to_value(record).map_err(|error| {
            AppError::Internal(format!(
                "failed to serialize job record '{}': {error}",
                record.job.job_id
            ))
        })?;

        self.records
            .upsert(job_key(record.job.job_id.as_str()).as_str(), value)
            .await
    }
}

fn decode_record(job_id: &str, value: serde_json::Value) -> AppResult<JobRecord> {
    serde_json::from_value(value).map_err(|error| {
        AppError::Internal(format!(
            "failed to deserialize job record '{job_id}': {error}"
        ))
    })
}
