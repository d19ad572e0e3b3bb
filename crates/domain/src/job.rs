use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted and published, waiting for a worker.
    Queued,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully.
    Ok,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Returns a stable storage value for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }
}

/// Reference to a merge request opened by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestRef {
    /// Repository the merge request targets.
    pub repo: String,
    /// Merge request URL on the source host.
    pub url: String,
}

/// Specification of one coding-agent job, carried through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job identifier, also the queue dedup key.
    pub job_id: String,
    /// Job type name, used by retention and thread lookup filters.
    pub job_type: String,
    /// Chat provider the job was requested from.
    pub provider: String,
    /// Channel the job reports back to.
    pub channel_id: String,
    /// Optional thread the job reports back to.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Optional agent identity assigned to the job.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Opaque payload shaped by the surrounding application.
    pub payload: Value,
}

/// Persisted registry record for one job.
///
/// Owned exclusively by the registry; workers mutate through registry update
/// calls only, never through direct storage writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job specification as enqueued.
    pub job: JobSpec,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent update.
    pub updated_at: DateTime<Utc>,
    /// Branch names created per repository during execution.
    #[serde(default)]
    pub branch_by_repo: Option<BTreeMap<String, String>>,
    /// Pending soft-delete deadline; the sweep removes the record after it.
    #[serde(default)]
    pub delete_at: Option<DateTime<Utc>>,
    /// Human-readable completion summary.
    #[serde(default)]
    pub summary: Option<String>,
    /// Merge requests opened by the job.
    #[serde(default)]
    pub merge_requests: Option<Vec<MergeRequestRef>>,
    /// Failure message when the job ended in `failed`.
    #[serde(default)]
    pub error: Option<String>,
    /// Open questions the agent surfaced for the requester.
    #[serde(default)]
    pub open_questions: Option<Vec<String>>,
    /// On-disk working directory, removed together with the record.
    #[serde(default)]
    pub workdir: Option<String>,
}

impl JobRecord {
    /// Creates a freshly queued record for the given job.
    #[must_use]
    pub fn queued(job: JobSpec, workdir: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            job,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            branch_by_repo: None,
            delete_at: None,
            summary: None,
            merge_requests: None,
            error: None,
            open_questions: None,
            workdir,
        }
    }

    /// Merges a patch into the record and bumps `updated_at`.
    pub fn apply_patch(&mut self, patch: JobRecordPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(thread_id) = patch.thread_id {
            self.job.thread_id = Some(thread_id);
        }
        if let Some(agent_id) = patch.agent_id {
            self.job.agent_id = Some(agent_id);
        }
        if let Some(branch_by_repo) = patch.branch_by_repo {
            self.branch_by_repo = Some(branch_by_repo);
        }
        if let Some(delete_at) = patch.delete_at {
            self.delete_at = Some(delete_at);
        }
        if let Some(summary) = patch.summary {
            self.summary = Some(summary);
        }
        if let Some(merge_requests) = patch.merge_requests {
            self.merge_requests = Some(merge_requests);
        }
        if let Some(error) = patch.error {
            self.error = Some(error);
        }
        if let Some(open_questions) = patch.open_questions {
            self.open_questions = Some(open_questions);
        }
        if let Some(workdir) = patch.workdir {
            self.workdir = Some(workdir);
        }

        self.updated_at = now;
    }
}

/// Incremental update applied to a job record; unset fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecordPatch {
    /// New lifecycle state.
    #[serde(default)]
    pub status: Option<JobStatus>,
    /// Thread the job attached itself to during execution.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Agent identity assigned during execution.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Branch names created per repository.
    #[serde(default)]
    pub branch_by_repo: Option<BTreeMap<String, String>>,
    /// Soft-delete deadline.
    #[serde(default)]
    pub delete_at: Option<DateTime<Utc>>,
    /// Completion summary.
    #[serde(default)]
    pub summary: Option<String>,
    /// Merge requests opened by the job.
    #[serde(default)]
    pub merge_requests: Option<Vec<MergeRequestRef>>,
    /// Failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// Open questions surfaced by the agent.
    #[serde(default)]
    pub open_questions: Option<Vec<String>>,
    /// Working directory assigned during execution.
    #[serde(default)]
    pub workdir: Option<String>,
}

impl JobRecordPatch {
    /// Creates a patch that only changes the lifecycle state.
    #[must_use]
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{JobRecord, JobRecordPatch, JobSpec, JobStatus};

    fn spec(job_id: &str) -> JobSpec {
        JobSpec {
            job_id: job_id.to_owned(),
            job_type: "coding_task".to_owned(),
            provider: "slack".to_owned(),
            channel_id: "C1".to_owned(),
            thread_id: None,
            agent_id: None,
            payload: json!({"prompt": "fix the flaky test"}),
        }
    }

    #[test]
    fn queued_record_starts_with_matching_timestamps() {
        let now = Utc::now();
        let record = JobRecord::queued(spec("j-1"), None, now);

        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.created_at, record.updated_at);
        assert!(record.delete_at.is_none());
    }

    #[test]
    fn patch_merges_fields_and_bumps_updated_at() {
        let now = Utc::now();
        let mut record = JobRecord::queued(spec("j-1"), None, now);
        let later = now + Duration::seconds(5);

        let patch = JobRecordPatch {
            status: Some(JobStatus::Running),
            agent_id: Some("agent-7".to_owned()),
            summary: Some("started".to_owned()),
            ..JobRecordPatch::default()
        };
        record.apply_patch(patch, later);

        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.job.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(record.summary.as_deref(), Some("started"));
        assert_eq!(record.updated_at, later);
        assert_eq!(record.created_at, now);
    }

    #[test]
    fn empty_patch_only_bumps_updated_at() {
        let now = Utc::now();
        let mut record = JobRecord::queued(spec("j-1"), Some("/work/j-1".to_owned()), now);
        let later = now + Duration::seconds(1);

        record.apply_patch(JobRecordPatch::default(), later);

        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.workdir.as_deref(), Some("/work/j-1"));
        assert_eq!(record.updated_at, later);
    }
}
