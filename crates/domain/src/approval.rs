use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobSpec;
use crate::policy::ChannelContext;
use crate::subject::Subject;

/// Lifecycle state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for an approver decision.
    Pending,
    /// Granted; the deferred operation was released for execution.
    Approved,
    /// Rejected by an approver.
    Denied,
    /// Withdrawn by the requester or an approver.
    Cancelled,
    /// Lapsed past its expiry before resolution.
    Expired,
}

impl ApprovalStatus {
    /// Returns a stable storage value for this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

/// Terminal state a resolver asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalResolution {
    /// Grant the request and release the deferred operation.
    Approved,
    /// Reject the request.
    Denied,
    /// Withdraw the request.
    Cancelled,
}

impl ApprovalResolution {
    /// Returns the terminal status this resolution produces.
    #[must_use]
    pub fn status(&self) -> ApprovalStatus {
        match self {
            Self::Approved => ApprovalStatus::Approved,
            Self::Denied => ApprovalStatus::Denied,
            Self::Cancelled => ApprovalStatus::Cancelled,
        }
    }
}

/// The side effect withheld pending approval, executed exactly once on grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredOperation {
    /// Persist a job record and publish it onto the jobs channel.
    EnqueueJob {
        /// Job specification to persist and publish.
        job: JobSpec,
    },
    /// Publish a bootstrap request onto the bootstrap channel.
    EnqueueBootstrap {
        /// Bootstrap request payload, shaped by the surrounding application.
        request: Value,
    },
    /// Publish an event onto the worker events channel.
    EnqueueWorkerEvent {
        /// Worker event payload, shaped by the surrounding application.
        event: Value,
    },
}

impl DeferredOperation {
    /// Returns a stable kind value for logging and summaries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EnqueueJob { .. } => "enqueue_job",
            Self::EnqueueBootstrap { .. } => "enqueue_bootstrap",
            Self::EnqueueWorkerEvent { .. } => "enqueue_worker_event",
        }
    }
}

/// Input for a new pending approval request.
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    /// Action the requester attempted.
    pub action: String,
    /// Channel identity the request originated from.
    pub context: ChannelContext,
    /// User that triggered the gated action.
    pub requested_by: String,
    /// Subjects allowed to resolve the request.
    pub approver_subjects: Vec<Subject>,
    /// Subjects to notify about the request.
    pub notify_subjects: Vec<Subject>,
    /// Side effect released on grant.
    pub operation: DeferredOperation,
    /// Human-readable description shown to approvers.
    pub summary: String,
    /// Rule that produced the require_approval decision, when one matched.
    pub rule_id: Option<String>,
}

/// A persisted approval request and its resolution state.
///
/// Once the status leaves pending the record is immutable; the store enforces
/// single-writer-wins on the pending → resolved transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Opaque unique token identifying the request.
    pub id: String,
    /// Current lifecycle state.
    pub status: ApprovalStatus,
    /// Action the requester attempted.
    pub action: String,
    /// Chat provider the request originated from.
    pub provider: String,
    /// Channel identity the request originated from.
    pub context: ChannelContext,
    /// User that triggered the gated action.
    pub requested_by: String,
    /// Subjects allowed to resolve the request.
    pub approver_subjects: Vec<Subject>,
    /// Subjects to notify about the request.
    pub notify_subjects: Vec<Subject>,
    /// Side effect released on grant.
    pub operation: DeferredOperation,
    /// Human-readable description shown to approvers.
    pub summary: String,
    /// Rule that produced the require_approval decision, when one matched.
    pub rule_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp; always after `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Terminal status, mirrored from `status` once resolved.
    pub resolution: Option<ApprovalStatus>,
    /// Resolution timestamp, set exactly when the status leaves pending.
    pub resolved_at: Option<DateTime<Utc>>,
    /// User that resolved the request, absent for expiry transitions.
    pub resolved_by: Option<String>,
}

impl ApprovalRequest {
    /// Creates a pending request from its input, id, and clock values.
    #[must_use]
    pub fn pending(
        id: String,
        input: NewApprovalRequest,
        ttl_seconds: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: ApprovalStatus::Pending,
            action: input.action,
            provider: input.context.provider.clone(),
            context: input.context,
            requested_by: input.requested_by,
            approver_subjects: input.approver_subjects,
            notify_subjects: input.notify_subjects,
            operation: input.operation,
            summary: input.summary,
            rule_id: input.rule_id,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(i64::from(ttl_seconds)),
            resolution: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// Returns whether the request is still awaiting resolution.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Returns whether the request lapsed at or before the given instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns a copy transitioned to the given terminal status.
    #[must_use]
    pub fn into_resolved(
        mut self,
        status: ApprovalStatus,
        resolved_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        self.status = status;
        self.resolution = Some(status);
        self.resolved_at = Some(now);
        self.resolved_by = resolved_by;
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::policy::ChannelContext;
    use crate::subject::Subject;

    use super::{ApprovalRequest, ApprovalStatus, DeferredOperation, NewApprovalRequest};

    fn new_request() -> NewApprovalRequest {
        NewApprovalRequest {
            action: "jobs.clearBefore".to_owned(),
            context: ChannelContext {
                provider: "slack".to_owned(),
                channel_id: "C1".to_owned(),
                thread_id: Some("T1".to_owned()),
                workspace_id: None,
                guild_id: None,
            },
            requested_by: "u1".to_owned(),
            approver_subjects: vec![Subject::group("slack", "S1")],
            notify_subjects: Vec::new(),
            operation: DeferredOperation::EnqueueWorkerEvent {
                event: json!({"type": "clear_before"}),
            },
            summary: "Clear history before timestamp".to_owned(),
            rule_id: Some("gate-clear".to_owned()),
        }
    }

    #[test]
    fn pending_request_expires_after_creation() {
        let now = Utc::now();
        let request = ApprovalRequest::pending("a-1".to_owned(), new_request(), 86_400, now);

        assert!(request.is_pending());
        assert!(request.expires_at > request.created_at);
        assert_eq!(request.provider, "slack");
        assert!(request.resolution.is_none());
    }

    #[test]
    fn resolved_copy_mirrors_status_and_stamps() {
        let now = Utc::now();
        let request = ApprovalRequest::pending("a-1".to_owned(), new_request(), 60, now);
        let later = now + Duration::seconds(10);

        let resolved =
            request.into_resolved(ApprovalStatus::Denied, Some("u2".to_owned()), later);

        assert_eq!(resolved.status, ApprovalStatus::Denied);
        assert_eq!(resolved.resolution, Some(ApprovalStatus::Denied));
        assert_eq!(resolved.resolved_at, Some(later));
        assert_eq!(resolved.resolved_by.as_deref(), Some("u2"));
    }

    #[test]
    fn expiry_check_is_inclusive_at_the_boundary() {
        let now = Utc::now();
        let request = ApprovalRequest::pending("a-1".to_owned(), new_request(), 60, now);

        assert!(!request.is_expired_at(now));
        assert!(request.is_expired_at(now + Duration::seconds(60)));
    }
}
