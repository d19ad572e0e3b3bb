use std::sync::Arc;

use taskgate_core::AppResult;
use taskgate_domain::{
    ApprovalRequest, ApprovalResolution, ChannelContext, PermissionDecision, PermissionRule,
    PolicyDefaults, validate_policy,
};

use crate::approval_store::ApprovalStore;
use crate::job_registry::JobRegistry;
use crate::ports::{GroupMembershipCache, GroupResolver, QueueTransport};

mod authorize;
mod execute;
mod message;
mod resolve;

pub use message::build_approval_message;

/// Validated policy configuration handed to the orchestration service.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Rules evaluated in declaration order.
    pub rules: Vec<PermissionRule>,
    /// Fallback applied when no rule matches.
    pub defaults: PolicyDefaults,
    /// Lifetime of created approval requests in seconds.
    pub approval_ttl_seconds: u32,
}

impl PolicyConfig {
    /// Validates the configuration at load time.
    ///
    /// A require_approval rule or default without approver subjects is a
    /// configuration error here, never at decision time.
    pub fn validated(
        rules: Vec<PermissionRule>,
        defaults: PolicyDefaults,
        approval_ttl_seconds: u32,
    ) -> AppResult<Self> {
        validate_policy(rules.as_slice(), &defaults)?;

        if approval_ttl_seconds == 0 {
            return Err(taskgate_core::AppError::Validation(
                "approval_ttl_seconds must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            rules,
            defaults,
            approval_ttl_seconds,
        })
    }
}

/// Input for one authorization check.
#[derive(Debug, Clone)]
pub struct AuthorizeInput {
    /// Acting user identifier.
    pub user_id: String,
    /// Channel identity the action originates from.
    pub context: ChannelContext,
    /// Action name being attempted.
    pub action: String,
}

/// Outcome of one authorization check.
#[derive(Debug, Clone)]
pub struct Authorization {
    /// The policy decision, including matched rule and approver subjects.
    pub decision: PermissionDecision,
    /// Whether the action may proceed immediately.
    pub allowed: bool,
    /// Whether the action must go through an approval request.
    pub requires_approval: bool,
}

/// Outcome of gating one action behind policy.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// The action proceeds immediately.
    Allowed {
        /// The underlying policy decision.
        decision: PermissionDecision,
    },
    /// The action is rejected.
    Denied {
        /// The underlying policy decision.
        decision: PermissionDecision,
    },
    /// A pending approval request was persisted for the action.
    ApprovalRequired {
        /// The underlying policy decision.
        decision: PermissionDecision,
        /// The persisted pending request carrying the deferred operation.
        request: ApprovalRequest,
    },
}

/// The deferred operation and its approver-facing summary.
#[derive(Debug, Clone)]
pub struct DeferredOperationInput {
    /// Side effect to withhold until approval.
    pub operation: taskgate_domain::DeferredOperation,
    /// Human-readable description shown to approvers.
    pub summary: String,
}

/// Input for one approval resolution interaction.
#[derive(Debug, Clone)]
pub struct ResolveApprovalInput {
    /// Approval request identifier.
    pub approval_id: String,
    /// Terminal state the resolver asks for.
    pub resolution: ApprovalResolution,
    /// User attempting the resolution.
    pub resolver_user_id: String,
    /// Channel identity the resolution arrives from.
    pub context: ChannelContext,
}

/// Result of executing a deferred operation after approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredExecution {
    /// Whether the operation completed end to end.
    pub executed: bool,
    /// Failure description when `executed` is false.
    pub error: Option<String>,
}

/// Outcome of one end-to-end approval resolution interaction.
#[derive(Debug, Clone)]
pub enum ApprovalInteractionOutcome {
    /// No request exists under the given id.
    NotFound,
    /// The request already reached a terminal state; nothing re-executes.
    AlreadyResolved {
        /// The unchanged request.
        request: ApprovalRequest,
    },
    /// The resolver is not allowed to resolve this request.
    Forbidden {
        /// Human-readable rejection reason.
        reason: String,
    },
    /// The request lapsed and was transitioned to expired.
    Expired {
        /// The request in its expired state.
        request: ApprovalRequest,
    },
    /// The request reached the asked-for terminal state.
    Resolved {
        /// The request in its terminal state.
        request: ApprovalRequest,
        /// Execution report, present only for approved requests.
        execution: Option<DeferredExecution>,
    },
}

/// Composes policy evaluation, approval persistence, the job registry, and
/// the queue transport into the gated execution flow.
#[derive(Clone)]
pub struct OrchestrationService {
    policy: PolicyConfig,
    group_resolver: Arc<dyn GroupResolver>,
    membership_cache: Option<Arc<GroupMembershipCache>>,
    approvals: ApprovalStore,
    jobs: JobRegistry,
    transport: Arc<dyn QueueTransport>,
}

impl OrchestrationService {
    /// Creates an orchestration service.
    #[must_use]
    pub fn new(
        policy: PolicyConfig,
        group_resolver: Arc<dyn GroupResolver>,
        approvals: ApprovalStore,
        jobs: JobRegistry,
        transport: Arc<dyn QueueTransport>,
    ) -> Self {
        Self {
            policy,
            group_resolver,
            membership_cache: None,
            approvals,
            jobs,
            transport,
        }
    }

    /// Adds an injected TTL-bounded group membership cache.
    #[must_use]
    pub fn with_membership_cache(mut self, cache: Arc<GroupMembershipCache>) -> Self {
        self.membership_cache = Some(cache);
        self
    }
}

#[cfg(test)]
mod tests;
