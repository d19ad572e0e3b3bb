use std::collections::BTreeSet;

use chrono::Utc;
use taskgate_domain::{
    Actor, NewApprovalRequest, PermissionDecision, PermissionEffect, Subject, evaluate,
};
use tracing::warn;

use super::{
    AuthorizeInput, Authorization, DeferredOperationInput, GateOutcome, OrchestrationService,
};

impl OrchestrationService {
    /// Evaluates policy for one action after resolving group memberships.
    ///
    /// Group resolution failures fail closed: the action is denied, never
    /// allowed by default.
    pub async fn authorize(&self, input: &AuthorizeInput) -> Authorization {
        let candidates = candidate_group_ids(
            self.policy
                .rules
                .iter()
                .flat_map(|rule| rule.subjects.iter()),
            input.context.provider.as_str(),
        );

        let group_ids = match self
            .resolve_memberships(
                input.context.provider.as_str(),
                input.user_id.as_str(),
                candidates,
            )
            .await
        {
            Ok(group_ids) => group_ids,
            Err(error) => {
                warn!(
                    user_id = %input.user_id,
                    provider = %input.context.provider,
                    action = %input.action,
                    error = %error,
                    "group resolution failed; denying action"
                );
                return Authorization {
                    decision: fail_closed_decision(),
                    allowed: false,
                    requires_approval: false,
                };
            }
        };

        let actor = Actor {
            user_id: input.user_id.clone(),
            provider: input.context.provider.clone(),
            group_ids,
        };
        let decision = evaluate(
            self.policy.rules.as_slice(),
            &self.policy.defaults,
            &actor,
            &input.context,
            input.action.as_str(),
        );

        Authorization {
            allowed: decision.effect == PermissionEffect::Allow,
            requires_approval: decision.effect == PermissionEffect::RequireApproval,
            decision,
        }
    }

    /// Gates one action: allow, deny, or persist a pending approval request
    /// carrying the deferred operation.
    pub async fn authorize_or_create_approval(
        &self,
        input: AuthorizeInput,
        operation: DeferredOperationInput,
    ) -> taskgate_core::AppResult<GateOutcome> {
        let authorization = self.authorize(&input).await;

        match authorization.decision.effect {
            PermissionEffect::Allow => Ok(GateOutcome::Allowed {
                decision: authorization.decision,
            }),
            PermissionEffect::Deny => Ok(GateOutcome::Denied {
                decision: authorization.decision,
            }),
            PermissionEffect::RequireApproval => {
                let request = self
                    .approvals
                    .create(
                        NewApprovalRequest {
                            action: input.action,
                            context: input.context,
                            requested_by: input.user_id,
                            approver_subjects: authorization.decision.approver_subjects.clone(),
                            notify_subjects: authorization.decision.notify_subjects.clone(),
                            operation: operation.operation,
                            summary: operation.summary,
                            rule_id: authorization.decision.rule_id.clone(),
                        },
                        self.policy.approval_ttl_seconds,
                        Utc::now(),
                    )
                    .await?;

                Ok(GateOutcome::ApprovalRequired {
                    decision: authorization.decision,
                    request,
                })
            }
        }
    }

    pub(super) async fn resolve_memberships(
        &self,
        provider: &str,
        user_id: &str,
        candidates: Vec<String>,
    ) -> taskgate_core::AppResult<BTreeSet<String>> {
        if candidates.is_empty() {
            return Ok(BTreeSet::new());
        }

        if let Some(cache) = &self.membership_cache
            && let Some(cached) = cache.get(provider, user_id, candidates.as_slice()).await
        {
            return Ok(cached);
        }

        let resolved = self
            .group_resolver
            .resolve(provider, user_id, candidates.as_slice())
            .await?;

        if let Some(cache) = &self.membership_cache {
            cache
                .put(provider, user_id, candidates.as_slice(), resolved.clone())
                .await;
        }

        Ok(resolved)
    }
}

/// Collects provider-scoped candidate group ids from a set of subjects.
pub(super) fn candidate_group_ids<'a>(
    subjects: impl Iterator<Item = &'a Subject>,
    provider: &str,
) -> Vec<String> {
    let unique: BTreeSet<String> = subjects
        .filter_map(|subject| match subject {
            Subject::Group {
                provider: subject_provider,
                group_id,
            } if subject_provider == provider => Some(group_id.clone()),
            _ => None,
        })
        .collect();

    unique.into_iter().collect()
}

pub(super) fn fail_closed_decision() -> PermissionDecision {
    PermissionDecision {
        effect: PermissionEffect::Deny,
        rule_id: None,
        approver_subjects: Vec::new(),
        notify_subjects: Vec::new(),
    }
}
