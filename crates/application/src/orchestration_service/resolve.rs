use chrono::Utc;
use taskgate_core::AppResult;
use taskgate_domain::{Actor, ApprovalRequest, ApprovalResolution};
use tracing::warn;

use crate::approval_store::ApprovalTransition;

use super::authorize::candidate_group_ids;
use super::{ApprovalInteractionOutcome, OrchestrationService, ResolveApprovalInput};

impl OrchestrationService {
    /// Runs the end-to-end approval resolution flow.
    ///
    /// Guarantees: an already-resolved request is an idempotent no-op and is
    /// never re-executed; a resolver from an unrelated channel is rejected;
    /// a requester can never approve their own request; the deferred
    /// operation runs only after the store reports a changed approved
    /// transition.
    ///
    /// Cancellation is authorized against the request itself rather than a
    /// policy lookup: the original requester may always cancel, and anyone
    /// else must match the request's approver subjects, the same check that
    /// gates grant and deny. There is no separate cancel action in the
    /// policy model.
    pub async fn resolve_approval_interaction(
        &self,
        input: ResolveApprovalInput,
    ) -> AppResult<ApprovalInteractionOutcome> {
        let Some(request) = self.approvals.load(input.approval_id.as_str()).await? else {
            return Ok(ApprovalInteractionOutcome::NotFound);
        };

        if !request.is_pending() {
            return Ok(ApprovalInteractionOutcome::AlreadyResolved { request });
        }

        if let Some(reason) = context_mismatch(&request, &input) {
            return Ok(ApprovalInteractionOutcome::Forbidden { reason });
        }

        let now = Utc::now();
        if request.is_expired_at(now) {
            // Past due: the store transitions to expired regardless of the
            // requested resolution.
            return match self
                .approvals
                .resolve_if_pending(
                    input.approval_id.as_str(),
                    input.resolution,
                    Some(input.resolver_user_id),
                    now,
                )
                .await?
            {
                ApprovalTransition::NotFound => Ok(ApprovalInteractionOutcome::NotFound),
                ApprovalTransition::NotPending { request } => {
                    Ok(ApprovalInteractionOutcome::AlreadyResolved { request })
                }
                ApprovalTransition::Expired { request }
                | ApprovalTransition::Updated { request } => {
                    Ok(ApprovalInteractionOutcome::Expired { request })
                }
            };
        }

        match input.resolution {
            ApprovalResolution::Cancelled => {
                if input.resolver_user_id != request.requested_by
                    && !self
                        .resolver_is_approver(&request, input.resolver_user_id.as_str())
                        .await
                {
                    return Ok(ApprovalInteractionOutcome::Forbidden {
                        reason: format!(
                            "user '{}' may not cancel an approval requested by '{}'",
                            input.resolver_user_id, request.requested_by
                        ),
                    });
                }
            }
            ApprovalResolution::Approved => {
                if input.resolver_user_id == request.requested_by {
                    return Ok(ApprovalInteractionOutcome::Forbidden {
                        reason: format!(
                            "user '{}' may not approve their own request",
                            input.resolver_user_id
                        ),
                    });
                }
                if !self
                    .resolver_is_approver(&request, input.resolver_user_id.as_str())
                    .await
                {
                    return Ok(ApprovalInteractionOutcome::Forbidden {
                        reason: format!(
                            "user '{}' is not an authorized approver",
                            input.resolver_user_id
                        ),
                    });
                }
            }
            ApprovalResolution::Denied => {
                if !self
                    .resolver_is_approver(&request, input.resolver_user_id.as_str())
                    .await
                {
                    return Ok(ApprovalInteractionOutcome::Forbidden {
                        reason: format!(
                            "user '{}' is not an authorized approver",
                            input.resolver_user_id
                        ),
                    });
                }
            }
        }

        match self
            .approvals
            .resolve_if_pending(
                input.approval_id.as_str(),
                input.resolution,
                Some(input.resolver_user_id),
                now,
            )
            .await?
        {
            ApprovalTransition::NotFound => Ok(ApprovalInteractionOutcome::NotFound),
            ApprovalTransition::NotPending { request } => {
                Ok(ApprovalInteractionOutcome::AlreadyResolved { request })
            }
            ApprovalTransition::Expired { request } => {
                Ok(ApprovalInteractionOutcome::Expired { request })
            }
            ApprovalTransition::Updated { request } => {
                let execution = if input.resolution == ApprovalResolution::Approved {
                    Some(self.execute_deferred(&request.operation).await)
                } else {
                    None
                };

                Ok(ApprovalInteractionOutcome::Resolved { request, execution })
            }
        }
    }

    async fn resolver_is_approver(&self, request: &ApprovalRequest, resolver_user_id: &str) -> bool {
        let candidates = candidate_group_ids(
            request.approver_subjects.iter(),
            request.provider.as_str(),
        );

        let group_ids = match self
            .resolve_memberships(request.provider.as_str(), resolver_user_id, candidates)
            .await
        {
            Ok(group_ids) => group_ids,
            Err(error) => {
                warn!(
                    approval_id = %request.id,
                    resolver_user_id = %resolver_user_id,
                    error = %error,
                    "group resolution failed during approval resolution; denying"
                );
                return false;
            }
        };

        let actor = Actor {
            user_id: resolver_user_id.to_owned(),
            provider: request.provider.clone(),
            group_ids,
        };

        request
            .approver_subjects
            .iter()
            .any(|subject| actor.matches_subject(subject))
    }
}

fn context_mismatch(request: &ApprovalRequest, input: &ResolveApprovalInput) -> Option<String> {
    if request.context.provider != input.context.provider
        || request.context.channel_id != input.context.channel_id
    {
        return Some(format!(
            "approval '{}' belongs to {}/{}, not {}/{}",
            request.id,
            request.context.provider,
            request.context.channel_id,
            input.context.provider,
            input.context.channel_id
        ));
    }

    if request.context.thread_id.is_some()
        && request.context.thread_id != input.context.thread_id
    {
        return Some(format!(
            "approval '{}' belongs to a different thread",
            request.id
        ));
    }

    None
}
