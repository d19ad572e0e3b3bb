use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use taskgate_core::{AppError, AppResult};
use taskgate_domain::{
    ApprovalResolution, ApprovalStatus, ChannelContext, DeferredOperation, NewApprovalRequest,
    PermissionEffect, PermissionRule, PolicyDefaults, Subject,
};

use crate::approval_store::ApprovalStore;
use crate::job_registry::JobRegistry;
use crate::ports::{
    GroupMembershipCache, GroupResolver, PublishOptions, QueueJob, QueueSubscription,
    QueueTransport, RecordStore, SubscribeOptions, WORKER_EVENTS_CHANNEL, WorkspaceCleaner,
};

use super::{
    ApprovalInteractionOutcome, AuthorizeInput, DeferredOperationInput, GateOutcome,
    OrchestrationService, PolicyConfig, ResolveApprovalInput,
};

#[derive(Default)]
struct FakeRecordStore {
    records: Mutex<HashMap<String, Value>>,
    fail_upserts: bool,
}

#[async_trait]
impl RecordStore for FakeRecordStore {
    async fn load_by_key(&self, key: &str) -> AppResult<Option<Value>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn upsert(&self, key: &str, record: Value) -> AppResult<()> {
        if self.fail_upserts {
            return Err(AppError::Internal("record store unavailable".to_owned()));
        }
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

#[derive(Default)]
struct FakeWorkspaceCleaner;

#[async_trait]
impl WorkspaceCleaner for FakeWorkspaceCleaner {
    async fn remove_workspace(&self, _path: &str) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeGroupResolver {
    memberships: HashMap<(String, String), BTreeSet<String>>,
    fail: bool,
}

#[async_trait]
impl GroupResolver for FakeGroupResolver {
    async fn resolve(
        &self,
        provider: &str,
        user_id: &str,
        candidate_group_ids: &[String],
    ) -> AppResult<BTreeSet<String>> {
        if self.fail {
            return Err(AppError::Internal("group directory unavailable".to_owned()));
        }

        let member_of = self
            .memberships
            .get(&(provider.to_owned(), user_id.to_owned()))
            .cloned()
            .unwrap_or_default();

        Ok(candidate_group_ids
            .iter()
            .filter(|candidate| member_of.contains(candidate.as_str()))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct FakeQueueTransport {
    published: Mutex<Vec<(String, QueueJob)>>,
    fail_publishes: bool,
}

#[async_trait]
impl QueueTransport for FakeQueueTransport {
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> AppResult<QueueJob> {
        if self.fail_publishes {
            return Err(AppError::Internal("broker unavailable".to_owned()));
        }

        let job = QueueJob {
            id: options.job_id.unwrap_or_else(|| "generated".to_owned()),
            name: name.to_owned(),
            payload,
        };
        self.published
            .lock()
            .await
            .push((channel.to_owned(), job.clone()));
        Ok(job)
    }

    async fn subscribe(
        &self,
        _channel: &str,
        _options: SubscribeOptions,
    ) -> AppResult<Box<dyn QueueSubscription>> {
        Err(AppError::Internal(
            "fake transport does not support subscriptions".to_owned(),
        ))
    }
}

struct TestBed {
    service: OrchestrationService,
    records: Arc<FakeRecordStore>,
    transport: Arc<FakeQueueTransport>,
}

fn context() -> ChannelContext {
    ChannelContext {
        provider: "slack".to_owned(),
        channel_id: "C1".to_owned(),
        thread_id: None,
        workspace_id: None,
        guild_id: None,
    }
}

fn clear_before_rule() -> PermissionRule {
    PermissionRule {
        id: "gate-clear".to_owned(),
        actions: Some(BTreeSet::from(["jobs.clearBefore".to_owned()])),
        effect: PermissionEffect::RequireApproval,
        subjects: vec![Subject::AnyUser],
        approver_subjects: vec![Subject::group("slack", "S1")],
        notify_subjects: Vec::new(),
        provider: None,
        channel_id: None,
    }
}

fn policy(rules: Vec<PermissionRule>) -> PolicyConfig {
    let Ok(policy) = PolicyConfig::validated(
        rules,
        PolicyDefaults {
            effect: PermissionEffect::Allow,
            approver_subjects: Vec::new(),
            notify_subjects: Vec::new(),
        },
        86_400,
    ) else {
        panic!("test policy must validate");
    };
    policy
}

fn test_bed(
    rules: Vec<PermissionRule>,
    memberships: HashMap<(String, String), BTreeSet<String>>,
) -> TestBed {
    test_bed_with(rules, memberships, false, false, false)
}

fn test_bed_with(
    rules: Vec<PermissionRule>,
    memberships: HashMap<(String, String), BTreeSet<String>>,
    resolver_fails: bool,
    job_store_fails: bool,
    publishes_fail: bool,
) -> TestBed {
    let records = Arc::new(FakeRecordStore::default());
    let job_records: Arc<dyn RecordStore> = if job_store_fails {
        Arc::new(FakeRecordStore {
            records: Mutex::new(HashMap::new()),
            fail_upserts: true,
        })
    } else {
        records.clone()
    };
    let transport = Arc::new(FakeQueueTransport {
        published: Mutex::new(Vec::new()),
        fail_publishes: publishes_fail,
    });

    let service = OrchestrationService::new(
        policy(rules),
        Arc::new(FakeGroupResolver {
            memberships,
            fail: resolver_fails,
        }),
        ApprovalStore::new(records.clone()),
        JobRegistry::new(job_records, Arc::new(FakeWorkspaceCleaner)),
        transport.clone(),
    );

    TestBed {
        service,
        records,
        transport,
    }
}

fn clear_before_input(user_id: &str) -> AuthorizeInput {
    AuthorizeInput {
        user_id: user_id.to_owned(),
        context: context(),
        action: "jobs.clearBefore".to_owned(),
    }
}

fn worker_event_operation() -> DeferredOperationInput {
    DeferredOperationInput {
        operation: DeferredOperation::EnqueueWorkerEvent {
            event: json!({"type": "clear_before", "before": "2026-08-01T00:00:00Z"}),
        },
        summary: "Clear thread history".to_owned(),
    }
}

async fn gate_pending_request(bed: &TestBed, user_id: &str) -> taskgate_domain::ApprovalRequest {
    let outcome = bed
        .service
        .authorize_or_create_approval(clear_before_input(user_id), worker_event_operation())
        .await;

    let Ok(GateOutcome::ApprovalRequired { request, .. }) = outcome else {
        panic!("gating must create an approval request");
    };
    request
}

#[tokio::test]
async fn authorize_allows_when_a_matching_allow_rule_exists() {
    let rule = PermissionRule {
        id: "allow-dispatch".to_owned(),
        actions: Some(BTreeSet::from(["jobs.dispatch".to_owned()])),
        effect: PermissionEffect::Allow,
        subjects: vec![Subject::user("u1")],
        approver_subjects: Vec::new(),
        notify_subjects: Vec::new(),
        provider: None,
        channel_id: None,
    };
    let bed = test_bed(vec![rule], HashMap::new());

    let authorization = bed
        .service
        .authorize(&AuthorizeInput {
            user_id: "u1".to_owned(),
            context: context(),
            action: "jobs.dispatch".to_owned(),
        })
        .await;

    assert!(authorization.allowed);
    assert!(!authorization.requires_approval);
    assert_eq!(authorization.decision.rule_id.as_deref(), Some("allow-dispatch"));
}

#[tokio::test]
async fn group_resolution_failure_fails_closed() {
    let rule = PermissionRule {
        id: "allow-group".to_owned(),
        actions: None,
        effect: PermissionEffect::Allow,
        subjects: vec![Subject::group("slack", "S1")],
        approver_subjects: Vec::new(),
        notify_subjects: Vec::new(),
        provider: None,
        channel_id: None,
    };
    let bed = test_bed_with(vec![rule], HashMap::new(), true, false, false);

    let authorization = bed
        .service
        .authorize(&clear_before_input("u1"))
        .await;

    assert!(!authorization.allowed);
    assert!(!authorization.requires_approval);
    assert_eq!(authorization.decision.effect, PermissionEffect::Deny);
}

#[tokio::test]
async fn gating_persists_a_pending_request_with_the_configured_ttl() {
    let bed = test_bed(vec![clear_before_rule()], HashMap::new());

    let request = gate_pending_request(&bed, "u1").await;

    assert_eq!(request.status, ApprovalStatus::Pending);
    assert_eq!(request.requested_by, "u1");
    assert_eq!(request.rule_id.as_deref(), Some("gate-clear"));
    assert_eq!(
        request.expires_at - request.created_at,
        Duration::seconds(86_400)
    );

    let loaded = ApprovalStore::new(bed.records.clone())
        .load(request.id.as_str())
        .await;
    assert!(loaded.is_ok_and(|loaded| loaded == Some(request)));
}

#[tokio::test]
async fn requester_may_never_approve_their_own_request() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u1".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    let bed = test_bed(vec![clear_before_rule()], memberships);
    let request = gate_pending_request(&bed, "u1").await;

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id.clone(),
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u1".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Forbidden { .. }) = outcome else {
        panic!("self-approval must be forbidden");
    };

    // The request is untouched and still pending.
    let loaded = ApprovalStore::new(bed.records.clone())
        .load(request.id.as_str())
        .await;
    assert!(loaded.is_ok_and(|loaded| {
        loaded.is_some_and(|loaded| loaded.status == ApprovalStatus::Pending)
    }));
    assert!(bed.transport.published.lock().await.is_empty());
}

#[tokio::test]
async fn resolution_from_an_unrelated_channel_is_forbidden() {
    let bed = test_bed(vec![clear_before_rule()], HashMap::new());
    let request = gate_pending_request(&bed, "u1").await;

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: ChannelContext {
                provider: "slack".to_owned(),
                channel_id: "C-other".to_owned(),
                thread_id: None,
                workspace_id: None,
                guild_id: None,
            },
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Forbidden { .. }) = outcome else {
        panic!("cross-channel resolution must be forbidden");
    };
}

#[tokio::test]
async fn approver_group_member_grant_publishes_the_event_exactly_once() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u2".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    let bed = test_bed(vec![clear_before_rule()], memberships);
    let request = gate_pending_request(&bed, "u1").await;

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id.clone(),
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Resolved { request, execution }) = outcome else {
        panic!("an authorized grant must resolve the request");
    };
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(request.resolved_by.as_deref(), Some("u2"));
    assert!(execution.is_some_and(|execution| execution.executed));

    let published = bed.transport.published.lock().await;
    assert_eq!(published.len(), 1);
    let (channel, job) = &published[0];
    assert_eq!(channel, WORKER_EVENTS_CHANNEL);
    assert_eq!(
        job.payload,
        json!({"type": "clear_before", "before": "2026-08-01T00:00:00Z"})
    );
}

#[tokio::test]
async fn cached_memberships_from_an_earlier_authorize_do_not_block_an_approver() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u2".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    // A second rule whose subjects name a group u2 does not belong to, so
    // u2's authorize call resolves a candidate list without S1 in it.
    let unrelated_rule = PermissionRule {
        id: "allow-dispatch-ops".to_owned(),
        actions: Some(BTreeSet::from(["jobs.dispatch".to_owned()])),
        effect: PermissionEffect::Allow,
        subjects: vec![Subject::group("slack", "ops")],
        approver_subjects: Vec::new(),
        notify_subjects: Vec::new(),
        provider: None,
        channel_id: None,
    };
    let mut bed = test_bed(vec![clear_before_rule(), unrelated_rule], memberships);
    bed.service = bed.service.with_membership_cache(Arc::new(GroupMembershipCache::new(
        std::time::Duration::from_secs(60),
    )));

    let request = gate_pending_request(&bed, "u1").await;

    // u2 authorizes an unrelated action first, warming the cache for the
    // rule-subject candidate list.
    let authorization = bed
        .service
        .authorize(&AuthorizeInput {
            user_id: "u2".to_owned(),
            context: context(),
            action: "jobs.dispatch".to_owned(),
        })
        .await;
    assert!(authorization.decision.rule_id.is_none());

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Resolved { request, .. }) = outcome else {
        panic!("the grant must succeed despite the earlier cached lookup");
    };
    assert_eq!(request.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn duplicate_grant_is_idempotent_and_never_reexecutes() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u2".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    let bed = test_bed(vec![clear_before_rule()], memberships);
    let request = gate_pending_request(&bed, "u1").await;

    let first = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id.clone(),
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;
    assert!(matches!(
        first,
        Ok(ApprovalInteractionOutcome::Resolved { .. })
    ));

    let second = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::AlreadyResolved { request }) = second else {
        panic!("a duplicate grant must be a no-op");
    };
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(bed.transport.published.lock().await.len(), 1);
}

#[tokio::test]
async fn past_due_request_expires_instead_of_resolving() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u2".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    let bed = test_bed(vec![clear_before_rule()], memberships);

    // Seed an already-lapsed pending request through the shared store.
    let store = ApprovalStore::new(bed.records.clone());
    let created = store
        .create(
            NewApprovalRequest {
                action: "jobs.clearBefore".to_owned(),
                context: context(),
                requested_by: "u1".to_owned(),
                approver_subjects: vec![Subject::group("slack", "S1")],
                notify_subjects: Vec::new(),
                operation: worker_event_operation().operation,
                summary: "Clear thread history".to_owned(),
                rule_id: Some("gate-clear".to_owned()),
            },
            60,
            Utc::now() - Duration::seconds(120),
        )
        .await;
    let Ok(created) = created else {
        panic!("seeding the lapsed request must succeed");
    };

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: created.id,
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Expired { request }) = outcome else {
        panic!("a lapsed request must expire");
    };
    assert_eq!(request.status, ApprovalStatus::Expired);
    assert!(bed.transport.published.lock().await.is_empty());
}

#[tokio::test]
async fn job_persist_failure_publishes_nothing() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u2".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    let bed = test_bed_with(vec![clear_before_rule()], memberships, false, true, false);

    let outcome = bed
        .service
        .authorize_or_create_approval(
            clear_before_input("u1"),
            DeferredOperationInput {
                operation: DeferredOperation::EnqueueJob {
                    job: taskgate_domain::JobSpec {
                        job_id: "j-1".to_owned(),
                        job_type: "coding_task".to_owned(),
                        provider: "slack".to_owned(),
                        channel_id: "C1".to_owned(),
                        thread_id: None,
                        agent_id: None,
                        payload: json!({}),
                    },
                },
                summary: "Run coding task".to_owned(),
            },
        )
        .await;
    let Ok(GateOutcome::ApprovalRequired { request, .. }) = outcome else {
        panic!("gating must create an approval request");
    };

    let resolved = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Resolved { request, execution }) = resolved else {
        panic!("the grant itself must succeed");
    };
    assert_eq!(request.status, ApprovalStatus::Approved);
    let Some(execution) = execution else {
        panic!("an approved job operation must report an execution");
    };
    assert!(!execution.executed);
    assert!(bed.transport.published.lock().await.is_empty());
}

#[tokio::test]
async fn publish_failure_after_persist_reports_not_executed() {
    let memberships = HashMap::from([(
        ("slack".to_owned(), "u2".to_owned()),
        BTreeSet::from(["S1".to_owned()]),
    )]);
    let bed = test_bed_with(vec![clear_before_rule()], memberships, false, false, true);

    let outcome = bed
        .service
        .authorize_or_create_approval(
            clear_before_input("u1"),
            DeferredOperationInput {
                operation: DeferredOperation::EnqueueJob {
                    job: taskgate_domain::JobSpec {
                        job_id: "j-1".to_owned(),
                        job_type: "coding_task".to_owned(),
                        provider: "slack".to_owned(),
                        channel_id: "C1".to_owned(),
                        thread_id: None,
                        agent_id: None,
                        payload: json!({}),
                    },
                },
                summary: "Run coding task".to_owned(),
            },
        )
        .await;
    let Ok(GateOutcome::ApprovalRequired { request, .. }) = outcome else {
        panic!("gating must create an approval request");
    };

    let resolved = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Resolved { execution, .. }) = resolved else {
        panic!("the grant itself must succeed");
    };
    assert!(execution.is_some_and(|execution| !execution.executed));

    // The record was persisted exactly once before the failing publish.
    let registry = JobRegistry::new(bed.records.clone(), Arc::new(FakeWorkspaceCleaner));
    let record = registry.load("j-1").await;
    assert!(record.is_ok_and(|record| record.is_some()));
}

#[tokio::test]
async fn requester_cancel_needs_no_extra_authorization() {
    let bed = test_bed(vec![clear_before_rule()], HashMap::new());
    let request = gate_pending_request(&bed, "u1").await;

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Cancelled,
            resolver_user_id: "u1".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Resolved { request, execution }) = outcome else {
        panic!("the requester must be able to cancel");
    };
    assert_eq!(request.status, ApprovalStatus::Cancelled);
    assert!(execution.is_none());
    assert!(bed.transport.published.lock().await.is_empty());
}

#[tokio::test]
async fn foreign_cancel_requires_approver_rights() {
    let bed = test_bed(vec![clear_before_rule()], HashMap::new());
    let request = gate_pending_request(&bed, "u1").await;

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: request.id,
            resolution: ApprovalResolution::Cancelled,
            resolver_user_id: "u3".to_owned(),
            context: context(),
        })
        .await;

    let Ok(ApprovalInteractionOutcome::Forbidden { .. }) = outcome else {
        panic!("a bystander cancel must be forbidden");
    };
}

#[tokio::test]
async fn resolving_an_unknown_id_reports_not_found() {
    let bed = test_bed(vec![clear_before_rule()], HashMap::new());

    let outcome = bed
        .service
        .resolve_approval_interaction(ResolveApprovalInput {
            approval_id: "missing".to_owned(),
            resolution: ApprovalResolution::Approved,
            resolver_user_id: "u2".to_owned(),
            context: context(),
        })
        .await;

    assert!(matches!(outcome, Ok(ApprovalInteractionOutcome::NotFound)));
}
