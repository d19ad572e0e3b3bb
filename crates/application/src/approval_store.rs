use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskgate_core::{AppError, AppResult};
use taskgate_domain::{ApprovalRequest, ApprovalResolution, ApprovalStatus, NewApprovalRequest};
use uuid::Uuid;

use crate::ports::{RecordStore, approval_key};

/// Result of one `resolve_if_pending` attempt.
///
/// Exactly one of multiple concurrent resolvers observes a changed variant;
/// every other caller observes `NotPending` and must not re-execute any side
/// effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalTransition {
    /// No request exists under the given id.
    NotFound,
    /// The request already left pending; carries the unchanged record.
    NotPending {
        /// The current, unchanged request.
        request: ApprovalRequest,
    },
    /// The request lapsed before resolution and was transitioned to expired.
    Expired {
        /// The request in its new expired state.
        request: ApprovalRequest,
    },
    /// The request was transitioned to the requested resolution.
    Updated {
        /// The request in its new terminal state.
        request: ApprovalRequest,
    },
}

impl ApprovalTransition {
    /// Returns whether this attempt changed the persisted record.
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Self::Expired { .. } | Self::Updated { .. })
    }
}

/// Persists approval requests and performs atomic pending → resolved
/// transitions.
///
/// The store never executes deferred operations; that is the orchestration
/// service's job, taken only after observing an approved `Updated` outcome.
#[derive(Clone)]
pub struct ApprovalStore {
    records: Arc<dyn RecordStore>,
}

impl ApprovalStore {
    /// Creates a store over a record store implementation.
    #[must_use]
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Creates and persists a pending request with a fresh unique id.
    pub async fn create(
        &self,
        input: NewApprovalRequest,
        ttl_seconds: u32,
        now: DateTime<Utc>,
    ) -> AppResult<ApprovalRequest> {
        if ttl_seconds == 0 {
            return Err(AppError::Validation(
                "approval ttl_seconds must be greater than zero".to_owned(),
            ));
        }

        let request =
            ApprovalRequest::pending(Uuid::new_v4().to_string(), input, ttl_seconds, now);
        let record = encode_request(&request)?;
        self.records
            .upsert(approval_key(request.id.as_str()).as_str(), record)
            .await?;

        Ok(request)
    }

    /// Returns one request by id.
    pub async fn load(&self, approval_id: &str) -> AppResult<Option<ApprovalRequest>> {
        let record = self
            .records
            .load_by_key(approval_key(approval_id).as_str())
            .await?;

        record.map(|value| decode_request(approval_id, value)).transpose()
    }

    /// Atomically transitions one pending request to a terminal state.
    ///
    /// A request past its expiry transitions to expired instead of the
    /// requested resolution. The transition is guarded by a conditional write
    /// on the record store; losing the race reports `NotPending` with the
    /// winner's state.
    pub async fn resolve_if_pending(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
        resolved_by: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<ApprovalTransition> {
        let key = approval_key(approval_id);
        let Some(current) = self.records.load_by_key(key.as_str()).await? else {
            return Ok(ApprovalTransition::NotFound);
        };

        let request = decode_request(approval_id, current.clone())?;
        if !request.is_pending() {
            return Ok(ApprovalTransition::NotPending { request });
        }

        let expired = request.is_expired_at(now);
        let (status, resolved_by) = if expired {
            (ApprovalStatus::Expired, None)
        } else {
            (resolution.status(), resolved_by)
        };

        let resolved = request.into_resolved(status, resolved_by, now);
        let record = encode_request(&resolved)?;
        let swapped = self
            .records
            .compare_and_swap(key.as_str(), &current, record)
            .await?;

        if !swapped {
            // Lost the race; report the winner's state.
            let Some(latest) = self.records.load_by_key(key.as_str()).await? else {
                return Ok(ApprovalTransition::NotFound);
            };
            let latest = decode_request(approval_id, latest)?;
            if latest.is_pending() {
                return Err(AppError::Conflict(format!(
                    "approval request '{approval_id}' changed concurrently while pending"
                )));
            }
            return Ok(ApprovalTransition::NotPending { request: latest });
        }

        if expired {
            Ok(ApprovalTransition::Expired { request: resolved })
        } else {
            Ok(ApprovalTransition::Updated { request: resolved })
        }
    }
}

fn encode_request(request: &ApprovalRequest) -> AppResult<serde_json::Value> {
    serde_json::to_value(request).map_err(|error| {
        AppError::Internal(format!(
            "failed to serialize approval request '{}': {error}",
            request.id
        ))
    })
}

fn decode_request(approval_id: &str, value: serde_json::Value) -> AppResult<ApprovalRequest> {
    serde_json::from_value(value).map_err(|error| {
        AppError::Internal(format!(
            "failed to deserialize approval request '{approval_id}': {error}"
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use serde_json::{Value, json};
    use tokio::sync::Mutex;

    use taskgate_core::AppResult;
    use taskgate_domain::{
        ApprovalResolution, ApprovalStatus, ChannelContext, DeferredOperation, NewApprovalRequest,
        Subject,
    };

    use crate::ports::RecordStore;

    use super::{ApprovalStore, ApprovalTransition};

    #[derive(Default)]
    struct FakeRecordStore {
        records: Mutex<HashMap<String, Value>>,
    }

    #[async_trait]
    impl RecordStore for FakeRecordStore {
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

    fn new_request() -> NewApprovalRequest {
        NewApprovalRequest {
            action: "jobs.clearBefore".to_owned(),
            context: ChannelContext {
                provider: "slack".to_owned(),
                channel_id: "C1".to_owned(),
                thread_id: None,
                workspace_id: None,
                guild_id: None,
            },
            requested_by: "u1".to_owned(),
            approver_subjects: vec![Subject::group("slack", "S1")],
            notify_subjects: Vec::new(),
            operation: DeferredOperation::EnqueueWorkerEvent {
                event: json!({"type": "clear_before"}),
            },
            summary: "Clear history".to_owned(),
            rule_id: None,
        }
    }

    #[tokio::test]
    async fn create_persists_a_loadable_pending_request() {
        let store = ApprovalStore::new(Arc::new(FakeRecordStore::default()));
        let now = Utc::now();

        let created = store.create(new_request(), 3600, now).await;
        assert!(created.is_ok());
        let Ok(created) = created else {
            return;
        };

        let loaded = store.load(created.id.as_str()).await;
        assert!(loaded.is_ok_and(|loaded| loaded == Some(created)));
    }

    #[tokio::test]
    async fn create_rejects_zero_ttl() {
        let store = ApprovalStore::new(Arc::new(FakeRecordStore::default()));
        let result = store.create(new_request(), 0, Utc::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resolve_missing_request_reports_not_found() {
        let store = ApprovalStore::new(Arc::new(FakeRecordStore::default()));
        let outcome = store
            .resolve_if_pending("missing", ApprovalResolution::Approved, None, Utc::now())
            .await;

        assert!(outcome.is_ok_and(|outcome| outcome == ApprovalTransition::NotFound));
    }

    #[tokio::test]
    async fn second_resolution_is_an_unchanged_no_op() {
        let store = ApprovalStore::new(Arc::new(FakeRecordStore::default()));
        let now = Utc::now();
        let Ok(created) = store.create(new_request(), 3600, now).await else {
            return;
        };

        let first = store
            .resolve_if_pending(
                created.id.as_str(),
                ApprovalResolution::Approved,
                Some("u2".to_owned()),
                now,
            )
            .await;
        let Ok(ApprovalTransition::Updated { request: first }) = first else {
            panic!("first resolution must update the request");
        };
        assert_eq!(first.status, ApprovalStatus::Approved);

        let second = store
            .resolve_if_pending(
                created.id.as_str(),
                ApprovalResolution::Approved,
                Some("u3".to_owned()),
                now,
            )
            .await;
        let Ok(second) = second else {
            panic!("second resolution must not error");
        };
        assert!(!second.changed());
        let ApprovalTransition::NotPending { request: second } = second else {
            panic!("second resolution must report not pending");
        };
        assert_eq!(second.status, ApprovalStatus::Approved);
        assert_eq!(second.resolved_at, first.resolved_at);
        assert_eq!(second.resolved_by.as_deref(), Some("u2"));
    }

    #[tokio::test]
    async fn past_expiry_wins_over_any_requested_resolution() {
        let store = ApprovalStore::new(Arc::new(FakeRecordStore::default()));
        let now = Utc::now();
        let Ok(created) = store.create(new_request(), 60, now).await else {
            return;
        };

        let outcome = store
            .resolve_if_pending(
                created.id.as_str(),
                ApprovalResolution::Denied,
                Some("u2".to_owned()),
                now + Duration::seconds(61),
            )
            .await;

        let Ok(ApprovalTransition::Expired { request }) = outcome else {
            panic!("past-due resolution must expire the request");
        };
        assert_eq!(request.status, ApprovalStatus::Expired);
        assert!(request.resolved_by.is_none());
    }

    #[tokio::test]
    async fn lost_swap_race_reports_winner_state() {
        let records = Arc::new(FakeRecordStore::default());
        let store = ApprovalStore::new(records.clone());
        let now = Utc::now();
        let Ok(created) = store.create(new_request(), 3600, now).await else {
            return;
        };

        // A concurrent winner resolves between this caller's read and swap.
        // Simulate by resolving through a second store handle first.
        let winner = ApprovalStore::new(records);
        let winner_outcome = winner
            .resolve_if_pending(
                created.id.as_str(),
                ApprovalResolution::Cancelled,
                Some("u1".to_owned()),
                now,
            )
            .await;
        assert!(winner_outcome.is_ok_and(|outcome| outcome.changed()));

        let loser = store
            .resolve_if_pending(
                created.id.as_str(),
                ApprovalResolution::Approved,
                Some("u2".to_owned()),
                now,
            )
            .await;
        let Ok(ApprovalTransition::NotPending { request }) = loser else {
            panic!("loser must observe not pending");
        };
        assert_eq!(request.status, ApprovalStatus::Cancelled);
    }
}
