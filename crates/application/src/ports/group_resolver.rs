use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use taskgate_core::AppResult;
use tokio::sync::Mutex;

/// Group membership resolution port, supplied by the channel adapter.
///
/// Resolution may be network-bound; callers treat a failure as fail-closed
/// deny, never fail-open.
#[async_trait]
pub trait GroupResolver: Send + Sync {
    /// Returns which of the candidate groups the user is a member of.
    ///
    /// Must be safe to call with an empty candidate list (no-op).
    async fn resolve(
        &self,
        provider: &str,
        user_id: &str,
        candidate_group_ids: &[String],
    ) -> AppResult<BTreeSet<String>>;
}

/// TTL-bounded memoization of resolved group memberships.
///
/// Entries are keyed by provider, user, and the candidate list: the resolver
/// answers with the intersection of its candidates, so results for different
/// candidate lists are not interchangeable.
///
/// Injected into the component that needs it rather than held as a
/// process-wide singleton, so it stays testable and resettable.
#[derive(Debug)]
pub struct GroupMembershipCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String, Vec<String>), (Instant, BTreeSet<String>)>>,
}

impl GroupMembershipCache {
    /// Creates a cache with the given entry lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a cached membership set when present and not expired.
    pub async fn get(
        &self,
        provider: &str,
        user_id: &str,
        candidates: &[String],
    ) -> Option<BTreeSet<String>> {
        let entries = self.entries.lock().await;
        let (stored_at, group_ids) =
            entries.get(&(provider.to_owned(), user_id.to_owned(), candidates.to_vec()))?;

        if stored_at.elapsed() >= self.ttl {
            return None;
        }

        Some(group_ids.clone())
    }

    /// Stores the membership set resolved for one candidate list.
    pub async fn put(
        &self,
        provider: &str,
        user_id: &str,
        candidates: &[String],
        group_ids: BTreeSet<String>,
    ) {
        self.entries.lock().await.insert(
            (provider.to_owned(), user_id.to_owned(), candidates.to_vec()),
            (Instant::now(), group_ids),
        );
    }

    /// Drops every cached entry.
    pub async fn reset(&self) {
        self.entries.lock().await.clear();
    }
}
