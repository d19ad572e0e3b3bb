use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use taskgate_application::GroupResolver;
use taskgate_core::AppResult;

/// Group resolver backed by a fixed membership table.
///
/// Suits deployments whose chat provider exposes no membership API; the
/// table is loaded from configuration at startup.
#[derive(Debug, Default)]
pub struct StaticGroupResolver {
    memberships: HashMap<(String, String), BTreeSet<String>>,
}

impl StaticGroupResolver {
    /// Creates a resolver over the given `(provider, user_id)` table.
    #[must_use]
    pub fn new(memberships: HashMap<(String, String), BTreeSet<String>>) -> Self {
        Self { memberships }
    }
}

#[async_trait]
impl GroupResolver for StaticGroupResolver {
    async fn resolve(
        &self,
        provider: &str,
        user_id: &str,
        candidate_group_ids: &[String],
    ) -> AppResult<BTreeSet<String>> {
        let member_of = self
            .memberships
            .get(&(provider.to_owned(), user_id.to_owned()));

        let Some(member_of) = member_of else {
            return Ok(BTreeSet::new());
        };

        Ok(candidate_group_ids
            .iter()
            .filter(|candidate| member_of.contains(candidate.as_str()))
            .cloned()
            .collect())
    }
}
