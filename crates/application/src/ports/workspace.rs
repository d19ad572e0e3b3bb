use async_trait::async_trait;
use taskgate_core::AppResult;

/// Removal of on-disk job working directories.
///
/// Callers treat failures as best-effort: they log and continue, so a stale
/// directory never blocks record deletion.
#[async_trait]
pub trait WorkspaceCleaner: Send + Sync {
    /// Removes one working directory and its contents.
    async fn remove_workspace(&self, path: &str) -> AppResult<()>;
}
