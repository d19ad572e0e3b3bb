use async_trait::async_trait;
use taskgate_application::WorkspaceCleaner;
use taskgate_core::{AppError, AppResult};

/// Filesystem workspace cleaner removing per-job working directories.
#[derive(Debug, Clone, Default)]
pub struct FsWorkspaceCleaner;

impl FsWorkspaceCleaner {
    /// Creates a cleaner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkspaceCleaner for FsWorkspaceCleaner {
    async fn remove_workspace(&self, path: &str) -> AppResult<()> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(AppError::Internal(format!(
                "failed to remove workspace '{path}': {error}"
            ))),
        }
    }
}
