use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

/// A uniquely named directory removed when dropped.
#[derive(Debug)]
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub(crate) async fn create(parent: &Path, prefix: &str) -> std::io::Result<Self> {
        let path = parent.join(format!("{}_{}", prefix, Uuid::new_v4()));
        fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            tracing::debug!(path = %self.path.display(), "Failed to remove scratch dir: {}", e);
        }
    }
}
