use tokio::sync::RwLock;

use crate::core::{domain::SourceFile, traits::file_store::FileStore};

#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<Vec<SourceFile>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FileStore for MemoryFileStore {
    #[tracing::instrument(skip(self, file), fields(file_name = %file.file_name))]
    async fn add(&self, file: SourceFile) {
        let mut files = self.files.write().await;
        match files.iter_mut().find(|f| f.file_name == file.file_name) {
            Some(existing) => {
                tracing::debug!("Replacing stored file");
                *existing = file;
            }
            None => files.push(file),
        }
    }

    async fn list(&self) -> Vec<SourceFile> {
        self.files.read().await.clone()
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, file_name: &str) {
        self.files.write().await.retain(|f| f.file_name != file_name);
    }

    async fn clear(&self) {
        self.files.write().await.clear();
    }
}
