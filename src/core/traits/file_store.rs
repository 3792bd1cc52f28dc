use crate::core::domain::SourceFile;

/// Uploaded sources, ordered by insertion and keyed by file name.
#[mockall::automock]
#[async_trait::async_trait]
pub trait FileStore: std::fmt::Debug + Send + Sync {
    async fn add(&self, file: SourceFile);

    async fn list(&self) -> Vec<SourceFile>;

    async fn remove(&self, file_name: &str);

    async fn clear(&self);
}
