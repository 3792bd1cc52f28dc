use crate::core::domain::CompileOutcome;

#[mockall::automock]
#[async_trait::async_trait]
pub trait Compiler: std::fmt::Debug + Send + Sync {
    /// Compiles `source` into an artifact. Every failure, including the
    /// compiler's own, is reported inside the outcome.
    async fn compile(&self, source: &str) -> CompileOutcome;
}
