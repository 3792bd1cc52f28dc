use crate::core::domain::ExecutionOutcome;

#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    /// Loads `artifact`, invokes its entry point and captures what it prints.
    /// Every failure is reported inside the outcome.
    async fn execute(&self, artifact: &[u8]) -> ExecutionOutcome;
}
