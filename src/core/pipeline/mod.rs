use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    config::PipelineConfig,
    constants::EXECUTION_EXCEPTION_PREFIX,
    core::{
        domain::{CompileOutcome, ExecutionFailure, ExecutionOutcome},
        traits::{compiler::Compiler, executor::Executor, file_store::FileStore},
    },
};

/// Result of one compile-then-run request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub compilation: CompileOutcome,
    /// Present iff compilation succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
}

#[derive(Clone, Debug)]
pub struct Pipeline {
    compiler: Arc<dyn Compiler>,
    executor: Arc<dyn Executor>,
    execution_slots: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(
        compiler: Arc<dyn Compiler>,
        executor: Arc<dyn Executor>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            compiler,
            executor,
            execution_slots: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
        }
    }

    /// Compiles `source` and, only once that has finished successfully, runs
    /// the artifact.
    #[tracing::instrument(skip(self, source), fields(source_len = source.len()))]
    pub async fn submit(&self, source: &str) -> Report {
        tracing::debug!("Start compiling");
        let compilation = self.compiler.compile(source).await;
        tracing::debug!(
            success = compilation.success,
            errors = compilation.errors.len(),
            warnings = compilation.warnings.len(),
            elapsed = ?compilation.elapsed,
            "Compilation finished"
        );

        let execution = match (compilation.success, compilation.artifact.as_deref()) {
            (true, Some(artifact)) => Some(self.run(artifact).await),
            _ => None,
        };

        Report {
            file_name: None,
            compilation,
            execution,
        }
    }

    /// Looks `file_name` up in `store` and submits its content. `None` when
    /// the store has no such file.
    #[tracing::instrument(skip(self, store))]
    pub async fn submit_file(&self, store: &dyn FileStore, file_name: &str) -> Option<Report> {
        let Some(file) = store
            .list()
            .await
            .into_iter()
            .find(|file| file.file_name == file_name)
        else {
            tracing::warn!("File is not in the store");
            return None;
        };

        let report = self.submit(&file.content).await;
        Some(Report {
            file_name: Some(file.file_name),
            ..report
        })
    }

    async fn run(&self, artifact: &[u8]) -> ExecutionOutcome {
        match self.execution_slots.acquire().await {
            Ok(_permit) => {
                tracing::debug!("Start executing");
                let execution = self.executor.execute(artifact).await;
                tracing::debug!(
                    success = execution.success,
                    failure = ?execution.failure,
                    elapsed = ?execution.elapsed,
                    "Execution finished"
                );
                execution
            }
            Err(e) => {
                tracing::error!("Execution slots are closed: {}", e);
                ExecutionOutcome::failed(
                    ExecutionFailure::Internal,
                    format!("{}: {}", EXECUTION_EXCEPTION_PREFIX, e),
                )
            }
        }
    }
}
