use std::path::PathBuf;
use std::time::Duration;

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("online-compiler")
}

#[derive(Clone, Debug)]
pub struct CompilerConfig {
    pub gnucpp_path: PathBuf,
    pub work_dir: PathBuf,
    /// Wall-clock bound for the whole compile call, toolchain runs included.
    pub timeout: Duration,
    /// Trusted platform libraries as one path-list string. `None` asks the
    /// toolchain for the default set on first use.
    pub trusted_libraries: Option<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            gnucpp_path: PathBuf::from("/usr/bin/g++"),
            work_dir: default_work_dir(),
            timeout: Duration::from_secs(10),
            trusted_libraries: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub work_dir: PathBuf,
    pub timeout: Duration,
    /// Cap for each captured stream (stdout and stderr separately).
    pub max_output_bytes: usize,
    pub memory_limit_bytes: Option<u64>,
    pub file_size_limit_bytes: Option<u64>,
    /// `RLIMIT_NPROC` for the program. The kernel counts every process of
    /// the host user against it and does not enforce it for root.
    pub process_limit: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            timeout: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
            memory_limit_bytes: None,
            file_size_limit_bytes: Some(16 * 1024 * 1024),
            process_limit: Some(64),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_concurrent_executions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
        }
    }
}
