use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use online_compiler::{
    config::{CompilerConfig, ExecutorConfig, PipelineConfig},
    core::{domain::SourceFile, pipeline::Pipeline, traits::file_store::FileStore},
    native::{compiler::GnuCppCompiler, executor::NativeExecutor, file_store::MemoryFileStore},
};

const STDIN_NAME: &str = "-";

/// Compiles C++ sources and runs the resulting programs, printing one JSON
/// report per file.
#[derive(Debug, Parser)]
#[command(name = "online-compiler", version)]
struct Args {
    /// Source files to compile and run, in order. `-` reads stdin.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long, env = "GNUCPP_PATH", default_value = "/usr/bin/g++")]
    gnucpp_path: PathBuf,

    /// Parent of all scratch directories. Defaults to the system temp dir.
    #[arg(long, env = "ONLINE_COMPILER_WORK_DIR")]
    work_dir: Option<PathBuf>,

    #[arg(long, env = "COMPILE_TIMEOUT_MS", default_value_t = 10_000)]
    compile_timeout_ms: u64,

    #[arg(long, env = "RUN_TIMEOUT_MS", default_value_t = 5_000)]
    run_timeout_ms: u64,

    #[arg(long, env = "MAX_OUTPUT_BYTES", default_value_t = 1024 * 1024)]
    max_output_bytes: usize,

    #[arg(long, env = "MEMORY_LIMIT_BYTES")]
    memory_limit_bytes: Option<u64>,

    /// Process limit of each program. Defaults to 64.
    #[arg(long, env = "PROCESS_LIMIT")]
    process_limit: Option<u64>,

    /// Platform path list of libraries programs may link against. Asked from
    /// the toolchain when absent.
    #[arg(long, env = "TRUSTED_PLATFORM_LIBRARIES")]
    trusted_libraries: Option<String>,

    #[arg(long, env = "MAX_CONCURRENT_EXECUTIONS", default_value_t = 4)]
    max_concurrent_executions: usize,

    /// Keep the artifact bytes in the printed reports.
    #[arg(long)]
    include_artifact: bool,

    #[arg(long)]
    pretty: bool,
}

impl Args {
    fn compiler_config(&self) -> CompilerConfig {
        let defaults = CompilerConfig::default();
        CompilerConfig {
            gnucpp_path: self.gnucpp_path.clone(),
            work_dir: self.work_dir.clone().unwrap_or(defaults.work_dir),
            timeout: Duration::from_millis(self.compile_timeout_ms),
            trusted_libraries: self.trusted_libraries.clone(),
        }
    }

    fn executor_config(&self) -> ExecutorConfig {
        let defaults = ExecutorConfig::default();
        ExecutorConfig {
            work_dir: self.work_dir.clone().unwrap_or(defaults.work_dir),
            timeout: Duration::from_millis(self.run_timeout_ms),
            max_output_bytes: self.max_output_bytes,
            memory_limit_bytes: self.memory_limit_bytes,
            process_limit: self.process_limit.or(defaults.process_limit),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let args = Args::parse();
    tracing::debug!(?args, "Starting");

    let store = MemoryFileStore::new();
    let mut names = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let (name, content) = read_source(path).await?;
        store.add(SourceFile::new(&name, &content)).await;
        names.push(name);
    }

    let pipeline = Pipeline::new(
        Arc::new(GnuCppCompiler::new(args.compiler_config())),
        Arc::new(NativeExecutor::new(args.executor_config())),
        &PipelineConfig {
            max_concurrent_executions: args.max_concurrent_executions,
        },
    );

    let mut reports = Vec::with_capacity(names.len());
    for name in &names {
        let Some(report) = pipeline.submit_file(&store, name).await else {
            return Err(format!("{} vanished from the file store", name).into());
        };
        let mut value = serde_json::to_value(&report)?;
        if !args.include_artifact {
            if let Some(compilation) = value
                .get_mut("compilation")
                .and_then(serde_json::Value::as_object_mut)
            {
                compilation.remove("artifact");
            }
        }
        reports.push(value);
    }

    let reports = serde_json::Value::Array(reports);
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&reports)?
    } else {
        serde_json::to_string(&reports)?
    };
    println!("{}", rendered);

    Ok(())
}

async fn read_source(path: &Path) -> Result<(String, String), Box<dyn std::error::Error>> {
    if path.as_os_str() == STDIN_NAME {
        let mut content = String::new();
        tokio::io::stdin().read_to_string(&mut content).await?;
        return Ok((STDIN_NAME.to_string(), content));
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    Ok((path.display().to_string(), content))
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
