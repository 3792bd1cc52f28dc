use std::io;
use std::os::unix::{fs::PermissionsExt, process::ExitStatusExt};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::{Mutex, Notify},
    time::Instant,
};

use super::{
    elf::{ElfError, ElfImage},
    scratch::ScratchDir,
    support::{StderrReport, split_fault_report},
};
use crate::{
    config::ExecutorConfig,
    constants::{EXECUTION_EXCEPTION_PREFIX, NO_ENTRY_POINT_ERR},
    core::{
        domain::{ExecutionFailure, ExecutionOutcome},
        traits::executor::Executor,
    },
};

const PROGRAM_NAME: &str = "program";
const SPAWN_RETRIES: u32 = 5;
const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(20);
/// How long readers may keep draining pipes after the program is gone.
/// Grandchildren holding the pipe open are not waited for.
const READER_GRACE: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 8192;

/// `e_machine` of the images this host can run, when known.
const HOST_MACHINE: Option<u16> = if cfg!(target_arch = "x86_64") {
    Some(62)
} else if cfg!(target_arch = "aarch64") {
    Some(183)
} else if cfg!(target_arch = "x86") {
    Some(3)
} else if cfg!(target_arch = "riscv64") {
    Some(243)
} else {
    None
};

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("failed to load artifact: {0}")]
    Load(#[from] ElfError),
    #[error("failed to load artifact: built for machine {image}, host runs {host}")]
    ForeignMachine { image: u16, host: u16 },
    #[error("failed to prepare execution context: {0}")]
    Context(#[source] io::Error),
    #[error("failed to start program: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to wait for program: {0}")]
    Wait(#[source] io::Error),
}

impl From<ExecuteError> for ExecutionOutcome {
    fn from(e: ExecuteError) -> Self {
        let failure = match e {
            ExecuteError::Load(_) | ExecuteError::ForeignMachine { .. } => ExecutionFailure::Load,
            _ => ExecutionFailure::Internal,
        };
        ExecutionOutcome::failed(failure, format!("{}: {}", EXECUTION_EXCEPTION_PREFIX, e))
    }
}

/// Limits applied to the program between `fork` and `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub memory_bytes: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub processes: Option<u64>,
}

impl ResourceLimits {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            // At least a second past the wall-clock timeout, which must fire first
            cpu_seconds: config.timeout.as_secs() + 1,
            memory_bytes: config.memory_limit_bytes,
            file_size_bytes: config.file_size_limit_bytes,
            processes: config.process_limit,
        }
    }

    /// Only async-signal-safe calls: this runs in the forked child.
    fn apply(&self) -> io::Result<()> {
        unsafe {
            let cpu = libc::rlimit {
                rlim_cur: self.cpu_seconds as libc::rlim_t,
                rlim_max: self.cpu_seconds as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                return Err(io::Error::last_os_error());
            }

            if let Some(bytes) = self.memory_bytes {
                let memory = libc::rlimit {
                    rlim_cur: bytes as libc::rlim_t,
                    rlim_max: bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &memory) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            if let Some(bytes) = self.file_size_bytes {
                let fsize = libc::rlimit {
                    rlim_cur: bytes as libc::rlim_t,
                    rlim_max: bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            // Bounds forks that leave the process group through setsid()
            if let Some(count) = self.processes {
                let nproc = libc::rlimit {
                    rlim_cur: count as libc::rlim_t,
                    rlim_max: count as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_NPROC, &nproc) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            let core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CaptureBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CaptureBuffer {
    /// Appends up to `limit` bytes in total. Returns `true` the first time
    /// something had to be dropped.
    fn push(&mut self, chunk: &[u8], limit: usize) -> bool {
        let room = limit.saturating_sub(self.bytes.len());
        self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let overflowed = chunk.len() > room && !self.truncated;
        self.truncated |= chunk.len() > room;
        overflowed
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

async fn capture<R>(
    mut reader: R,
    buffer: Arc<Mutex<CaptureBuffer>>,
    limit: usize,
    overflow: Option<Arc<Notify>>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        // Keep draining after the cap so the program never blocks on a full pipe
        if buffer.lock().await.push(&chunk[..n], limit) {
            if let Some(overflow) = &overflow {
                overflow.notify_one();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Exited,
    TimedOut,
    OutputLimit,
}

/// What is known once the program has been reaped.
#[derive(Debug)]
struct Finished {
    stop: Stop,
    status: ExitStatus,
    stdout: CaptureBuffer,
    stderr: CaptureBuffer,
}

impl Finished {
    fn into_outcome(self, config: &ExecutorConfig) -> ExecutionOutcome {
        // The support unit aborts right after reporting; a marker in the
        // stderr of a program that ended any other way is its own text.
        let report = if self.status.signal() == Some(libc::SIGABRT) {
            split_fault_report(&self.stderr.text())
        } else {
            StderrReport {
                fault: None,
                stderr: self.stderr.text(),
            }
        };

        let outcome = if self.stop == Stop::TimedOut {
            ExecutionOutcome::failed(
                ExecutionFailure::Timeout,
                format!("Execution timed out after {} ms", config.timeout.as_millis()),
            )
        } else if let Some(fault) = report.fault {
            ExecutionOutcome::failed(ExecutionFailure::Runtime, fault)
        } else if self.stop == Stop::OutputLimit || self.stdout.truncated {
            ExecutionOutcome::failed(
                ExecutionFailure::OutputLimitExceeded,
                format!("Output exceeded the limit of {} bytes", config.max_output_bytes),
            )
        } else if let Some(signal) = self.status.signal() {
            if signal == libc::SIGXCPU {
                ExecutionOutcome::failed(ExecutionFailure::Timeout, "CPU time limit exceeded")
            } else {
                ExecutionOutcome::failed(
                    ExecutionFailure::Runtime,
                    format!(
                        "Program terminated by signal {} ({})",
                        signal,
                        signal_name(signal)
                    ),
                )
            }
        } else {
            ExecutionOutcome::completed(self.status.code())
        };

        ExecutionOutcome {
            exit_code: self.status.code(),
            ..outcome.with_output(self.stdout.text(), report.stderr)
        }
    }
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGSYS => "SIGSYS",
        _ => "unknown signal",
    }
}

/// Runs artifacts as child processes, one private process and scratch
/// directory per execution.
#[derive(Debug, Clone)]
pub struct NativeExecutor {
    config: ExecutorConfig,
}

impl NativeExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    async fn try_execute(&self, artifact: &[u8]) -> Result<ExecutionOutcome, ExecuteError> {
        let image = ElfImage::parse(artifact)?;
        if image.entry_point()?.is_none() {
            tracing::debug!(kind = ?image.kind(), "Artifact has no entry point");
            return Ok(ExecutionOutcome::failed(
                ExecutionFailure::NoEntryPoint,
                NO_ENTRY_POINT_ERR,
            ));
        }
        if let Some(host) = HOST_MACHINE {
            if image.machine() != host {
                return Err(ExecuteError::ForeignMachine {
                    image: image.machine(),
                    host,
                });
            }
        }

        let scratch = ScratchDir::create(&self.config.work_dir, "run")
            .await
            .map_err(ExecuteError::Context)?;
        fs::set_permissions(scratch.path(), std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(ExecuteError::Context)?;
        let program = scratch.join(PROGRAM_NAME);
        write_image(&program, artifact)
            .await
            .map_err(ExecuteError::Context)?;

        let child = self.spawn(&program, scratch.path()).await?;
        let finished = self.supervise(child).await?;
        tracing::debug!(stop = ?finished.stop, status = %finished.status, "Program finished");

        Ok(finished.into_outcome(&self.config))
    }

    async fn spawn(&self, program: &Path, dir: &Path) -> Result<Child, ExecuteError> {
        let limits = ResourceLimits::from_config(&self.config);

        let mut command = Command::new(program);
        command
            .env_clear()
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        unsafe {
            command.pre_exec(move || limits.apply());
        }

        let mut attempt = 0;
        loop {
            match command.spawn() {
                Ok(child) => return Ok(child),
                // Another thread forked while the image was still open for writing
                Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_RETRIES => {
                    attempt += 1;
                    tracing::debug!(attempt, "Program image busy, retrying spawn");
                    tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                }
                Err(e) => return Err(ExecuteError::Spawn(e)),
            }
        }
    }

    async fn supervise(&self, mut child: Child) -> Result<Finished, ExecuteError> {
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecuteError::Context(io::Error::other(
                "program streams are not piped",
            )));
        };

        // The program leads its own group, so the group id is its pid
        let group = child.id();

        let limit = self.config.max_output_bytes;
        let overflow = Arc::new(Notify::new());
        let stdout_buffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let stderr_buffer = Arc::new(Mutex::new(CaptureBuffer::default()));
        let readers = [
            tokio::spawn(capture(stdout, stdout_buffer.clone(), limit, Some(overflow.clone()))),
            tokio::spawn(capture(stderr, stderr_buffer.clone(), limit, None)),
        ];

        let deadline = Instant::now() + self.config.timeout;
        let stop = tokio::select! {
            status = child.wait() => {
                status.map_err(ExecuteError::Wait)?;
                Stop::Exited
            }
            _ = tokio::time::sleep_until(deadline) => Stop::TimedOut,
            _ = overflow.notified() => Stop::OutputLimit,
        };

        if stop != Stop::Exited {
            tracing::warn!(?stop, "Killing program");
            if let Err(e) = child.start_kill() {
                tracing::debug!("Failed to kill program: {}", e);
            }
        }
        let status = child.wait().await.map_err(ExecuteError::Wait)?;
        // Whatever the program forked must not outlive the execution
        if let Some(group) = group {
            kill_group(group);
        }

        for reader in readers {
            let abort = reader.abort_handle();
            match tokio::time::timeout(READER_GRACE, reader).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => tracing::debug!("Failed to read program output: {}", e),
                Ok(Err(e)) => tracing::debug!("Output reader failed: {}", e),
                Err(_) => {
                    tracing::debug!("Output pipe still open after exit, abandoning it");
                    abort.abort();
                }
            }
        }

        Ok(Finished {
            stop,
            status,
            stdout: std::mem::take(&mut *stdout_buffer.lock().await),
            stderr: std::mem::take(&mut *stderr_buffer.lock().await),
        })
    }
}

fn kill_group(group: u32) {
    let Ok(group) = libc::pid_t::try_from(group) else {
        return;
    };
    if unsafe { libc::killpg(group, libc::SIGKILL) } == 0 {
        tracing::debug!(group, "Killed processes left behind by the program");
        return;
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() != Some(libc::ESRCH) {
        tracing::debug!(group, "Failed to kill process group: {}", e);
    }
}

async fn write_image(path: &Path, artifact: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o700)
        .open(path)
        .await?;
    file.write_all(artifact).await?;
    file.flush().await?;
    // The descriptor must be closed before exec or the kernel reports ETXTBSY
    drop(file);
    Ok(())
}

#[async_trait::async_trait]
impl Executor for NativeExecutor {
    #[tracing::instrument(skip(self, artifact), fields(artifact_len = artifact.len()))]
    async fn execute(&self, artifact: &[u8]) -> ExecutionOutcome {
        let started = Instant::now();

        let outcome = match self.try_execute(artifact).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Execution failed: {}", e);
                e.into()
            }
        };

        outcome.with_elapsed(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CompilerConfig,
        constants::FAULT_MARKER,
        core::traits::compiler::Compiler,
        native::{compiler::GnuCppCompiler, elf::fixtures},
    };
    use std::path::PathBuf;

    fn gnucpp_path() -> PathBuf {
        std::env::var("GNUCPP_PATH")
            .unwrap_or("/usr/bin/g++".to_string())
            .into()
    }

    async fn build(source: &str) -> Vec<u8> {
        let compiler = GnuCppCompiler::new(CompilerConfig {
            gnucpp_path: gnucpp_path(),
            ..CompilerConfig::default()
        });
        let outcome = compiler.compile(source).await;
        assert!(outcome.success, "{:?}", outcome.errors);
        outcome.artifact.unwrap()
    }

    fn executor() -> NativeExecutor {
        NativeExecutor::new(ExecutorConfig::default())
    }

    fn finished(status: i32, stdout: &[u8], stderr: &[u8]) -> Finished {
        Finished {
            stop: Stop::Exited,
            status: ExitStatus::from_raw(status),
            stdout: CaptureBuffer {
                bytes: stdout.to_vec(),
                truncated: false,
            },
            stderr: CaptureBuffer {
                bytes: stderr.to_vec(),
                truncated: false,
            },
        }
    }

    #[test]
    fn test_capture_buffer_truncates_once() {
        let mut buffer = CaptureBuffer::default();
        assert!(!buffer.push(b"abc", 4));
        assert!(buffer.push(b"def", 4));
        assert!(!buffer.push(b"ghi", 4));

        assert_eq!(buffer.bytes, b"abcd");
        assert!(buffer.truncated);
    }

    #[test]
    fn test_cpu_limit_outlasts_wall_clock_timeout() {
        let limits = ResourceLimits::from_config(&ExecutorConfig {
            timeout: Duration::from_millis(2500),
            memory_limit_bytes: Some(64 << 20),
            ..ExecutorConfig::default()
        });

        assert_eq!(limits.cpu_seconds, 3);
        assert_eq!(limits.memory_bytes, Some(64 << 20));
    }

    #[test]
    fn test_nonzero_exit_is_a_normal_return() {
        let outcome = finished(3 << 8, b"done\n", b"").into_outcome(&ExecutorConfig::default());

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.output, "done\n");
    }

    #[test]
    fn test_signal_classification() {
        let config = ExecutorConfig::default();

        let segv = finished(libc::SIGSEGV, b"", b"").into_outcome(&config);
        assert_eq!(segv.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(
            segv.error.as_deref(),
            Some("Program terminated by signal 11 (SIGSEGV)")
        );

        let cpu = finished(libc::SIGXCPU, b"", b"").into_outcome(&config);
        assert_eq!(cpu.failure, Some(ExecutionFailure::Timeout));
        assert_eq!(cpu.error.as_deref(), Some("CPU time limit exceeded"));
    }

    #[test]
    fn test_fault_report_wins_over_abort() {
        let stderr = format!("{}vector::_M_range_check\n", FAULT_MARKER);
        let outcome = finished(libc::SIGABRT, b"partial", stderr.as_bytes())
            .into_outcome(&ExecutorConfig::default());

        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(outcome.error.as_deref(), Some("vector::_M_range_check"));
        assert_eq!(outcome.output, "partial");
        assert_eq!(outcome.stderr, "");
    }

    #[test]
    fn test_marker_without_abort_is_plain_stderr() {
        let stderr = format!("{}not really\n", FAULT_MARKER);
        let outcome = finished(0, b"ok\n", stderr.as_bytes()).into_outcome(&ExecutorConfig::default());

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stderr, stderr);
    }

    #[tokio::test]
    async fn test_garbage_fails_to_load() {
        let outcome = executor().execute(b"definitely not a program").await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(ExecutionFailure::Load));
        assert!(
            outcome
                .error
                .unwrap()
                .starts_with("Execution exception: failed to load artifact")
        );
        assert_eq!(outcome.output, "");
        assert!(outcome.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_foreign_machine_fails_to_load() {
        let outcome = executor().execute(&fixtures::foreign_program()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(ExecutionFailure::Load));
        let error = outcome.error.unwrap();
        assert!(
            error.starts_with("Execution exception: failed to load artifact"),
            "{}",
            error
        );
        assert!(outcome.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_library_has_no_entry_point() {
        let outcome = executor().execute(&fixtures::shared_library()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(ExecutionFailure::NoEntryPoint));
        assert_eq!(outcome.error.as_deref(), Some(NO_ENTRY_POINT_ERR));
        assert_eq!(outcome.output, "");
        assert!(outcome.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_hello() {
        let artifact = build(
            "#include <iostream>\nint main() { std::cout << \"hello\" << std::endl; }\n",
        )
        .await;
        let outcome = executor().execute(&artifact).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.output, "hello\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_runtime_fault_keeps_partial_output() {
        let artifact = build(
            "#include <iostream>\n#include <stdexcept>\n\
             int main() { std::cout << \"partial\"; throw std::runtime_error(\"boom\"); }\n",
        )
        .await;
        let outcome = executor().execute(&artifact).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(outcome.output, "partial");
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_nested_exception_reports_innermost() {
        let artifact = build(
            "#include <exception>\n#include <stdexcept>\n\
             int main() {\n\
                 try { throw std::out_of_range(\"index 7\"); }\n\
                 catch (...) { std::throw_with_nested(std::runtime_error(\"lookup failed\")); }\n\
             }\n",
        )
        .await;
        let outcome = executor().execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(outcome.error.as_deref(), Some("index 7"));
    }

    #[tokio::test]
    async fn test_timeout_kills_infinite_loop() {
        let artifact = build("int main() { volatile bool spin = true; while (spin) {} }\n").await;
        let executor = NativeExecutor::new(ExecutorConfig {
            timeout: Duration::from_millis(200),
            ..ExecutorConfig::default()
        });
        let outcome = executor.execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout));
        assert_eq!(
            outcome.error.as_deref(),
            Some("Execution timed out after 200 ms")
        );
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_limit() {
        let artifact = build(
            "#include <iostream>\nint main() { for (;;) std::cout << \"0123456789\"; }\n",
        )
        .await;
        let executor = NativeExecutor::new(ExecutorConfig {
            max_output_bytes: 1024,
            ..ExecutorConfig::default()
        });
        let outcome = executor.execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::OutputLimitExceeded));
        assert_eq!(
            outcome.error.as_deref(),
            Some("Output exceeded the limit of 1024 bytes")
        );
        assert_eq!(outcome.output.len(), 1024);
    }

    #[tokio::test]
    async fn test_signal_is_reported() {
        let artifact = build("#include <csignal>\nint main() { std::raise(SIGSEGV); }\n").await;
        let outcome = executor().execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(
            outcome.error.as_deref(),
            Some("Program terminated by signal 11 (SIGSEGV)")
        );
    }

    #[tokio::test]
    async fn test_signal_keeps_completed_lines() {
        let artifact = build(
            "#include <csignal>\n#include <iostream>\n\
             int main() { std::cout << \"before\\n\"; std::raise(SIGSEGV); }\n",
        )
        .await;
        let outcome = executor().execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(outcome.output, "before\n");
        assert_eq!(
            outcome.error.as_deref(),
            Some("Program terminated by signal 11 (SIGSEGV)")
        );
    }

    #[tokio::test]
    async fn test_timeout_keeps_completed_lines() {
        let artifact = build(
            "#include <iostream>\n\
             int main() { std::cout << \"spinning\\n\"; volatile bool spin = true; while (spin) {} }\n",
        )
        .await;
        let executor = NativeExecutor::new(ExecutorConfig {
            timeout: Duration::from_millis(300),
            ..ExecutorConfig::default()
        });
        let outcome = executor.execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout));
        assert_eq!(outcome.output, "spinning\n");
    }

    #[tokio::test]
    async fn test_multiline_exception_message() {
        let artifact = build(
            r#"
#include <stdexcept>

int main() {
    throw std::runtime_error("first\nsecond");
}
"#,
        )
        .await;
        let outcome = executor().execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(outcome.error.as_deref(), Some("first\nsecond"));
        assert_eq!(outcome.stderr, "");
    }

    #[tokio::test]
    async fn test_exception_from_global_constructor() {
        let artifact = build(
            r#"
#include <stdexcept>

struct Registry {
    Registry() { throw std::runtime_error("from global"); }
};

Registry registry;

int main() {}
"#,
        )
        .await;
        let outcome = executor().execute(&artifact).await;

        assert_eq!(outcome.failure, Some(ExecutionFailure::Runtime));
        assert_eq!(outcome.error.as_deref(), Some("from global"));
    }

    #[tokio::test]
    async fn test_printed_marker_is_not_a_fault() {
        let source = format!(
            r#"
#include <cstdio>

int main() {{
    std::fputs("{}fake\n", stderr);
    std::puts("ok");
}}
"#,
            FAULT_MARKER
        );
        let artifact = build(&source).await;
        let outcome = executor().execute(&artifact).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.output, "ok\n");
        assert_eq!(outcome.stderr, format!("{}fake\n", FAULT_MARKER));
    }

    /// A program whose forked child sleeps with its pipes closed, then
    /// leaves a file behind if it is still alive.
    fn forking_program(leftover: &Path, parent: &str) -> String {
        format!(
            r#"
#include <cstdio>
#include <unistd.h>

int main() {{
    if (fork() == 0) {{
        close(1);
        close(2);
        sleep(1);
        if (FILE* file = std::fopen("{}", "w")) std::fclose(file);
        _exit(0);
    }}
    {}
}}
"#,
            leftover.display(),
            parent
        )
    }

    fn leftover_path() -> PathBuf {
        std::env::temp_dir().join(format!("leftover_{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_forked_process_dies_with_timed_out_program() {
        let leftover = leftover_path();
        let artifact = build(&forking_program(
            &leftover,
            "volatile bool spin = true; while (spin) {}",
        ))
        .await;
        let executor = NativeExecutor::new(ExecutorConfig {
            timeout: Duration::from_millis(300),
            ..ExecutorConfig::default()
        });
        let outcome = executor.execute(&artifact).await;
        assert_eq!(outcome.failure, Some(ExecutionFailure::Timeout));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_forked_process_dies_with_finished_program() {
        let leftover = leftover_path();
        let artifact = build(&forking_program(&leftover, "return 0;")).await;
        let outcome = executor().execute(&artifact).await;
        assert!(outcome.success, "{:?}", outcome.error);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!leftover.exists());
    }

    #[test]
    fn test_process_limit_is_applied() {
        let limits = ResourceLimits::from_config(&ExecutorConfig {
            process_limit: Some(8),
            ..ExecutorConfig::default()
        });
        assert_eq!(limits.processes, Some(8));
        assert_eq!(ResourceLimits::from_config(&ExecutorConfig::default()).processes, Some(64));
    }

    #[tokio::test]
    async fn test_exit_code_is_recorded() {
        let artifact = build("#include <cstdio>\nint main() { std::puts(\"bye\"); return 3; }\n").await;
        let outcome = executor().execute(&artifact).await;

        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.output, "bye\n");
    }

    #[tokio::test]
    async fn test_executions_are_isolated() {
        let first = build("#include <cstdio>\nint main() { std::puts(\"first\"); }\n").await;
        let second = build("#include <cstdio>\nint main() { std::puts(\"second\"); }\n").await;
        let executor = executor();

        assert_eq!(executor.execute(&first).await.output, "first\n");
        assert_eq!(executor.execute(&second).await.output, "second\n");

        let (a, b) = tokio::join!(executor.execute(&first), executor.execute(&second));
        assert_eq!(a.output, "first\n");
        assert_eq!(b.output, "second\n");
    }
}
