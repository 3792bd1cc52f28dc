use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::{
    fs,
    process::Command,
    sync::OnceCell,
    time::{Instant, timeout_at},
};

use super::{
    diagnostics::{parse_compiler_output, parse_linker_output, summary_line},
    elf::{ElfError, ElfImage},
    references::{LibraryHandle, ReferenceError, discover_trusted_set, resolve_references},
    scratch::ScratchDir,
    support::SUPPORT_SOURCE,
};
use crate::{
    config::CompilerConfig,
    core::{
        domain::{CompileOutcome, Diagnostic},
        traits::compiler::Compiler,
    },
};

const SOURCE_NAME: &str = "main.cpp";
const OBJECT_NAME: &str = "main.o";
const ARTIFACT_NAME: &str = "artifact";
const SUPPORT_SOURCE_NAME: &str = "support.cpp";
const SUPPORT_OBJECT_NAME: &str = "support.o";

const LANGUAGE_FLAGS: [&str; 5] = [
    "-std=c++17",
    "-O2",
    "-fPIC",
    "-fdiagnostics-color=never",
    "-fno-diagnostics-show-caret",
];

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("failed to prepare scratch directory: {0}")]
    Scratch(#[source] std::io::Error),
    #[error("failed to run {path}: {source}")]
    Toolchain {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Compilation timed out after {0} ms")]
    TimedOut(u128),
    #[error("failed to build runtime support: {0}")]
    Support(String),
    #[error(transparent)]
    References(#[from] ReferenceError),
    #[error("compiled object is unreadable: {0}")]
    Object(#[from] ElfError),
    #[error("failed to read build output: {0}")]
    Artifact(#[source] std::io::Error),
}

impl From<CompileError> for CompileOutcome {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::TimedOut(_) => CompileOutcome::rejected(e.to_string()),
            other => CompileOutcome::exception(other),
        }
    }
}

struct ToolchainRun {
    success: bool,
    stderr: String,
}

/// Compiles C++17 sources with `g++` and links them against the trusted
/// platform libraries only.
#[derive(Debug)]
pub struct GnuCppCompiler {
    config: CompilerConfig,
    discovered_set: OnceCell<String>,
    support: OnceCell<ScratchDir>,
}

impl GnuCppCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self {
            config,
            discovered_set: OnceCell::new(),
            support: OnceCell::new(),
        }
    }

    async fn try_compile(&self, source: &str) -> Result<CompileOutcome, CompileError> {
        let scratch = ScratchDir::create(&self.config.work_dir, "compile")
            .await
            .map_err(CompileError::Scratch)?;
        fs::write(scratch.join(SOURCE_NAME), source)
            .await
            .map_err(CompileError::Scratch)?;

        let mut args = toolchain_args(&LANGUAGE_FLAGS);
        args.extend(toolchain_args(&["-Wall", "-c", SOURCE_NAME, "-o", OBJECT_NAME]));
        let compiled = self.run_toolchain(scratch.path(), args).await?;
        let mut diagnostics = parse_compiler_output(&compiled.stderr, SOURCE_NAME);
        if !compiled.success {
            return Ok(failure(diagnostics, &compiled.stderr));
        }

        let object = fs::read(scratch.join(OBJECT_NAME))
            .await
            .map_err(CompileError::Artifact)?;
        let has_main = ElfImage::parse(&object)?.defines_symbol("main")?;
        tracing::debug!(has_main, "Object compiled");

        let support = self.support_object().await?;
        let libraries = resolve_references(self.trusted_set().await?).await?;

        let linked = self
            .run_toolchain(scratch.path(), link_args(has_main, &support, &libraries))
            .await?;
        diagnostics.extend(parse_linker_output(&linked.stderr));
        if !linked.success {
            return Ok(failure(diagnostics, &linked.stderr));
        }

        let artifact = fs::read(scratch.join(ARTIFACT_NAME))
            .await
            .map_err(CompileError::Artifact)?;
        Ok(CompileOutcome::succeeded(
            artifact,
            diagnostics.iter().map(ToString::to_string).collect(),
        ))
    }

    async fn run_toolchain(
        &self,
        dir: &Path,
        args: Vec<OsString>,
    ) -> Result<ToolchainRun, CompileError> {
        let out = Command::new(&self.config.gnucpp_path)
            .args(args)
            .current_dir(dir)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| CompileError::Toolchain {
                path: self.config.gnucpp_path.display().to_string(),
                source,
            })?;

        Ok(ToolchainRun {
            success: out.status.success(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    /// The runtime support object, built on first use and kept for the
    /// lifetime of the compiler.
    async fn support_object(&self) -> Result<PathBuf, CompileError> {
        let dir = self
            .support
            .get_or_try_init(|| async {
                let dir = ScratchDir::create(&self.config.work_dir, "support")
                    .await
                    .map_err(CompileError::Scratch)?;
                fs::write(dir.join(SUPPORT_SOURCE_NAME), SUPPORT_SOURCE)
                    .await
                    .map_err(CompileError::Scratch)?;

                let mut args = toolchain_args(&LANGUAGE_FLAGS);
                args.extend(toolchain_args(&[
                    "-c",
                    SUPPORT_SOURCE_NAME,
                    "-o",
                    SUPPORT_OBJECT_NAME,
                ]));
                let run = self.run_toolchain(dir.path(), args).await?;
                if !run.success {
                    return Err(CompileError::Support(
                        summary_line(&run.stderr).unwrap_or("unknown error").to_string(),
                    ));
                }
                tracing::debug!(path = %dir.path().display(), "Runtime support built");
                Ok::<_, CompileError>(dir)
            })
            .await?;

        Ok(dir.join(SUPPORT_OBJECT_NAME))
    }

    async fn trusted_set(&self) -> Result<&str, CompileError> {
        if let Some(configured) = &self.config.trusted_libraries {
            return Ok(configured);
        }
        let discovered = self
            .discovered_set
            .get_or_try_init(|| discover_trusted_set(&self.config.gnucpp_path))
            .await?;
        Ok(discovered)
    }
}

#[async_trait::async_trait]
impl Compiler for GnuCppCompiler {
    #[tracing::instrument(skip(self, source), fields(source_len = source.len()))]
    async fn compile(&self, source: &str) -> CompileOutcome {
        let started = Instant::now();
        let deadline = started + self.config.timeout;

        let outcome = match timeout_at(deadline, self.try_compile(source)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!("Compilation failed unexpectedly: {}", e);
                e.into()
            }
            Err(_) => {
                tracing::warn!("Compilation timed out");
                CompileError::TimedOut(self.config.timeout.as_millis()).into()
            }
        };

        outcome.with_elapsed(started.elapsed())
    }
}

fn toolchain_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

fn link_args(has_main: bool, support: &Path, libraries: &[LibraryHandle]) -> Vec<OsString> {
    let mut args = toolchain_args(&[if has_main { "-pie" } else { "-shared" }]);
    args.extend(toolchain_args(&["-o", ARTIFACT_NAME, OBJECT_NAME]));
    args.push(support.into());
    args.push("-nodefaultlibs".into());
    args.extend(libraries.iter().map(|library| library.path.clone().into_os_string()));
    args
}

/// A failed toolchain run always reports at least one located error.
fn failure(mut diagnostics: Vec<Diagnostic>, stderr: &str) -> CompileOutcome {
    if !diagnostics.iter().any(Diagnostic::is_error) {
        if let Some(summary) = summary_line(stderr) {
            diagnostics.push(Diagnostic::error(1, summary));
        }
    }
    CompileOutcome::failed(diagnostics)
}
