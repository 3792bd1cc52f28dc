use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::COMPILATION_EXCEPTION_PREFIX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// 1-based source line.
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            line: line.max(1),
            message: message.into(),
        }
    }

    pub fn warning(line: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            line: line.max(1),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub success: bool,
    pub artifact: Option<Vec<u8>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(with = "elapsed_ms")]
    pub elapsed: Duration,
}

impl CompileOutcome {
    pub fn succeeded(artifact: Vec<u8>, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            artifact: Some(artifact),
            errors: Vec::new(),
            warnings,
            elapsed: Duration::ZERO,
        }
    }

    /// Files every diagnostic by severity. A failed compile always carries at
    /// least one error, so an error-free list gets a generic one.
    pub fn failed(diagnostics: impl IntoIterator<Item = Diagnostic>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) =
            diagnostics.into_iter().partition(Diagnostic::is_error);

        let mut errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
        if errors.is_empty() {
            errors.push(Diagnostic::error(1, "Compilation failed").to_string());
        }

        Self {
            success: false,
            artifact: None,
            errors,
            warnings: warnings.iter().map(ToString::to_string).collect(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            artifact: None,
            errors: vec![message.into()],
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn exception(cause: impl fmt::Display) -> Self {
        Self::rejected(format!("{}: {}", COMPILATION_EXCEPTION_PREFIX, cause))
    }

    pub fn with_elapsed(self, elapsed: Duration) -> Self {
        Self { elapsed, ..self }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The artifact is not a loadable image.
    Load,
    /// The artifact is a library, not a program.
    NoEntryPoint,
    /// The program itself faulted.
    Runtime,
    Timeout,
    OutputLimitExceeded,
    /// The pipeline's own machinery failed.
    Internal,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    #[serde(with = "elapsed_ms")]
    pub elapsed: Duration,
    pub failure: Option<ExecutionFailure>,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl ExecutionOutcome {
    pub fn completed(exit_code: Option<i32>) -> Self {
        Self {
            success: true,
            exit_code,
            ..Self::default()
        }
    }

    pub fn failed(failure: ExecutionFailure, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            failure: Some(failure),
            ..Self::default()
        }
    }

    pub fn with_output(self, output: String, stderr: String) -> Self {
        Self {
            output,
            stderr,
            ..self
        }
    }

    pub fn with_elapsed(self, elapsed: Duration) -> Self {
        Self { elapsed, ..self }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub file_name: String,
    pub content: String,
    pub uploaded_at: DateTime<Utc>,
}

impl SourceFile {
    pub fn new(file_name: &str, content: &str) -> Self {
        SourceFile {
            file_name: file_name.to_string(),
            content: content.to_string(),
            uploaded_at: Utc::now(),
        }
    }
}

/// Durations travel as fractional milliseconds.
mod elapsed_ms {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(elapsed.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(D::Error::custom(
                "elapsed must be a non-negative number of milliseconds",
            ));
        }
        Ok(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
    }
}
