use std::sync::LazyLock;

use regex::Regex;

use crate::core::domain::Diagnostic;

/// `file:line[:column]: severity: message`, as printed by `g++` with colours
/// and caret lines disabled.
static LOCATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^:\n]+):(?P<line>\d+):(?:(?P<column>\d+):)? (?P<severity>fatal error|error|warning|note): (?P<message>.*)$",
    )
    .expect("diagnostic pattern is valid")
});

/// Diagnostics from one `g++ -c` run. Only locations inside `source_name`
/// keep their line; anything reported inside other files (system headers)
/// is pinned to line 1. Notes continue the previous diagnostic and are
/// dropped.
pub fn parse_compiler_output(stderr: &str, source_name: &str) -> Vec<Diagnostic> {
    stderr
        .lines()
        .filter_map(|line| LOCATED.captures(line.trim_end()))
        .filter_map(|caps| {
            let line = if &caps["file"] == source_name {
                caps["line"].parse::<u32>().unwrap_or(1)
            } else {
                1
            };
            let message = caps["message"].trim();

            match &caps["severity"] {
                "note" => None,
                "warning" => Some(Diagnostic::warning(line, message)),
                _ => Some(Diagnostic::error(line, message)),
            }
        })
        .collect()
}

/// Diagnostics from a link step. The linker knows no source lines, so every
/// message lands on line 1.
pub fn parse_linker_output(stderr: &str) -> Vec<Diagnostic> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        // "in function `main':" style context lines and the collect2 summary
        .filter(|line| !line.ends_with(':') && !line.contains("ld returned"))
        .map(|line| {
            let message = match line.rfind("): ") {
                Some(at) => &line[at + 3..],
                None => line.rsplit_once("ld: ").map_or(line, |(_, rest)| rest),
            };
            match message.strip_prefix("warning: ") {
                Some(warning) => Diagnostic::warning(1, warning),
                None => Diagnostic::error(1, message.strip_prefix("error: ").unwrap_or(message)),
            }
        })
        .collect()
}

/// First meaningful line of toolchain output, for failures that produced no
/// parsable diagnostic.
pub fn summary_line(stderr: &str) -> Option<&str> {
    stderr.lines().map(str::trim).find(|line| !line.is_empty())
}
