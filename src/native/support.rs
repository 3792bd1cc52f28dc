use crate::constants::FAULT_MARKER;

/// Source of the runtime support unit linked into every artifact.
pub const SUPPORT_SOURCE: &str = include_str!("support.cpp");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StderrReport {
    /// Message of the uncaught exception, if the support unit reported one.
    pub fault: Option<String>,
    /// Everything else the program wrote to stderr.
    pub stderr: String,
}

/// Separates the support unit's fault report from the program's own stderr.
/// When several reports are present the last one wins.
pub fn split_fault_report(stderr: &str) -> StderrReport {
    let mut fault = None;
    let mut rest = String::with_capacity(stderr.len());

    for line in stderr.split_inclusive('\n') {
        match line.find(FAULT_MARKER) {
            Some(at) => {
                rest.push_str(&line[..at]);
                let message = line[at + FAULT_MARKER.len()..].trim_end_matches('\n');
                fault = Some(if message.is_empty() {
                    "Program terminated with an uncaught exception".to_string()
                } else {
                    unescape(message)
                });
            }
            None => rest.push_str(line),
        }
    }

    StderrReport {
        fault,
        stderr: rest,
    }
}

/// Reverses the escaping `report` applies in the support unit.
fn unescape(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut chars = message.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
