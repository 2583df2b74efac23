use std::time::Duration;

use thiserror::Error;

use crate::local::health::HealthCheckResult;
use crate::local::process::{ExitInfo, ServerState};

/// Failures while bringing the chat server up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to allocate a loopback port: {0}")]
    PortAllocation(#[source] std::io::Error),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server is already running (state: {state})")]
    AlreadyRunning { state: ServerState },

    #[error("server is not running")]
    NotRunning,

    #[error("server {exit} during startup{}", format_output(.output))]
    CrashDuringStartup { exit: ExitInfo, output: Vec<String> },

    #[error(
        "server did not become healthy within {elapsed:?} after {attempts} attempts (last result: {last}){}",
        format_output(.output)
    )]
    HealthCheckTimeout {
        attempts: u32,
        elapsed: Duration,
        last: HealthCheckResult,
        output: Vec<String>,
    },

    #[error("startup cancelled")]
    Cancelled,

    #[error("failed to build health check client: {0}")]
    Probe(#[source] reqwest::Error),
}

impl StartupError {
    /// Output lines captured from the server, if this error carries any.
    pub fn recent_output(&self) -> &[String] {
        match self {
            StartupError::CrashDuringStartup { output, .. }
            | StartupError::HealthCheckTimeout { output, .. } => output,
            _ => &[],
        }
    }
}

/// Section listing recent server output, empty when there is none.
pub(crate) fn format_output(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut text = String::from("\n\nRecent server output:");
    for line in lines {
        text.push_str("\n  ");
        text.push_str(line);
    }
    text
}
