//! Structured outcome of an orchestration run.
//!
//! `OrchestrationResult` is produced once per run. Besides the exit code it
//! names the failure (if any) and the server it concerns, every server's final
//! state, and each cleanup problem, so callers never have to parse log output.

use std::error::Error as StdError;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::LaunchError;
use crate::output::LogLine;
use crate::process::{ServerProcess, ServerSpec, ServerState};

/// Exit codes used when the run itself fails rather than the target command.
pub mod exit_code {
    /// Malformed invocation or rejected server command.
    pub const USAGE: i32 = 1;
    /// A server did not accept connections in time.
    pub const READINESS_TIMEOUT: i32 = 124;
    /// A server could not be spawned at all.
    pub const LAUNCH_FAILED: i32 = 125;
    /// The target command exists but could not be started.
    pub const TARGET_NOT_EXECUTABLE: i32 = 126;
    /// The target command was not found.
    pub const TARGET_NOT_FOUND: i32 = 127;
}

/// Output lines attached to a failing server's report.
const FAILURE_TAIL_LINES: usize = 20;

/// Category of the failure that ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad arguments or config file.
    Configuration,
    /// A server command was rejected by the command policy.
    Validation,
    /// A server never accepted a connection.
    ReadinessTimeout,
    /// A server process could not be spawned.
    Spawn,
    /// The target command could not be started.
    TargetSpawn,
    /// An operator signal stopped the run.
    Interrupted,
    /// A server record went through an illegal state transition.
    Internal,
}

/// Identifies a server by its position in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerRef {
    /// Zero-based position among the configured servers.
    pub index: usize,
    /// The server command as given.
    pub command: String,
    /// Port probed for readiness.
    pub port: u16,
}

impl ServerRef {
    pub fn new(index: usize, spec: &ServerSpec) -> Self {
        Self {
            index,
            command: spec.command().to_string(),
            port: spec.port(),
        }
    }
}

/// Why a run did not end with the target's own exit code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Human-readable message including the error's causes.
    pub message: String,
    /// The server the failure concerns, if it concerns one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerRef>,
}

impl Failure {
    pub fn from_error(err: &LaunchError, specs: &[ServerSpec]) -> Self {
        let server = err
            .server_index()
            .and_then(|index| specs.get(index).map(|spec| ServerRef::new(index, spec)));
        Self {
            kind: err.kind(),
            message: error_chain(err),
            server,
        }
    }
}

/// A server that could not be stopped cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    pub server: ServerRef,
    /// What went wrong while stopping it.
    pub message: String,
}

/// Final view of one server after cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerReport {
    pub server: ServerRef,
    /// Lifecycle state the server ended in.
    pub state: ServerState,
    /// Process id, if the server was ever spawned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Last captured output lines; only filled for the failed server.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_tail: Vec<LogLine>,
}

impl ServerReport {
    /// Snapshots a server record; output is attached only for failed servers.
    pub fn capture(index: usize, process: &ServerProcess, failed: bool) -> Self {
        let output_tail = match (&process.handle, failed) {
            (Some(handle), true) => handle.output().tail(FAILURE_TAIL_LINES),
            _ => Vec::new(),
        };
        Self {
            server: ServerRef::new(index, &process.spec),
            state: process.state(),
            pid: process.handle.as_ref().and_then(|h| h.pid()),
            output_tail,
        }
    }
}

/// Everything a caller needs to know about a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestrationResult {
    /// Code serverack exits with.
    pub exit_code: i32,
    /// Set when the run failed rather than the target command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// One entry per configured server, in input order.
    pub servers: Vec<ServerReport>,
    /// Problems met while stopping servers; they never change `exit_code`.
    pub warnings: Vec<CleanupWarning>,
}

impl OrchestrationResult {
    /// A run that failed before any server was touched.
    pub fn rejected(err: &LaunchError, specs: &[ServerSpec]) -> Self {
        Self {
            exit_code: err.exit_code(),
            failure: Some(Failure::from_error(err, specs)),
            servers: specs
                .iter()
                .enumerate()
                .map(|(index, spec)| ServerReport {
                    server: ServerRef::new(index, spec),
                    state: ServerState::Pending,
                    pid: None,
                    output_tail: Vec::new(),
                })
                .collect(),
            warnings: Vec::new(),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Writes the result as pretty JSON to `path`, or to stderr for `-`.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to encode report")?;
        if path == Path::new("-") {
            let mut stderr = std::io::stderr().lock();
            writeln!(stderr, "{}", json)?;
            return Ok(());
        }
        std::fs::write(path, json + "\n")
            .with_context(|| format!("failed to write report {}", path.display()))
    }
}

fn error_chain(err: &LaunchError) -> String {
    let mut message = err.to_string();
    let mut source = StdError::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_run_reports_affected_server() {
        let specs = vec![
            ServerSpec::new("npm start", 3000).unwrap(),
            ServerSpec::new("rm -rf / && npm start", 3001).unwrap(),
        ];
        let err = LaunchError::Validation {
            index: 1,
            command: specs[1].command().to_string(),
        };
        let result = OrchestrationResult::rejected(&err, &specs);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.failure_kind(), Some(FailureKind::Validation));
        let failure = result.failure.as_ref().unwrap();
        assert_eq!(failure.server.as_ref().unwrap().port, 3001);
        assert!(result
            .servers
            .iter()
            .all(|s| s.state == ServerState::Pending));
    }

    #[test]
    fn json_report_uses_snake_case_kinds() {
        let specs = vec![ServerSpec::new("npm start", 3000).unwrap()];
        let err = LaunchError::ReadinessTimeout {
            index: 0,
            port: 3000,
            timeout: std::time::Duration::from_secs(30),
        };
        let result = OrchestrationResult::rejected(&err, &specs);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["exit_code"], 124);
        assert_eq!(json["failure"]["kind"], "readiness_timeout");
        assert_eq!(json["failure"]["server"]["command"], "npm start");
        assert_eq!(json["servers"][0]["state"], "pending");
        assert!(json["servers"][0].get("pid").is_none());
    }

    #[test]
    fn error_chain_includes_io_source() {
        let err = LaunchError::TargetSpawn {
            program: "missing-binary".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        };
        let failure = Failure::from_error(&err, &[]);
        assert_eq!(failure.kind, FailureKind::TargetSpawn);
        assert_eq!(
            failure.message,
            "failed to run missing-binary: No such file or directory"
        );
        assert!(failure.server.is_none());
    }
}
