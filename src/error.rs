//! Error taxonomy for an orchestration run.
//!
//! Every fatal condition maps onto a `FailureKind` for the structured report and
//! onto the process exit code that `serverack` terminates with.

use std::time::Duration;

use thiserror::Error;

use crate::process::ServerState;
use crate::report::{exit_code, FailureKind};
use crate::signal::ProcessSignal;

#[derive(Debug, Error)]
pub enum LaunchError {
    /// Malformed invocation, reported before any process is touched.
    #[error("{0}")]
    Configuration(String),

    /// A server command's executable is not permitted by the command policy.
    #[error("command contains disallowed executable: {command}")]
    Validation { index: usize, command: String },

    #[error("server {} failed to start on port {port} within {}s", .index + 1, .timeout.as_secs_f64())]
    ReadinessTimeout {
        index: usize,
        port: u16,
        timeout: Duration,
    },

    #[error("failed to spawn server {}: {command}", .index + 1)]
    Spawn {
        index: usize,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {program}")]
    TargetSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("received {}, shutting down", .signal.label())]
    Interrupted { signal: ProcessSignal },

    #[error("illegal state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ServerState, to: ServerState },
}

impl LaunchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Validation { .. } => FailureKind::Validation,
            Self::ReadinessTimeout { .. } => FailureKind::ReadinessTimeout,
            Self::Spawn { .. } => FailureKind::Spawn,
            Self::TargetSpawn { .. } => FailureKind::TargetSpawn,
            Self::Interrupted { .. } => FailureKind::Interrupted,
            Self::InvalidTransition { .. } => FailureKind::Internal,
        }
    }

    /// The exit code a run that failed with this error terminates with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Validation { .. } => exit_code::USAGE,
            Self::ReadinessTimeout { .. } => exit_code::READINESS_TIMEOUT,
            Self::Spawn { .. } | Self::InvalidTransition { .. } => exit_code::LAUNCH_FAILED,
            Self::TargetSpawn { source, .. } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    exit_code::TARGET_NOT_FOUND
                } else {
                    exit_code::TARGET_NOT_EXECUTABLE
                }
            }
            Self::Interrupted { signal } => 128 + signal.number(),
        }
    }

    /// Index of the server the failure concerns, if any.
    pub fn server_index(&self) -> Option<usize> {
        match self {
            Self::Validation { index, .. }
            | Self::ReadinessTimeout { index, .. }
            | Self::Spawn { index, .. } => Some(*index),
            _ => None,
        }
    }
}
