//! Data structures for tracking server state.
//!
//! This module defines what to launch (`ServerSpec`), where a launched server
//! is in its lifecycle (`ServerState`), and the per-run record tying the two
//! together with the live process handle (`ServerProcess`).

use serde::Serialize;

use crate::error::LaunchError;
use crate::supervisor::ServerHandle;

/// A launch command paired with the port it is expected to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSpec {
    command: String,
    port: u16,
}

impl ServerSpec {
    pub fn new(command: impl Into<String>, port: u16) -> Result<Self, LaunchError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(LaunchError::Configuration("server command is empty".into()));
        }
        if port == 0 {
            return Err(LaunchError::Configuration(format!(
                "port for `{}` must be greater than 0",
                command
            )));
        }
        Ok(Self { command, port })
    }

    /// Pairs server commands with ports positionally.
    pub fn pair(commands: &[String], ports: &[u16]) -> Result<Vec<Self>, LaunchError> {
        if commands.len() != ports.len() {
            return Err(LaunchError::Configuration(format!(
                "number of --server ({}) and --port ({}) arguments must match",
                commands.len(),
                ports.len()
            )));
        }
        commands
            .iter()
            .zip(ports)
            .map(|(command, port)| Self::new(command.clone(), *port))
            .collect()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Lifecycle of a server within one run.
///
/// `Pending -> Starting -> {Ready | Failed} -> Terminated`; `Terminated` is
/// reachable from every state except `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Pending,
    Starting,
    Ready,
    Failed,
    Terminated,
}

impl ServerState {
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Terminated)
                | (Ready, Terminated)
                | (Failed, Terminated)
        )
    }

    /// Whether the server was ever spawned and therefore needs cleanup.
    pub fn was_started(self) -> bool {
        !matches!(self, ServerState::Pending)
    }
}

/// Runtime record of a single server, private to one orchestration run.
#[derive(Debug)]
pub struct ServerProcess {
    pub spec: ServerSpec,
    pub handle: Option<ServerHandle>,
    state: ServerState,
}

impl ServerProcess {
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            handle: None,
            state: ServerState::Pending,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn transition(&mut self, next: ServerState) -> Result<(), LaunchError> {
        if !self.state.can_transition_to(next) {
            return Err(LaunchError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
