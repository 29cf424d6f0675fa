//! End-to-end orchestration of one run.
//!
//! The orchestrator validates every server command, starts the servers one by
//! one (each must accept TCP connections before the next is started), runs the
//! target command in the foreground, and then stops every server it started.
//! Cleanup happens on every exit path: normal completion, a failed startup,
//! operator interruption, and (through `ServerGuard`'s `Drop`) unwinding.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::error::LaunchError;
use crate::policy::CommandPolicy;
use crate::probe::ReadinessProbe;
use crate::process::{ServerProcess, ServerSpec, ServerState};
use crate::report::{CleanupWarning, Failure, OrchestrationResult, ServerRef, ServerReport};
use crate::signal::{shutdown_signal, ProcessSignal};
use crate::supervisor::{ProcessSupervisor, Termination, DEFAULT_GRACE_PERIOD};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Host the readiness probe connects to.
    pub host: String,
    /// Time a server gets to exit after SIGTERM before it is killed.
    pub grace_period: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

pub struct Orchestrator<P> {
    policy: P,
    supervisor: ProcessSupervisor,
    probe: ReadinessProbe,
    options: OrchestratorOptions,
}

impl<P: CommandPolicy> Orchestrator<P> {
    pub fn new(
        policy: P,
        supervisor: ProcessSupervisor,
        probe: ReadinessProbe,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            policy,
            supervisor,
            probe,
            options,
        }
    }

    /// Runs the servers and target command, stopping early on any `shutdown_signal`.
    pub async fn run(
        &self,
        specs: &[ServerSpec],
        target: &[String],
        per_server_timeout: Duration,
    ) -> OrchestrationResult {
        self.run_until(specs, target, per_server_timeout, shutdown_signal())
            .await
    }

    /// Like `run`, but interrupted when `interrupt` resolves instead of on OS signals.
    pub async fn run_until<F>(
        &self,
        specs: &[ServerSpec],
        target: &[String],
        per_server_timeout: Duration,
        interrupt: F,
    ) -> OrchestrationResult
    where
        F: Future<Output = ProcessSignal>,
    {
        if let Err(err) = self.preflight(specs, target) {
            error!("{}", err);
            return OrchestrationResult::rejected(&err, specs);
        }

        let mut guard = ServerGuard::new(specs);
        let outcome = tokio::select! {
            outcome = self.start_and_run(&mut guard, target, per_server_timeout) => outcome,
            signal = interrupt => Err(LaunchError::Interrupted { signal }),
        };
        let warnings = self.cleanup(&mut guard).await;
        finish(&guard, outcome, warnings, specs)
    }

    // Rejects the whole run before anything is spawned.
    fn preflight(&self, specs: &[ServerSpec], target: &[String]) -> Result<(), LaunchError> {
        if specs.is_empty() {
            return Err(LaunchError::Configuration("no servers specified".into()));
        }
        if target.is_empty() {
            return Err(LaunchError::Configuration(
                "no command specified to run".into(),
            ));
        }
        for (index, spec) in specs.iter().enumerate() {
            if !self.policy.is_allowed(spec.command()) {
                if let Some(description) = self.policy.describe() {
                    info!("{}", description);
                }
                return Err(LaunchError::Validation {
                    index,
                    command: spec.command().to_string(),
                });
            }
        }
        Ok(())
    }

    async fn start_and_run(
        &self,
        guard: &mut ServerGuard,
        target: &[String],
        per_server_timeout: Duration,
    ) -> Result<i32, LaunchError> {
        let total = guard.servers.len();
        for (index, server) in guard.servers.iter_mut().enumerate() {
            let port = server.spec.port();
            info!("starting server {}/{}: {}", index + 1, total, server.spec.command());
            let handle = self.supervisor.spawn(index, &server.spec)?;
            server.handle = Some(handle);
            server.transition(ServerState::Starting)?;

            info!("waiting for server on port {}...", port);
            if !self
                .probe
                .wait_ready(&self.options.host, port, per_server_timeout)
                .await
            {
                server.transition(ServerState::Failed)?;
                return Err(LaunchError::ReadinessTimeout {
                    index,
                    port,
                    timeout: per_server_timeout,
                });
            }
            server.transition(ServerState::Ready)?;
            info!("server ready on port {}", port);
        }

        info!("all {} server(s) ready", total);
        run_target(target).await
    }

    // Terminates every spawned server, collecting problems instead of stopping at them.
    async fn cleanup(&self, guard: &mut ServerGuard) -> Vec<CleanupWarning> {
        let mut warnings = Vec::new();
        let started = guard.servers.iter().filter(|s| s.handle.is_some()).count();
        if started == 0 {
            return warnings;
        }

        info!("stopping {} server(s)...", started);
        let grace = self.options.grace_period;
        for (index, server) in guard.servers.iter_mut().enumerate() {
            let state = server.state();
            if !state.was_started() || state == ServerState::Terminated {
                continue;
            }
            let server_ref = ServerRef::new(index, &server.spec);
            let Some(handle) = server.handle.as_mut() else {
                continue;
            };
            match self.supervisor.terminate(handle, grace).await {
                Ok(Termination::Killed) => {
                    let message = format!(
                        "did not exit within {}ms of SIGTERM and was killed",
                        grace.as_millis()
                    );
                    warn!(port = server_ref.port, "server {} {}", index + 1, message);
                    warnings.push(CleanupWarning {
                        server: server_ref,
                        message,
                    });
                }
                Ok(Termination::AlreadyExited { code }) => {
                    info!(?code, "server {} had already exited", index + 1);
                }
                Ok(Termination::Graceful { .. }) => info!("server {} stopped", index + 1),
                Err(err) => {
                    let killed = self.supervisor.kill(handle).await;
                    let message = match &killed {
                        Ok(()) => format!("could not be stopped gracefully ({}) and was killed", err),
                        Err(kill_err) => format!(
                            "could not be stopped ({}); kill not confirmed: {}",
                            err, kill_err
                        ),
                    };
                    warn!(port = server_ref.port, "server {} {}", index + 1, message);
                    warnings.push(CleanupWarning {
                        server: server_ref,
                        message,
                    });
                    // Left un-terminated so the guard retries the kill on drop.
                    if killed.is_err() {
                        continue;
                    }
                }
            }
            if let Err(err) = server.transition(ServerState::Terminated) {
                warn!("{}", err);
            }
        }
        info!("all servers stopped");
        warnings
    }
}

/// Owns the server records of one run.
///
/// Any server still running when the guard is dropped is killed on the spot,
/// covering paths where the async cleanup never got to run.
struct ServerGuard {
    servers: Vec<ServerProcess>,
}

impl ServerGuard {
    fn new(specs: &[ServerSpec]) -> Self {
        Self {
            servers: specs.iter().cloned().map(ServerProcess::new).collect(),
        }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        for server in &mut self.servers {
            if server.state() == ServerState::Terminated {
                continue;
            }
            if let Some(handle) = server.handle.as_mut() {
                warn!(pid = handle.pid(), "killing server left running");
                handle.force_kill();
            }
        }
    }
}

fn finish(
    guard: &ServerGuard,
    outcome: Result<i32, LaunchError>,
    warnings: Vec<CleanupWarning>,
    specs: &[ServerSpec],
) -> OrchestrationResult {
    let (exit_code, failure) = match outcome {
        Ok(code) => (code, None),
        Err(err) => {
            error!("{}", err);
            (err.exit_code(), Some(Failure::from_error(&err, specs)))
        }
    };
    let failed_index = failure
        .as_ref()
        .and_then(|f| f.server.as_ref())
        .map(|s| s.index);

    let servers: Vec<ServerReport> = guard
        .servers
        .iter()
        .enumerate()
        .map(|(index, process)| ServerReport::capture(index, process, failed_index == Some(index)))
        .collect();
    if let Some(report) = failed_index.and_then(|index| servers.get(index)) {
        if !report.output_tail.is_empty() {
            warn!("last output from server {}:", report.server.index + 1);
            for line in &report.output_tail {
                warn!("  | {}", line.text);
            }
        }
    }

    OrchestrationResult {
        exit_code,
        failure,
        servers,
        warnings,
    }
}

async fn run_target(target: &[String]) -> Result<i32, LaunchError> {
    let Some((program, args)) = target.split_first() else {
        return Err(LaunchError::Configuration(
            "no command specified to run".into(),
        ));
    };
    info!("running: {}", shell_words::join(target));
    let status = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| LaunchError::TargetSpawn {
            program: program.clone(),
            source,
        })?;
    Ok(exit_status_code(status))
}

#[cfg(unix)]
fn exit_status_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
