//! Server process spawning and termination.
//!
//! `ProcessSupervisor` starts server commands through the platform shell in a
//! process group of their own, drains their output into an `OutputCapture`,
//! and stops them again: a graceful signal first, a forced kill once the grace
//! period runs out, and always a confirmed reap before returning.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::debug;

use crate::error::LaunchError;
use crate::output::{read_stream, OutputCapture, StreamKind, DEFAULT_MAX_LINES};
use crate::process::ServerSpec;
use crate::signal::ProcessSignal;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A spawned server process.
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    pid: Option<u32>,
    output: OutputCapture,
}

impl ServerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output(&self) -> &OutputCapture {
        &self.output
    }

    /// Kills the process group without waiting for the exit.
    ///
    /// Used where awaiting is impossible; tokio reaps the child in the background.
    pub fn force_kill(&mut self) {
        if let Some(pid) = self.pid {
            kill_group(pid);
        }
        let _ = self.child.start_kill();
    }
}

/// How a server ended when it was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had exited before termination was requested.
    AlreadyExited { code: Option<i32> },
    /// The process exited within the grace period.
    Graceful { code: Option<i32> },
    /// The grace period elapsed and the process was killed.
    Killed,
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    max_output_lines: usize,
}

impl ProcessSupervisor {
    pub fn new(max_output_lines: usize) -> Self {
        Self { max_output_lines }
    }

    /// Starts the server command through the shell.
    ///
    /// Must only be called for commands that passed the command policy.
    pub fn spawn(&self, index: usize, spec: &ServerSpec) -> Result<ServerHandle, LaunchError> {
        let mut command = shell_command(spec.command());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            index,
            command: spec.command().to_string(),
            source,
        })?;
        let pid = child.id();
        debug!(pid, command = spec.command(), "spawned server");

        let output = OutputCapture::new(self.max_output_lines);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(StreamKind::Stdout, stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(StreamKind::Stderr, stderr, output.clone()));
        }

        Ok(ServerHandle { child, pid, output })
    }

    /// Stops the server, escalating to a kill after `grace`.
    ///
    /// SIGTERM goes to the whole process group, and the stop counts as graceful
    /// only if every member of the group is gone before the grace period ends.
    /// Returns only once the process has been reaped. Safe to call on a
    /// process that already exited.
    pub async fn terminate(
        &self,
        handle: &mut ServerHandle,
        grace: Duration,
    ) -> std::io::Result<Termination> {
        let deadline = Instant::now() + grace;
        let exited = handle.child.try_wait()?;
        let lingering = handle.pid.map_or(false, group_alive);
        if let Some(status) = exited {
            if !lingering {
                return Ok(Termination::AlreadyExited {
                    code: status.code(),
                });
            }
        }

        if let Some(pid) = handle.pid {
            debug!(pid, "sending SIGTERM");
            send_os_signal(pid, ProcessSignal::SigTerm);
        }
        let status = match exited {
            Some(status) => Some(status),
            None => wait_for_exit(&mut handle.child, grace).await?,
        };
        if let Some(status) = status {
            if wait_for_group_exit(handle.pid, deadline).await {
                return Ok(Termination::Graceful {
                    code: status.code(),
                });
            }
            debug!(pid = handle.pid, "process group outlived the grace period");
        }

        debug!(pid = handle.pid, "grace period elapsed, killing");
        self.kill(handle).await?;
        Ok(Termination::Killed)
    }

    /// Kills the process group and waits until the server is reaped.
    pub async fn kill(&self, handle: &mut ServerHandle) -> std::io::Result<()> {
        handle.force_kill();
        handle.child.wait().await?;
        Ok(())
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::SigHup => libc::SIGHUP,
            ProcessSignal::SigQuit => libc::SIGQUIT,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGTERM/SIGINT; CTRL_BREAK is the closest console signal we can emit.
    let _ = signal;
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    unsafe {
        let _ = libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

// The child itself is killed through tokio; there is no group kill on windows.
#[cfg(windows)]
fn kill_group(_pid: u32) {}

/// Whether any process in the group led by `pid` still exists.
#[cfg(unix)]
fn group_alive(pid: u32) -> bool {
    unsafe { libc::kill(-(pid as i32), 0) == 0 }
}

#[cfg(windows)]
fn group_alive(_pid: u32) -> bool {
    false
}

// Polls until the group is empty or `deadline` passes.
async fn wait_for_group_exit(pid: Option<u32>, deadline: Instant) -> bool {
    let Some(pid) = pid else {
        return true;
    };
    loop {
        if !group_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(GROUP_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())))
            .await;
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return child.try_wait();
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

/// Whether `pid` is a live process; zombies waiting to be reaped do not count.
#[cfg(all(test, unix))]
pub(crate) fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map_or(false, |rest| !rest.trim_start().starts_with('Z')),
        Err(_) => unsafe { libc::kill(pid as i32, 0) == 0 },
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(command: &str) -> ServerSpec {
        ServerSpec::new(command, 1).unwrap()
    }

    async fn stopped(pid: u32) -> bool {
        for _ in 0..20 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn terminates_running_process_gracefully() {
        let supervisor = ProcessSupervisor::default();
        let mut handle = supervisor.spawn(0, &spec("sleep 30")).unwrap();
        let pid = handle.pid().unwrap();
        assert!(is_running(pid));

        let outcome = supervisor
            .terminate(&mut handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(outcome, Termination::Graceful { .. }));
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn escalates_to_kill_when_term_is_ignored() {
        let supervisor = ProcessSupervisor::default();
        let mut handle = supervisor
            .spawn(0, &spec("trap '' TERM; echo trapped; while true; do sleep 1; done"))
            .unwrap();
        let pid = handle.pid().unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        let outcome = supervisor
            .terminate(&mut handle, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Killed);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!is_running(pid));
    }

    #[tokio::test]
    async fn terminating_exited_process_is_a_no_op() {
        let supervisor = ProcessSupervisor::default();
        let mut handle = supervisor.spawn(0, &spec("exit 3")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = supervisor
            .terminate(&mut handle, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::AlreadyExited { code: Some(3) });

        let again = supervisor
            .terminate(&mut handle, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(again, Termination::AlreadyExited { .. }));
    }

    #[tokio::test]
    async fn captures_output_without_streaming() {
        let supervisor = ProcessSupervisor::new(10);
        let mut handle = supervisor
            .spawn(0, &spec("echo listening; echo oops >&2; sleep 30"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let lines = handle.output().tail(10);
        assert!(lines
            .iter()
            .any(|l| l.text == "listening" && l.stream == StreamKind::Stdout));
        assert!(lines
            .iter()
            .any(|l| l.text == "oops" && l.stream == StreamKind::Stderr));
        supervisor
            .terminate(&mut handle, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn group_members_that_ignore_term_are_killed() {
        let supervisor = ProcessSupervisor::default();
        let mut handle = supervisor
            .spawn(0, &spec("(trap '' TERM; sleep 30) & echo $!; sleep 30"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let background: u32 = handle
            .output()
            .tail(10)
            .iter()
            .find_map(|l| l.text.trim().parse().ok())
            .unwrap();
        assert!(is_running(background));

        let outcome = supervisor
            .terminate(&mut handle, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Killed);
        assert!(stopped(background).await, "{} survived", background);
    }

    #[tokio::test]
    async fn server_survives_invalid_utf8_output() {
        let supervisor = ProcessSupervisor::default();
        let mut handle = supervisor
            .spawn(
                0,
                &spec("printf 'boot\\377\\n'; sleep 0.5; while true; do echo tick || exit 9; sleep 0.1; done"),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(handle.child.try_wait().unwrap().is_none());
        assert!(handle.output().tail(50).iter().any(|l| l.text == "tick"));
        supervisor
            .terminate(&mut handle, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn kill_waits_for_the_process_to_be_reaped() {
        let supervisor = ProcessSupervisor::default();
        let mut handle = supervisor.spawn(0, &spec("sleep 30")).unwrap();
        let pid = handle.pid().unwrap();
        supervisor.kill(&mut handle).await.unwrap();
        assert!(handle.child.try_wait().unwrap().is_some());
        assert!(!is_running(pid));
    }
}
