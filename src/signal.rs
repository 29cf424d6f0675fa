//! Operator interruption.
//!
//! An interrupted run must still stop every server it started, so the
//! orchestrator races its work against `shutdown_signal` and falls through to
//! cleanup whichever finishes first.

use serde::Serialize;

/// Signal that asked serverack to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessSignal {
    /// Interrupt from the keyboard (Ctrl-C).
    SigInt,
    /// Termination request.
    SigTerm,
    /// The controlling terminal or session went away.
    SigHup,
    /// Quit from the keyboard (Ctrl-\).
    SigQuit,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigHup => "SIGHUP",
            ProcessSignal::SigQuit => "SIGQUIT",
        }
    }

    /// Conventional signal number, used for the `128 + n` exit code.
    pub fn number(self) -> i32 {
        match self {
            ProcessSignal::SigHup => 1,
            ProcessSignal::SigInt => 2,
            ProcessSignal::SigQuit => 3,
            ProcessSignal::SigTerm => 15,
        }
    }
}

/// Resolves once the process receives Ctrl-C, SIGTERM, SIGHUP or SIGQUIT.
///
/// A handler that cannot be installed never fires; the run then only ends
/// through the remaining signals or its own completion.
#[cfg(unix)]
pub async fn shutdown_signal() -> ProcessSignal {
    use tokio::signal::unix::SignalKind;
    tokio::select! {
        signal = ctrl_c_or_pending() => signal,
        signal = unix_signal(SignalKind::terminate(), ProcessSignal::SigTerm) => signal,
        signal = unix_signal(SignalKind::hangup(), ProcessSignal::SigHup) => signal,
        signal = unix_signal(SignalKind::quit(), ProcessSignal::SigQuit) => signal,
    }
}

/// Resolves once the process receives Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> ProcessSignal {
    ctrl_c_or_pending().await
}

async fn ctrl_c_or_pending() -> ProcessSignal {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    ProcessSignal::SigInt
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind, signal: ProcessSignal) -> ProcessSignal {
    match tokio::signal::unix::signal(kind) {
        Ok(mut stream) => {
            if stream.recv().await.is_some() {
                tracing::debug!(signal = signal.label(), "received signal");
                return signal;
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to install {} handler", signal.label());
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_signal_numbers() {
        let codes: Vec<i32> = [
            ProcessSignal::SigHup,
            ProcessSignal::SigInt,
            ProcessSignal::SigQuit,
            ProcessSignal::SigTerm,
        ]
        .iter()
        .map(|signal| 128 + signal.number())
        .collect();
        assert_eq!(codes, vec![129, 130, 131, 143]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hangup_requests_shutdown() {
        use std::time::Duration;

        let waiter = tokio::spawn(shutdown_signal());
        // Give the task a chance to install its handlers before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        unsafe {
            libc::kill(libc::getpid(), libc::SIGHUP);
        }
        let signal = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ProcessSignal::SigHup);
    }
}
