//! Buffered capture of server output.
//!
//! Server stdout/stderr is drained into a bounded ring buffer (`LogBuffer`) so
//! the pipes never fill up and the last lines are available when a server
//! fails to come up. Output is not streamed live to the caller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

/// Lines kept per server when nothing else is configured.
pub const DEFAULT_MAX_LINES: usize = 200;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single line of output from a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// The line content, without its trailing newline.
    pub text: String,
    /// Whether this line came from stdout or stderr.
    pub stream: StreamKind,
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    /// Maximum number of lines to store.
    max_lines: usize,
    /// The stored log lines, oldest first.
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    /// Returns the newest `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Shared handle to a server's output buffer.
///
/// The reader tasks append, the orchestrator reads a snapshot for reports.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    buffer: Arc<Mutex<LogBuffer>>,
}

impl OutputCapture {
    pub fn new(max_lines: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(max_lines))),
        }
    }

    pub fn push(&self, text: String, stream: StreamKind) {
        // A poisoned buffer only means a reader panicked mid-push; keep the lines.
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(LogLine { text, stream });
    }

    pub fn tail(&self, count: usize) -> Vec<LogLine> {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.tail(count)
    }
}

/// Drains `reader` line by line into `capture` until EOF.
///
/// Invalid UTF-8 is replaced, never a reason to stop: once the read end closes,
/// the server's next write fails with SIGPIPE.
pub async fn read_stream<R>(stream: StreamKind, reader: R, capture: OutputCapture)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                capture.push(String::from_utf8_lossy(&buf).into_owned(), stream);
            }
            Err(err) => {
                debug!(?stream, error = %err, "stopped reading server output");
                break;
            }
        }
    }
}
