//! Gate deciding which server commands may be executed.
//!
//! Server commands run through a shell, so before anything is spawned each
//! command is checked against a `CommandPolicy`. The shipped policy inspects
//! the executable of every compound segment (`cd web && npm start`) and
//! rejects anything outside its allowlist. It never looks at arguments: it is
//! a coarse gate against wrapping unrelated binaries, not a shell sandbox.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

/// Executables permitted when no allowlist is configured.
pub const DEFAULT_ALLOWED: &[&str] = &[
    // Node.js package managers
    "npm",
    "npx",
    "pnpm",
    "yarn",
    "bun",
    // Python
    "python",
    "python3",
    "uvicorn",
    "gunicorn",
    "flask",
    // JavaScript runtimes
    "node",
    "deno",
    // Other languages
    "cargo",
    "go",
    "ruby",
    "php",
    // Containers
    "docker",
    "docker-compose",
    // Build tools
    "make",
    "just",
    // Directory change in compound commands
    "cd",
];

/// Decides whether a command string is safe to hand to the shell.
pub trait CommandPolicy: Send + Sync {
    fn is_allowed(&self, command: &str) -> bool;

    /// Human-readable summary used when a command is rejected.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Allows a command only when every segment starts with a known executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistPolicy {
    allowed: BTreeSet<String>,
}

impl AllowlistPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Extends the allowlist with additional executable names.
    pub fn with_additional<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(extra.into_iter().map(Into::into));
        self
    }

    pub fn allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

impl Default for AllowlistPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED.iter().copied())
    }
}

impl CommandPolicy for AllowlistPolicy {
    fn is_allowed(&self, command: &str) -> bool {
        executables(command)
            .map(|names| names.iter().all(|name| self.allowed.contains(name)))
            .unwrap_or(false)
    }

    fn describe(&self) -> Option<String> {
        let names: Vec<&str> = self.allowed().collect();
        Some(format!("allowed executables: {}", names.join(", ")))
    }
}

/// Extracts the executable of every `&&`/`;` separated segment.
///
/// Returns `None` when a segment cannot be tokenized (unbalanced quotes).
pub fn executables(command: &str) -> Option<Vec<String>> {
    let mut names = Vec::new();
    for segment in segment_regex().split(command) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let tokens = shell_words::split(segment).ok()?;
        if let Some(first) = tokens.into_iter().next() {
            names.push(first);
        }
    }
    Some(names)
}

fn segment_regex() -> &'static Regex {
    static SEGMENTS: OnceLock<Regex> = OnceLock::new();
    SEGMENTS.get_or_init(|| Regex::new(r"\s*(?:&&|;)\s*").expect("segment pattern is valid"))
}
