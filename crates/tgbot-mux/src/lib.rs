// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Terminal multiplexer facade
//!
//! This crate wraps the external tmux binary behind the [`TerminalDriver`]
//! trait. Session names are namespaced with the `tgbot_` prefix so the bot
//! never touches sessions it does not own. A fixed pane geometry is applied
//! at session creation to keep captures reproducible.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod testing;
pub mod tmux;

pub use tmux::TmuxDriver;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Namespace prefix for every session owned by the bot.
pub const SESSION_PREFIX: &str = "tgbot_";

/// Default hard timeout for a single tmux invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Derive the multiplexer session name for a tab.
pub fn session_name(tab_id: &str) -> String {
    format!("{SESSION_PREFIX}{tab_id}")
}

/// Errors that can occur while driving the multiplexer
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("session for tab '{0}' does not exist")]
    SessionMissing(String),

    #[error("tmux is not installed or not on PATH")]
    NotAvailable,

    #[error("tmux {command} failed: {stderr}")]
    Fault { command: String, stderr: String },

    #[error("tmux {0} timed out")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed pane geometry applied when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaneGeometry {
    pub width: u16,
    pub height: u16,
}

impl Default for PaneGeometry {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Special keys that can be sent without a trailing Enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    CtrlC,
    CtrlZ,
    Enter,
}

impl ControlKey {
    /// The tmux `send-keys` token for this key.
    pub fn token(self) -> &'static str {
        match self {
            ControlKey::CtrlC => "C-c",
            ControlKey::CtrlZ => "C-z",
            ControlKey::Enter => "Enter",
        }
    }
}

/// A shell job parsed from `jobs -l` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellJob {
    pub job_id: String,
    pub command: String,
}

/// Driver interface over a detached terminal multiplexer.
///
/// Operations are idempotent where the underlying action is idempotent:
/// killing a missing session succeeds, creating an existing session only
/// reapplies the pane geometry.
#[async_trait]
pub trait TerminalDriver: Send + Sync {
    /// Create the session backing `tab_id`, applying the configured geometry.
    async fn create_session(&self, tab_id: &str) -> Result<()>;

    async fn has_session(&self, tab_id: &str) -> Result<bool>;

    /// Kill the session backing `tab_id`. Succeeds if it is already gone.
    async fn kill_session(&self, tab_id: &str) -> Result<()>;

    /// Names of all live sessions, including ones outside our namespace.
    async fn list_sessions(&self) -> Result<Vec<String>>;

    /// Send literal text followed by Enter.
    async fn send_text(&self, tab_id: &str, text: &str) -> Result<()>;

    async fn send_key(&self, tab_id: &str, key: ControlKey) -> Result<()>;

    /// Capture the last `scrollback_lines` of pane text, normalized: line
    /// endings become LF and non-printable bytes other than newline are
    /// stripped.
    async fn capture(&self, tab_id: &str, scrollback_lines: u32) -> Result<String>;

    /// Current working directory of the session's active pane.
    async fn current_dir(&self, tab_id: &str) -> Result<PathBuf>;
}

/// Normalize raw pane output: CRLF/CR to LF, control characters dropped.
pub fn normalize_capture(raw: &str) -> String {
    let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
    unified.chars().filter(|c| *c == '\n' || !c.is_control()).collect()
}

/// Parse `jobs -l` output into job records.
///
/// Lines look like `[1]+  1234 Stopped   vim notes.txt`; anything that does
/// not start with a bracketed numeric id is skipped.
pub fn parse_jobs(output: &str) -> Vec<ShellJob> {
    let mut jobs = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some(close) = rest.find(']') else {
            continue;
        };
        let job_id = &rest[..close];
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let command = rest[close + 1..]
            .trim_start_matches(['+', '-'])
            .split_whitespace()
            .skip(2)
            .collect::<Vec<_>>()
            .join(" ");
        jobs.push(ShellJob {
            job_id: job_id.to_string(),
            command,
        });
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_prefixed() {
        assert_eq!(session_name("abc"), "tgbot_abc");
    }

    #[test]
    fn normalize_strips_control_bytes() {
        let raw = "a\r\nb\x1b[0m\tc\rd";
        assert_eq!(normalize_capture(raw), "a\nb[0mc\nd");
    }

    #[test]
    fn parse_jobs_extracts_stopped_job() {
        let output = "$ jobs -l\n[1]+  1234 Stopped                 vim notes.txt\nnoise\n";
        let jobs = parse_jobs(output);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "1");
        assert_eq!(jobs[0].command, "vim notes.txt");
    }

    #[test]
    fn parse_jobs_ignores_non_numeric_ids() {
        assert!(parse_jobs("[x] 99 Running sleep 5\n").is_empty());
    }
}
