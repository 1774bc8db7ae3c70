// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! tmux-backed driver implementation
//!
//! Every operation shells out to the tmux command-line interface with a hard
//! timeout. Stderr from a failing invocation is inspected to distinguish a
//! missing session from a genuine driver fault.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    normalize_capture, session_name, ControlKey, DriverError, PaneGeometry, Result,
    TerminalDriver, DEFAULT_COMMAND_TIMEOUT,
};

/// Driver backed by the external `tmux` binary.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    tmux_cmd: String,
    geometry: PaneGeometry,
    timeout: Duration,
}

impl TmuxDriver {
    pub fn new(geometry: PaneGeometry) -> Self {
        Self {
            tmux_cmd: "tmux".to_string(),
            geometry,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the tmux binary, e.g. for a PATH-less environment.
    pub fn with_command(mut self, tmux_cmd: impl Into<String>) -> Self {
        self.tmux_cmd = tmux_cmd.into();
        self
    }

    /// Whether the tmux binary is runnable at all.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.tmux_cmd)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a tmux subcommand and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let label = args.first().copied().unwrap_or("<empty>").to_string();
        let future = Command::new(&self.tmux_cmd).args(args).output();
        let output = match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    DriverError::NotAvailable
                } else {
                    DriverError::Io(e)
                }
            })?,
            Err(_) => {
                warn!(command = %label, timeout = ?self.timeout, "tmux invocation timed out");
                return Err(DriverError::Timeout(label));
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("can't find session")
            || stderr.contains("session not found")
            || stderr.contains("no server running")
        {
            // The caller maps the target back to its tab id.
            return Err(DriverError::SessionMissing(String::new()));
        }
        Err(DriverError::Fault {
            command: label,
            stderr,
        })
    }

    /// Rewrite an anonymous `SessionMissing` with the offending tab id.
    fn tag_missing(err: DriverError, tab_id: &str) -> DriverError {
        match err {
            DriverError::SessionMissing(_) => DriverError::SessionMissing(tab_id.to_string()),
            other => other,
        }
    }

    /// Resize every window and pane so captures have a stable shape.
    async fn apply_geometry(&self, session: &str) -> Result<()> {
        let width = self.geometry.width.to_string();
        let height = self.geometry.height.to_string();
        let windows = self
            .run(&["list-windows", "-t", session, "-F", "#{window_id}"])
            .await?;
        for window in windows.lines().filter(|l| !l.trim().is_empty()) {
            self.run(&["resize-window", "-t", window, "-x", &width, "-y", &height])
                .await?;
        }
        let panes = self.run(&["list-panes", "-t", session, "-F", "#{pane_id}"]).await?;
        for pane in panes.lines().filter(|l| !l.trim().is_empty()) {
            self.run(&["resize-pane", "-t", pane, "-x", &width, "-y", &height])
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TerminalDriver for TmuxDriver {
    async fn create_session(&self, tab_id: &str) -> Result<()> {
        let session = session_name(tab_id);
        if self.has_session(tab_id).await? {
            debug!(%session, "session already exists, reapplying geometry");
            return self.apply_geometry(&session).await;
        }
        self.run(&[
            "new-session",
            "-d",
            "-s",
            &session,
            "-x",
            &self.geometry.width.to_string(),
            "-y",
            &self.geometry.height.to_string(),
        ])
        .await
        .map_err(|e| Self::tag_missing(e, tab_id))?;
        self.apply_geometry(&session).await
    }

    async fn has_session(&self, tab_id: &str) -> Result<bool> {
        let session = session_name(tab_id);
        let status = Command::new(&self.tmux_cmd)
            .args(["has-session", "-t", &session])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn kill_session(&self, tab_id: &str) -> Result<()> {
        let session = session_name(tab_id);
        match self.run(&["kill-session", "-t", &session]).await {
            Ok(_) => Ok(()),
            // kill of a missing session is a success
            Err(DriverError::SessionMissing(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        match self.run(&["list-sessions", "-F", "#{session_name}"]).await {
            Ok(output) => Ok(output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            // No server means no sessions, not an error.
            Err(DriverError::SessionMissing(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn send_text(&self, tab_id: &str, text: &str) -> Result<()> {
        let session = session_name(tab_id);
        self.run(&["send-keys", "-t", &session, text, "Enter"])
            .await
            .map(|_| ())
            .map_err(|e| Self::tag_missing(e, tab_id))
    }

    async fn send_key(&self, tab_id: &str, key: ControlKey) -> Result<()> {
        let session = session_name(tab_id);
        self.run(&["send-keys", "-t", &session, key.token()])
            .await
            .map(|_| ())
            .map_err(|e| Self::tag_missing(e, tab_id))
    }

    async fn capture(&self, tab_id: &str, scrollback_lines: u32) -> Result<String> {
        let session = session_name(tab_id);
        let start = format!("-{scrollback_lines}");
        let raw = self
            .run(&["capture-pane", "-p", "-S", &start, "-t", &session])
            .await
            .map_err(|e| Self::tag_missing(e, tab_id))?;
        Ok(normalize_capture(&raw))
    }

    async fn current_dir(&self, tab_id: &str) -> Result<PathBuf> {
        let session = session_name(tab_id);
        let output = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                &session,
                "#{pane_current_path}",
            ])
            .await
            .map_err(|e| Self::tag_missing(e, tab_id))?;
        Ok(PathBuf::from(output.trim()))
    }
}
