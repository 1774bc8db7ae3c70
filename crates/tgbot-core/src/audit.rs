// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Audit log
//!
//! Append-only, newline-delimited JSON records of dispatched commands,
//! rotated by size. Writes are best-effort: a failing audit write is logged
//! and swallowed, it never fails the command that produced it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::AuditConfig;

/// One dispatched-command record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    pub command: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(user_id: &str, tab_id: Option<&str>, command: &str, outcome: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            tab_id: tab_id.map(String::from),
            command: command.to_string(),
            outcome: outcome.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Size-rotated audit sink.
pub struct AuditLog {
    config: AuditConfig,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(()),
        }
    }

    /// Append a record. Never fails; errors are logged and dropped.
    pub fn append(&self, mut record: AuditRecord) {
        if record.command.len() > self.config.truncate_length {
            let mut cut = self.config.truncate_length;
            while !record.command.is_char_boundary(cut) {
                cut -= 1;
            }
            record.command.truncate(cut);
            record.command.push_str("...");
        }
        let _guard = self.writer.lock().unwrap();
        if let Err(e) = self.write_record(&record) {
            warn!(error = %e, "audit write failed");
        }
    }

    fn write_record(&self, record: &AuditRecord) -> std::io::Result<()> {
        if let Some(parent) = self.config.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.rotate_if_needed()?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.config.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        let Ok(metadata) = fs::metadata(&self.config.path) else {
            return Ok(());
        };
        if metadata.len() < self.config.max_bytes {
            return Ok(());
        }
        // Shift audit.log.N-1 -> audit.log.N, oldest dropped.
        for index in (1..self.config.backups).rev() {
            let from = rotated_path(&self.config, index);
            if from.exists() {
                fs::rename(&from, rotated_path(&self.config, index + 1))?;
            }
        }
        if self.config.backups > 0 {
            fs::rename(&self.config.path, rotated_path(&self.config, 1))?;
        } else {
            fs::remove_file(&self.config.path)?;
        }
        Ok(())
    }
}

fn rotated_path(config: &AuditConfig, index: u32) -> std::path::PathBuf {
    let mut name = config.path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    std::path::PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_bytes: u64) -> AuditConfig {
        AuditConfig {
            path: dir.path().join("audit.log"),
            max_bytes,
            backups: 2,
            truncate_length: 10,
        }
    }

    #[test]
    fn records_are_json_lines() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(config(&dir, 1024 * 1024));
        log.append(AuditRecord::new("42", Some("tab-1"), "ls -la", "sent"));
        let contents = fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let value: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(value["user_id"], "42");
        assert_eq!(value["command"], "ls -la");
        assert_eq!(value["outcome"], "sent");
    }

    #[test]
    fn long_commands_are_truncated() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(config(&dir, 1024 * 1024));
        log.append(AuditRecord::new("42", None, &"x".repeat(50), "sent"));
        let contents = fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let value: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(value["command"], format!("{}...", "x".repeat(10)));
    }

    #[test]
    fn rotation_keeps_bounded_files() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(config(&dir, 64));
        for i in 0..20 {
            log.append(AuditRecord::new("42", None, &format!("cmd-{i}"), "sent"));
        }
        let rotated: PathBuf = dir.path().join("audit.log.1");
        assert!(rotated.exists());
        assert!(!dir.path().join("audit.log.3").exists());
    }

    #[test]
    fn write_failure_does_not_panic() {
        let log = AuditLog::new(AuditConfig {
            path: PathBuf::from("/proc/definitely/not/writable/audit.log"),
            ..Default::default()
        });
        log.append(AuditRecord::new("42", None, "ls", "sent"));
    }
}
