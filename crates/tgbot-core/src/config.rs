// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the bot service
//!
//! One YAML document. Every section defaults so a missing file or a missing
//! section degrades to a runnable (if locked-down) configuration. The
//! whitelist lives inside the main document and is rewritten atomically when
//! admin commands mutate it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub tmux: TmuxConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub command_policy: CommandPolicyConfig,
    pub auth: AuthPolicyConfig,
    pub edit: EditConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
    pub audit: AuditConfig,

    /// Per-user access keys.
    pub whitelist_keys: BTreeMap<String, WhitelistEntry>,

    /// Shared token keys, newest first. Rotated with a grace window.
    pub token_keys: Vec<TokenKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub use_webhook: bool,
    pub webhook_url: String,
    pub listen_host: String,
    pub listen_port: u16,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            use_webhook: false,
            webhook_url: String::new(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    pub width: u16,
    pub height: u16,
    /// Scrollback lines fetched per capture.
    pub scrollback: u32,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
            scrollback: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_path: PathBuf,
    pub tag_registry_path: PathBuf,
    pub prompt_rules_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/user_state.json"),
            tag_registry_path: PathBuf::from("data/tag_registry.json"),
            prompt_rules_path: PathBuf::from("prompt_rules.yaml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set.
    pub level: String,
    /// Optional log file; empty means stdout.
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPolicyConfig {
    pub max_length: usize,
    pub blocked_patterns: Vec<String>,
    pub allowed_patterns: Vec<String>,
    pub require_allowlist: bool,
}

impl Default for CommandPolicyConfig {
    fn default() -> Self {
        Self {
            max_length: 1000,
            blocked_patterns: Vec::new(),
            allowed_patterns: Vec::new(),
            require_allowlist: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPolicyConfig {
    pub max_failures: u32,
    pub failure_window_seconds: u64,
    pub lockout_seconds: u64,
    /// How long rotated-out token keys stay valid.
    pub rotation_grace_seconds: u64,
}

impl Default for AuthPolicyConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            failure_window_seconds: 300,
            lockout_seconds: 900,
            rotation_grace_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    pub page_size: usize,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Trailing lines emitted when a capture is not an extension of the
    /// previous one (pane scrolled).
    pub fallback_lines: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { fallback_lines: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_chars: usize,
    pub max_bytes: usize,
    pub max_line_length: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chars: 4000,
            max_bytes: 4096,
            max_line_length: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backups: u32,
    /// Commands longer than this are truncated in audit records.
    pub truncate_length: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logs/audit.log"),
            max_bytes: 5 * 1024 * 1024,
            backups: 3,
            truncate_length: 200,
        }
    }
}

/// A per-user whitelist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub admin: bool,
}

impl WhitelistEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// A shared token key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenKey {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Rewrite the configuration atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_yaml::to_string(self)?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(config.tmux.width, 80);
        assert_eq!(config.auth.max_failures, 5);
        assert!(config.whitelist_keys.is_empty());
    }

    #[test]
    fn roundtrip_preserves_whitelist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = AppConfig::default();
        config.whitelist_keys.insert(
            "42".to_string(),
            WhitelistEntry {
                access_key: "k".to_string(),
                server_ip: Some("1.2.3.4".to_string()),
                expires_at: None,
                admin: true,
            },
        );
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        let entry = loaded.whitelist_keys.get("42").unwrap();
        assert_eq!(entry.access_key, "k");
        assert_eq!(entry.server_ip.as_deref(), Some("1.2.3.4"));
        assert!(entry.admin);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "tmux:\n  width: 120\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.tmux.width, 120);
        assert_eq!(config.tmux.height, 24);
        assert_eq!(config.transport.max_bytes, 4096);
    }
}
