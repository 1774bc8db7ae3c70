// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Authentication manager
//!
//! Validates `/login` attempts against the whitelist and the shared token
//! keys, keeps a sliding window of failures per source IP with lockout, and
//! owns the admin-rotatable whitelist. Keys never reach the log; a short
//! SHA-256 fingerprint is recorded instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{AppConfig, TokenKey, WhitelistEntry};
use crate::error::Result;

/// Why a login attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NotWhitelisted,
    IpMismatch,
    Expired,
    BadKey,
}

/// Outcome of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Granted,
    Denied(DenyReason),
    LockedOut { until: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct FailureRecord {
    attempts: Vec<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

/// Compare two byte strings without an early exit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Short fingerprint for logging a key without revealing it.
fn fingerprint(key: &str) -> String {
    if key.is_empty() {
        return "empty".to_string();
    }
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

/// Owns the whitelist, the shared token keys, and the failure ledger.
pub struct AuthManager {
    config: Mutex<AppConfig>,
    config_path: PathBuf,
    failures: Mutex<HashMap<String, FailureRecord>>,
}

impl AuthManager {
    pub fn new(config: AppConfig, config_path: impl Into<PathBuf>) -> Self {
        Self {
            config: Mutex::new(config),
            config_path: config_path.into(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a login attempt.
    pub fn login(&self, user_id: &str, claimed_ip: &str, key: &str) -> LoginOutcome {
        self.login_at(user_id, claimed_ip, key, Utc::now())
    }

    pub fn login_at(
        &self,
        user_id: &str,
        claimed_ip: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        let fp = fingerprint(key);

        if let Some(until) = self.locked_until(claimed_ip, now) {
            warn!(user_id, ip = claimed_ip, key_fp = %fp, %until, "login refused: IP locked out");
            return LoginOutcome::LockedOut { until };
        }

        let outcome = self.decide(user_id, claimed_ip, key, now);
        match &outcome {
            LoginOutcome::Granted => {
                info!(user_id, ip = claimed_ip, key_fp = %fp, "login granted");
            }
            LoginOutcome::Denied(reason) => {
                self.record_failure(claimed_ip, now);
                warn!(user_id, ip = claimed_ip, key_fp = %fp, ?reason, "login denied");
            }
            LoginOutcome::LockedOut { .. } => {}
        }
        outcome
    }

    fn decide(
        &self,
        user_id: &str,
        claimed_ip: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        let config = self.config.lock().unwrap();
        let Some(entry) = config.whitelist_keys.get(user_id) else {
            return LoginOutcome::Denied(DenyReason::NotWhitelisted);
        };
        if let Some(pinned) = &entry.server_ip {
            if pinned != claimed_ip {
                return LoginOutcome::Denied(DenyReason::IpMismatch);
            }
        }
        if entry.is_expired(now) {
            return LoginOutcome::Denied(DenyReason::Expired);
        }
        if constant_time_eq(entry.access_key.as_bytes(), key.as_bytes()) {
            return LoginOutcome::Granted;
        }
        // A live shared token is accepted in place of the personal key, so a
        // rotation does not strand whitelisted users mid-session.
        if config
            .token_keys
            .iter()
            .any(|t| !t.is_expired(now) && constant_time_eq(t.value.as_bytes(), key.as_bytes()))
        {
            return LoginOutcome::Granted;
        }
        LoginOutcome::Denied(DenyReason::BadKey)
    }

    fn locked_until(&self, ip: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut failures = self.failures.lock().unwrap();
        let record = failures.get_mut(ip)?;
        Self::prune(record, now, self.window());
        record.locked_until.filter(|until| *until > now)
    }

    fn record_failure(&self, ip: &str, now: DateTime<Utc>) {
        let policy = {
            let config = self.config.lock().unwrap();
            config.auth.clone()
        };
        let mut failures = self.failures.lock().unwrap();
        let record = failures.entry(ip.to_string()).or_default();
        record.attempts.push(now);
        Self::prune(record, now, ChronoDuration::seconds(policy.failure_window_seconds as i64));
        if record.attempts.len() >= policy.max_failures as usize {
            record.locked_until =
                Some(now + ChronoDuration::seconds(policy.lockout_seconds as i64));
        }
    }

    fn window(&self) -> ChronoDuration {
        let config = self.config.lock().unwrap();
        ChronoDuration::seconds(config.auth.failure_window_seconds as i64)
    }

    fn prune(record: &mut FailureRecord, now: DateTime<Utc>, window: ChronoDuration) {
        let start = now - window;
        record.attempts.retain(|t| *t >= start);
        if record.locked_until.is_some_and(|until| until <= now) {
            record.locked_until = None;
        }
    }

    /// Whether a user carries the admin flag.
    pub fn is_admin(&self, user_id: &str) -> bool {
        let config = self.config.lock().unwrap();
        config.whitelist_keys.get(user_id).is_some_and(|e| e.admin)
    }

    /// Create or replace a user's whitelist key and persist.
    pub fn update_key(
        &self,
        user_id: &str,
        key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut config = self.config.lock().unwrap();
        let previous = config.whitelist_keys.get(user_id);
        let admin = previous.is_some_and(|e| e.admin);
        let server_ip = previous.and_then(|e| e.server_ip.clone());
        config.whitelist_keys.insert(
            user_id.to_string(),
            WhitelistEntry {
                access_key: key.to_string(),
                server_ip,
                expires_at,
                admin,
            },
        );
        config.save(&self.config_path)?;
        info!(user_id, key_fp = %fingerprint(key), "whitelist key updated");
        Ok(())
    }

    /// Remove a user's whitelist entry. Returns false if there was none.
    pub fn revoke_key(&self, user_id: &str) -> Result<bool> {
        let mut config = self.config.lock().unwrap();
        let removed = config.whitelist_keys.remove(user_id).is_some();
        if removed {
            config.save(&self.config_path)?;
            info!(user_id, "whitelist key revoked");
        }
        Ok(removed)
    }

    /// Insert a new shared token and stamp every live one with a grace
    /// deadline. Returns how many keys were put on the clock.
    pub fn rotate_token(&self, new_value: &str) -> Result<usize> {
        self.rotate_token_at(new_value, Utc::now())
    }

    pub fn rotate_token_at(&self, new_value: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut config = self.config.lock().unwrap();
        let deadline = now + ChronoDuration::seconds(config.auth.rotation_grace_seconds as i64);
        let mut rotated = 0;
        for key in &mut config.token_keys {
            if key.expires_at.is_none_or(|e| e > deadline) {
                key.expires_at = Some(deadline);
                rotated += 1;
            }
        }
        config.token_keys.insert(
            0,
            TokenKey {
                value: new_value.to_string(),
                expires_at: None,
            },
        );
        config.save(&self.config_path)?;
        info!(key_fp = %fingerprint(new_value), rotated, "shared token rotated");
        Ok(rotated)
    }
}
