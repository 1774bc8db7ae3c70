// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Durable per-user preferences
//!
//! Active tab, capture interval, output mode, authorization flag, and the
//! chat id scheduler emissions go to. Edit sessions are deliberately not
//! persisted; they die with the process.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Capture emission interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    OneMinute,
    #[default]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "never")]
    Never,
}

impl Interval {
    pub const ALL: [Interval; 4] = [
        Interval::OneMinute,
        Interval::FiveMinutes,
        Interval::OneHour,
        Interval::Never,
    ];

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Interval::OneMinute => Some(Duration::from_secs(60)),
            Interval::FiveMinutes => Some(Duration::from_secs(300)),
            Interval::OneHour => Some(Duration::from_secs(3600)),
            Interval::Never => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::OneHour => "1h",
            Interval::Never => "never",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Interval::OneMinute => "1min",
            Interval::FiveMinutes => "5min",
            Interval::OneHour => "1hr",
            Interval::Never => "never",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.token() == token)
    }
}

/// Output mode of a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Claude,
}

/// Persisted per-user state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserState {
    pub user_id: String,
    #[serde(default)]
    pub active_tab_id: Option<String>,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub authorized: bool,
    #[serde(default)]
    pub server_ip: Option<String>,
    #[serde(default)]
    pub chat_id: Option<i64>,
}

impl UserState {
    fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            active_tab_id: None,
            interval: Interval::default(),
            mode: Mode::default(),
            authorized: false,
            server_ip: None,
            chat_id: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    users: BTreeMap<String, UserState>,
}

/// Durable store with atomic rewrites.
pub struct UserStateStore {
    path: PathBuf,
    users: Mutex<BTreeMap<String, UserState>>,
}

impl UserStateStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: StateFile = serde_json::from_str(&contents)?;
            file.users
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            users: Mutex::new(users),
        })
    }

    fn save_locked(&self, users: &BTreeMap<String, UserState>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = StateFile {
            users: users.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    /// All user ids with persisted state.
    pub fn users(&self) -> Vec<String> {
        self.users.lock().unwrap().keys().cloned().collect()
    }

    /// Current state for a user, defaults on miss.
    pub fn get(&self, user_id: &str) -> UserState {
        self.users
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserState::new(user_id))
    }

    /// Replace a user's state and persist.
    pub fn update(&self, state: UserState) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        users.insert(state.user_id.clone(), state);
        self.save_locked(&users)
    }

    pub fn set_active_tab(&self, user_id: &str, tab_id: Option<String>) -> Result<UserState> {
        self.mutate(user_id, |state| state.active_tab_id = tab_id.clone())
    }

    pub fn set_interval(&self, user_id: &str, interval: Interval) -> Result<UserState> {
        self.mutate(user_id, |state| state.interval = interval)
    }

    pub fn set_mode(&self, user_id: &str, mode: Mode) -> Result<UserState> {
        self.mutate(user_id, |state| state.mode = mode)
    }

    pub fn set_chat_id(&self, user_id: &str, chat_id: i64) -> Result<UserState> {
        self.mutate(user_id, |state| state.chat_id = Some(chat_id))
    }

    pub fn mark_authorized(&self, user_id: &str, server_ip: &str) -> Result<UserState> {
        self.mutate(user_id, |state| {
            state.authorized = true;
            state.server_ip = Some(server_ip.to_string());
        })
    }

    pub fn revoke(&self, user_id: &str) -> Result<UserState> {
        self.mutate(user_id, |state| {
            state.authorized = false;
            state.server_ip = None;
        })
    }

    /// Clear any reference to a tab that no longer exists.
    pub fn clear_active_tab(&self, tab_id: &str) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let mut changed = false;
        for state in users.values_mut() {
            if state.active_tab_id.as_deref() == Some(tab_id) {
                state.active_tab_id = None;
                changed = true;
            }
        }
        if changed {
            self.save_locked(&users)?;
        }
        Ok(())
    }

    /// Drop active-tab references that the registry no longer knows about.
    /// Run after startup reconciliation.
    pub fn sanitize(&self, is_live: impl Fn(&str) -> bool) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let mut changed = false;
        for state in users.values_mut() {
            if let Some(tab_id) = &state.active_tab_id {
                if !is_live(tab_id) {
                    state.active_tab_id = None;
                    changed = true;
                }
            }
        }
        if changed {
            self.save_locked(&users)?;
        }
        Ok(())
    }

    fn mutate(&self, user_id: &str, f: impl FnOnce(&mut UserState)) -> Result<UserState> {
        let mut users = self.users.lock().unwrap();
        let state = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::new(user_id));
        f(state);
        let updated = state.clone();
        self.save_locked(&users)?;
        Ok(updated)
    }
}
