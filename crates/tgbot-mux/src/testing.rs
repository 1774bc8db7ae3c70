// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory driver for tests
//!
//! Mirrors the tmux driver's observable behavior without a tmux server:
//! sessions are entries in a map, captures are whatever the test staged, and
//! every keystroke is recorded in arrival order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{session_name, ControlKey, DriverError, Result, TerminalDriver};

#[derive(Debug, Default)]
struct FakeSession {
    screen: String,
    cwd: PathBuf,
}

/// Record of one input event delivered to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentInput {
    Text { tab_id: String, text: String },
    Key { tab_id: String, key_token: String },
}

#[derive(Debug, Default)]
struct Inner {
    sessions: BTreeMap<String, FakeSession>,
    sent: Vec<SentInput>,
    fail_next: bool,
}

/// Scriptable in-memory [`TerminalDriver`].
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    inner: Mutex<Inner>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the text a subsequent `capture` call will return.
    pub fn set_screen(&self, tab_id: &str, text: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(&session_name(tab_id)) {
            session.screen = text.to_string();
        }
    }

    pub fn set_cwd(&self, tab_id: &str, cwd: impl Into<PathBuf>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(&session_name(tab_id)) {
            session.cwd = cwd.into();
        }
    }

    /// Register a session that exists outside the registry (an orphan).
    pub fn add_raw_session(&self, session: &str) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.to_string(), FakeSession::default());
    }

    /// Drop a session behind the registry's back.
    pub fn drop_session(&self, tab_id: &str) {
        self.inner.lock().unwrap().sessions.remove(&session_name(tab_id));
    }

    /// Make the next operation fail with a driver fault.
    pub fn fail_next(&self) {
        self.inner.lock().unwrap().fail_next = true;
    }

    /// Everything sent so far, in arrival order.
    pub fn sent(&self) -> Vec<SentInput> {
        self.inner.lock().unwrap().sent.clone()
    }

    fn check_fault(inner: &mut Inner) -> Result<()> {
        if inner.fail_next {
            inner.fail_next = false;
            return Err(DriverError::Fault {
                command: "fake".to_string(),
                stderr: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TerminalDriver for InMemoryDriver {
    async fn create_session(&self, tab_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;
        inner
            .sessions
            .entry(session_name(tab_id))
            .or_insert_with(FakeSession::default);
        Ok(())
    }

    async fn has_session(&self, tab_id: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().sessions.contains_key(&session_name(tab_id)))
    }

    async fn kill_session(&self, tab_id: &str) -> Result<()> {
        self.inner.lock().unwrap().sessions.remove(&session_name(tab_id));
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().sessions.keys().cloned().collect())
    }

    async fn send_text(&self, tab_id: &str, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;
        if !inner.sessions.contains_key(&session_name(tab_id)) {
            return Err(DriverError::SessionMissing(tab_id.to_string()));
        }
        inner.sent.push(SentInput::Text {
            tab_id: tab_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_key(&self, tab_id: &str, key: ControlKey) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;
        if !inner.sessions.contains_key(&session_name(tab_id)) {
            return Err(DriverError::SessionMissing(tab_id.to_string()));
        }
        inner.sent.push(SentInput::Key {
            tab_id: tab_id.to_string(),
            key_token: key.token().to_string(),
        });
        Ok(())
    }

    async fn capture(&self, tab_id: &str, _scrollback_lines: u32) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fault(&mut inner)?;
        inner
            .sessions
            .get(&session_name(tab_id))
            .map(|s| s.screen.clone())
            .ok_or_else(|| DriverError::SessionMissing(tab_id.to_string()))
    }

    async fn current_dir(&self, tab_id: &str) -> Result<PathBuf> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(&session_name(tab_id))
            .map(|s| s.cwd.clone())
            .ok_or_else(|| DriverError::SessionMissing(tab_id.to_string()))
    }
}
