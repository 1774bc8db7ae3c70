//! Output scheduler
//!
//! One logical timer per user, ticking only for the active tab. Normal mode
//! emits the whole capture when it changed; claude mode stays silent unless a
//! prompt rule fires, and then emits only the incremental tail plus the
//! rule's buttons. Ticks that cannot take the user's command lock are
//! dropped, never queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tgbot_core::output::{self, ChunkLimits, Tail};
use tgbot_core::registry::TagRegistry;
use tgbot_core::rules::PromptRuleEngine;
use tgbot_core::state::{Mode, UserStateStore};
use tgbot_mux::TerminalDriver;

use crate::render;
use crate::transport::{ChatTransport, Outbound};
use crate::UserLocks;

/// Everything the scheduler needs, injected by the binary.
pub struct SchedulerDeps {
    pub driver: Arc<dyn TerminalDriver>,
    pub registry: Arc<TagRegistry>,
    pub states: Arc<UserStateStore>,
    pub rules: Arc<PromptRuleEngine>,
    pub transport: Arc<dyn ChatTransport>,
    pub locks: Arc<UserLocks>,
    pub limits: ChunkLimits,
    pub scrollback: u32,
    pub fallback_lines: usize,
}

struct Inner {
    deps: SchedulerDeps,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Last emitted snapshot per tab, normalized. Diff base for claude mode
    /// and change detection for normal mode.
    last_emitted: Mutex<HashMap<String, String>>,
}

/// Per-user periodic capture loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                timers: Mutex::new(HashMap::new()),
                last_emitted: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// (Re)start the user's timer from current state. Interval changes reset
    /// the phase; `never`, a missing active tab, or a revoked user stop it.
    pub fn sync_user(&self, user_id: &str) {
        let mut timers = self.inner.timers.lock().unwrap();
        if let Some(handle) = timers.remove(user_id) {
            handle.abort();
        }
        let state = self.inner.deps.states.get(user_id);
        if !state.authorized || state.active_tab_id.is_none() {
            return;
        }
        let Some(period) = state.interval.as_duration() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let user = user_id.to_string();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                inner.tick(&user).await;
            }
        });
        timers.insert(user_id.to_string(), handle);
    }

    /// Immediate capture, emitted unconditionally. The caller must already
    /// hold the user's command lock (dispatcher workers do).
    pub async fn refresh_now(&self, user_id: &str) {
        self.inner.refresh(user_id).await;
    }

    /// One scheduler tick, exactly as the timer would run it (including the
    /// try-lock skip).
    pub async fn tick_once(&self, user_id: &str) {
        self.inner.tick(user_id).await;
    }

    /// Claude-mode flush after a command was sent to the terminal. No-op in
    /// normal mode. The caller must hold the user's command lock.
    pub async fn flush_after_command(&self, user_id: &str) {
        let state = self.inner.deps.states.get(user_id);
        if state.mode == Mode::Claude {
            self.inner.claude_pass(user_id, &state).await;
        }
    }

    /// Drop the diff base for a closed tab.
    pub fn forget_tab(&self, tab_id: &str) {
        self.inner.last_emitted.lock().unwrap().remove(tab_id);
    }

    pub fn stop_user(&self, user_id: &str) {
        if let Some(handle) = self.inner.timers.lock().unwrap().remove(user_id) {
            handle.abort();
        }
    }

    pub fn shutdown(&self) {
        let mut timers = self.inner.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

impl Inner {
    /// Periodic tick: skip when the user has a command in flight.
    async fn tick(&self, user_id: &str) {
        let lock = self.deps.locks.get(user_id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(user_id, "tick skipped, command in flight");
            return;
        };
        let state = self.deps.states.get(user_id);
        if !state.authorized {
            return;
        }
        match state.mode {
            Mode::Normal => self.normal_pass(&state).await,
            Mode::Claude => self.claude_pass(user_id, &state).await,
        }
    }

    async fn refresh(&self, user_id: &str) {
        let state = self.deps.states.get(user_id);
        let Some((tab_id, capture, chat_id)) = self.capture_active(&state).await else {
            return;
        };
        match state.mode {
            Mode::Normal => {
                self.emit(chat_id, &capture).await;
                self.remember(&tab_id, &capture);
            }
            Mode::Claude => {
                let previous = self.recall(&tab_id);
                let text = match output::incremental_tail(&previous, &capture, self.deps.fallback_lines)
                {
                    Tail::Unchanged => "No new output.".to_string(),
                    Tail::Extension(tail) | Tail::Fallback(tail) => tail,
                };
                self.emit(chat_id, &text).await;
                self.remember(&tab_id, &capture);
            }
        }
    }

    async fn normal_pass(&self, state: &tgbot_core::state::UserState) {
        let Some((tab_id, capture, chat_id)) = self.capture_active(state).await else {
            return;
        };
        let previous = self.recall(&tab_id);
        if output::capture_hash(&capture) == output::capture_hash(&previous) {
            return;
        }
        self.emit(chat_id, &capture).await;
        self.remember(&tab_id, &capture);
    }

    async fn claude_pass(&self, user_id: &str, state: &tgbot_core::state::UserState) {
        let Some((tab_id, capture, chat_id)) = self.capture_active(state).await else {
            return;
        };
        let previous = self.recall(&tab_id);
        let tail = output::incremental_tail(&previous, &capture, self.deps.fallback_lines);
        let tail_text = match &tail {
            Tail::Unchanged => return,
            Tail::Extension(text) | Tail::Fallback(text) => text.clone(),
        };
        let Some(signal) = self.deps.rules.evaluate(&tail_text, user_id) else {
            // Silence: leave the diff base alone so the next pass still sees
            // this output as new.
            return;
        };
        let text = if signal.incremental { tail_text } else { capture.clone() };
        self.emit(chat_id, &text).await;
        if !signal.buttons.is_empty() {
            self.send(render::prompt_buttons(chat_id, &signal)).await;
        }
        self.remember(&tab_id, &capture);
    }

    /// Capture the user's active tab. `None` when there is nothing to do.
    async fn capture_active(
        &self,
        state: &tgbot_core::state::UserState,
    ) -> Option<(String, String, i64)> {
        let tab_id = state.active_tab_id.clone()?;
        let chat_id = state.chat_id?;
        self.deps.registry.get(&tab_id)?;
        match self.deps.driver.capture(&tab_id, self.deps.scrollback).await {
            Ok(capture) => Some((tab_id, capture, chat_id)),
            Err(e) => {
                warn!(%tab_id, error = %e, "scheduled capture failed");
                None
            }
        }
    }

    fn recall(&self, tab_id: &str) -> String {
        self.last_emitted.lock().unwrap().get(tab_id).cloned().unwrap_or_default()
    }

    fn remember(&self, tab_id: &str, capture: &str) {
        self.last_emitted
            .lock()
            .unwrap()
            .insert(tab_id.to_string(), output::normalize(capture));
    }

    async fn emit(&self, chat_id: i64, text: &str) {
        for (index, chunk) in output::split_message(text, self.deps.limits).into_iter().enumerate() {
            if index > 0 {
                // Pace multi-chunk emissions to stay under transport limits.
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            self.send(Outbound::text(chat_id, chunk)).await;
        }
    }

    async fn send(&self, message: Outbound) {
        if let Err(e) = self.deps.transport.send(message).await {
            warn!(error = %e, "outbound send failed");
        }
    }
}
