//! Dispatcher
//!
//! The per-user state machine over inbound chat updates. Every user gets a
//! mailbox and a worker task; events for one user are handled strictly in
//! arrival order under the user's command lock, while different users run in
//! parallel. A failing event is isolated: the worker answers with a generic
//! error and stays alive.
//!
//! Pipeline per event: auth gate, routing, guards, action, render, audit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tgbot_core::audit::{AuditLog, AuditRecord};
use tgbot_core::auth::{AuthManager, LoginOutcome};
use tgbot_core::edit::EditManager;
use tgbot_core::output::{self, ChunkLimits};
use tgbot_core::policy::CommandPolicy;
use tgbot_core::registry::{TabRecord, TagRegistry};
use tgbot_core::state::{Mode, UserStateStore};
use tgbot_mux::{parse_jobs, ControlKey, DriverError, TerminalDriver};

use crate::callback::CallbackAction;
use crate::render;
use crate::scheduler::Scheduler;
use crate::transport::{ChatTransport, Outbound, Update};
use crate::UserLocks;

#[derive(Debug, Error)]
enum ServiceError {
    #[error(transparent)]
    Core(#[from] tgbot_core::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Everything the dispatcher needs, injected by the binary.
pub struct DispatcherDeps {
    pub driver: Arc<dyn TerminalDriver>,
    pub registry: Arc<TagRegistry>,
    pub states: Arc<UserStateStore>,
    pub auth: Arc<AuthManager>,
    pub policy: Arc<CommandPolicy>,
    pub edit: Arc<EditManager>,
    pub audit: Arc<AuditLog>,
    pub transport: Arc<dyn ChatTransport>,
    pub scheduler: Scheduler,
    pub locks: Arc<UserLocks>,
    pub limits: ChunkLimits,
    pub scrollback: u32,
}

struct Worker {
    tx: mpsc::UnboundedSender<Update>,
    handle: JoinHandle<()>,
}

struct Inner {
    deps: DispatcherDeps,
    workers: Mutex<HashMap<String, Worker>>,
    /// Users who pressed a rename button; the next plain text is the name.
    pending_rename: Mutex<HashMap<String, String>>,
}

/// Routes inbound updates into per-user workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                workers: Mutex::new(HashMap::new()),
                pending_rename: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueue an update for its user. Events for one user are applied in
    /// arrival order; users are independent.
    pub fn dispatch(&self, update: Update) {
        if update.user_id.is_empty() {
            warn!("dropping update without user id");
            return;
        }
        let mut workers = self.inner.workers.lock().unwrap();
        let worker = workers
            .entry(update.user_id.clone())
            .or_insert_with(|| Self::spawn_worker(&self.inner, &update.user_id));
        if worker.tx.send(update.clone()).is_err() {
            // Worker died on a panic; replace it and retry once.
            let fresh = Self::spawn_worker(&self.inner, &update.user_id);
            let _ = fresh.tx.send(update.clone());
            workers.insert(update.user_id.clone(), fresh);
        }
    }

    fn spawn_worker(inner: &Arc<Inner>, user_id: &str) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(inner);
        let user = user_id.to_string();
        let handle = tokio::spawn(async move {
            Inner::worker_loop(inner, user, rx).await;
        });
        Worker { tx, handle }
    }

    /// Handle one update to completion under the user's command lock,
    /// bypassing the mailbox. Ordering across concurrent callers is the
    /// lock's order; prefer [`Dispatcher::dispatch`] for live traffic.
    pub async fn process(&self, update: Update) {
        let user_id = update.user_id.clone();
        let chat_id = update.chat_id;
        let lock = self.inner.deps.locks.get(&user_id);
        let _guard = lock.lock().await;
        if let Err(e) = self.inner.handle(update).await {
            error!(%user_id, error = %e, "event handler failed");
            self.inner
                .send(Outbound::text(chat_id, "Internal error, please try again."))
                .await;
        }
    }

    /// Drain all per-user queues within the grace window, then abort.
    pub async fn shutdown(&self, grace: Duration) {
        let workers: Vec<Worker> = {
            let mut map = self.inner.workers.lock().unwrap();
            map.drain().map(|(_, w)| w).collect()
        };
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            drop(worker.tx);
            handles.push(worker.handle);
        }
        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("worker did not drain in time, aborting");
                handle.abort();
            }
        }
    }
}

impl Inner {
    async fn worker_loop(inner: Arc<Inner>, user_id: String, mut rx: mpsc::UnboundedReceiver<Update>) {
        while let Some(update) = rx.recv().await {
            let lock = inner.deps.locks.get(&user_id);
            let _guard = lock.lock().await;
            let chat_id = update.chat_id;
            if let Err(e) = inner.handle(update).await {
                error!(%user_id, error = %e, "event handler failed");
                inner
                    .send(Outbound::text(chat_id, "Internal error, please try again."))
                    .await;
            }
        }
    }

    async fn handle(&self, update: Update) -> Result<(), ServiceError> {
        let user_id = update.user_id.clone();
        let chat_id = update.chat_id;

        let state = self.deps.states.get(&user_id);
        if state.chat_id != Some(chat_id) {
            self.deps.states.set_chat_id(&user_id, chat_id)?;
        }

        if let Some(text) = update.text.clone() {
            if let Some(stripped) = text.strip_prefix('/') {
                return self.handle_slash(&user_id, chat_id, stripped).await;
            }
            return self.handle_plain_text(&user_id, chat_id, &text).await;
        }
        if let Some(data) = update.callback_data.clone() {
            return self.handle_callback(&user_id, chat_id, &data).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Slash commands
    // ------------------------------------------------------------------

    async fn handle_slash(
        &self,
        user_id: &str,
        chat_id: i64,
        command: &str,
    ) -> Result<(), ServiceError> {
        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        // The unauthenticated state accepts /login, /start, and /help only.
        match name {
            "login" => return self.cmd_login(user_id, chat_id, &args).await,
            "help" => {
                self.send(render::help(chat_id)).await;
                return Ok(());
            }
            "start" => {
                let state = self.deps.states.get(user_id);
                if state.authorized {
                    self.send(render::main_menu(chat_id, &state)).await;
                } else {
                    self.send(render::login_prompt(chat_id)).await;
                }
                return Ok(());
            }
            _ => {}
        }

        let state = self.deps.states.get(user_id);
        if !state.authorized {
            self.send(render::login_prompt(chat_id)).await;
            return Ok(());
        }

        // While an edit session is open only /cancel gets through.
        if name != "cancel" && self.deps.edit.is_open(user_id) {
            self.send_text(chat_id, "Finish the current edit first (/cancel to abort).").await;
            return Ok(());
        }

        match name {
            "tabs" => {
                let tabs = self.deps.registry.list_tabs(user_id);
                self.send(render::tabs_menu(chat_id, &tabs, state.active_tab_id.as_deref()))
                    .await;
            }
            "interval" => {
                self.send(render::interval_menu(chat_id, state.interval)).await;
            }
            "refresh" => {
                if self.active_record(user_id, chat_id).await.is_some() {
                    self.deps.scheduler.refresh_now(user_id).await;
                }
            }
            "edit" => {
                self.show_edit_menu(user_id, chat_id).await?;
            }
            "jobs" => {
                self.show_jobs_menu(user_id, chat_id).await?;
            }
            "claude" => {
                let mode = match state.mode {
                    Mode::Normal => Mode::Claude,
                    Mode::Claude => Mode::Normal,
                };
                self.deps.states.set_mode(user_id, mode)?;
                self.deps.scheduler.sync_user(user_id);
                let label = match mode {
                    Mode::Normal => "normal",
                    Mode::Claude => "claude",
                };
                self.send_text(chat_id, &format!("Mode: {label}")).await;
            }
            "cancel" => {
                let had_edit = self.deps.edit.cancel(user_id).is_some();
                let had_rename = self.pending_rename.lock().unwrap().remove(user_id).is_some();
                if had_edit || had_rename {
                    self.send_text(chat_id, "Cancelled.").await;
                } else {
                    self.send_text(chat_id, "Nothing to cancel.").await;
                }
            }
            "update_key" | "revoke_key" | "rotate_token" => {
                self.cmd_admin(user_id, chat_id, name, &args).await?;
            }
            _ => {
                self.send_text(chat_id, "Unknown command. See /help.").await;
            }
        }
        Ok(())
    }

    async fn cmd_login(
        &self,
        user_id: &str,
        chat_id: i64,
        args: &[&str],
    ) -> Result<(), ServiceError> {
        let [server_ip, key, ..] = args else {
            self.send_text(chat_id, "Usage: /login <server_ip> <key>").await;
            return Ok(());
        };
        match self.deps.auth.login(user_id, server_ip, key) {
            LoginOutcome::Granted => {
                self.deps.states.mark_authorized(user_id, server_ip)?;
                self.deps.scheduler.sync_user(user_id);
                self.send_text(chat_id, "Logged in.").await;
                let state = self.deps.states.get(user_id);
                self.send(render::main_menu(chat_id, &state)).await;
            }
            LoginOutcome::Denied(_) => {
                // One generic message; the precise reason stays in the log.
                self.send_text(chat_id, "Authentication failed.").await;
            }
            LoginOutcome::LockedOut { until } => {
                self.send_text(
                    chat_id,
                    &format!("Too many failed attempts. Locked out until {}.", until.to_rfc3339()),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn cmd_admin(
        &self,
        user_id: &str,
        chat_id: i64,
        name: &str,
        args: &[&str],
    ) -> Result<(), ServiceError> {
        if !self.deps.auth.is_admin(user_id) {
            self.send_text(chat_id, "Admin access required.").await;
            return Ok(());
        }
        match name {
            "update_key" => {
                let [target, key, rest @ ..] = args else {
                    self.send_text(chat_id, "Usage: /update_key <user_id> <new_key> [expires_at]")
                        .await;
                    return Ok(());
                };
                let expires_at = match rest.first() {
                    Some(raw) => match parse_deadline(raw) {
                        Some(deadline) => Some(deadline),
                        None => {
                            self.send_text(chat_id, "Bad expires_at; use RFC 3339 or epoch seconds.")
                                .await;
                            return Ok(());
                        }
                    },
                    None => None,
                };
                self.deps.auth.update_key(target, key, expires_at)?;
                self.deps.audit.append(AuditRecord::new(user_id, None, "/update_key", "admin_ok"));
                self.send_text(chat_id, &format!("Key updated for user {target}.")).await;
            }
            "revoke_key" => {
                let [target] = args else {
                    self.send_text(chat_id, "Usage: /revoke_key <user_id>").await;
                    return Ok(());
                };
                let removed = self.deps.auth.revoke_key(target)?;
                if removed {
                    self.deps.states.revoke(target)?;
                    self.deps.scheduler.stop_user(target);
                    self.deps.audit.append(AuditRecord::new(user_id, None, "/revoke_key", "admin_ok"));
                    self.send_text(chat_id, &format!("Key revoked for user {target}.")).await;
                } else {
                    self.send_text(chat_id, &format!("User {target} has no key.")).await;
                }
            }
            "rotate_token" => {
                let [token] = args else {
                    self.send_text(chat_id, "Usage: /rotate_token <new_token>").await;
                    return Ok(());
                };
                let rotated = self.deps.auth.rotate_token(token)?;
                self.deps.audit.append(AuditRecord::new(user_id, None, "/rotate_token", "admin_ok"));
                self.send_text(chat_id, &format!("Token rotated; {rotated} key(s) on grace clock."))
                    .await;
            }
            _ => unreachable!("routed admin command"),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    async fn handle_callback(
        &self,
        user_id: &str,
        chat_id: i64,
        data: &str,
    ) -> Result<(), ServiceError> {
        let state = self.deps.states.get(user_id);
        if !state.authorized {
            self.send(render::login_prompt(chat_id)).await;
            return Ok(());
        }

        let action = match CallbackAction::parse(data) {
            Ok(action) => action,
            Err(e) => {
                warn!(user_id, %e, "malformed callback data");
                self.send_text(chat_id, "Bad action.").await;
                return Ok(());
            }
        };

        if !matches!(action, CallbackAction::EditSave(_)) && self.deps.edit.is_open(user_id) {
            self.send_text(chat_id, "Finish the current edit first (/cancel to abort).").await;
            return Ok(());
        }

        match action {
            CallbackAction::TabList => {
                let tabs = self.deps.registry.list_tabs(user_id);
                self.send(render::tabs_menu(chat_id, &tabs, state.active_tab_id.as_deref()))
                    .await;
            }
            CallbackAction::TabNew => {
                self.create_tab(user_id, chat_id).await?;
            }
            CallbackAction::TabSelect(tab_id) => {
                let Some(record) = self.deps.registry.get(&tab_id) else {
                    self.send_text(chat_id, "Tab no longer exists.").await;
                    return Ok(());
                };
                // Switching tabs abandons any open edit session.
                self.deps.edit.cancel(user_id);
                self.deps.states.set_active_tab(user_id, Some(tab_id))?;
                self.deps.scheduler.sync_user(user_id);
                self.send_text(chat_id, &format!("Switched to tab {}.", record.display_name))
                    .await;
            }
            CallbackAction::TabRename(tab_id) => {
                let Some(record) = self.deps.registry.get(&tab_id) else {
                    self.send_text(chat_id, "Tab no longer exists.").await;
                    return Ok(());
                };
                self.pending_rename
                    .lock()
                    .unwrap()
                    .insert(user_id.to_string(), tab_id);
                self.send_text(
                    chat_id,
                    &format!("Send the new name for tab {} (current).", record.display_name),
                )
                .await;
            }
            CallbackAction::TabClose(tab_id) => {
                let record = match self.deps.registry.close_tab(&tab_id) {
                    Ok(record) => record,
                    Err(tgbot_core::Error::TabNotFound(_)) => {
                        self.send_text(chat_id, "Tab no longer exists.").await;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                if let Err(e) = self.deps.driver.kill_session(&tab_id).await {
                    warn!(%tab_id, error = %e, "kill_session failed on close");
                }
                self.deps.states.clear_active_tab(&tab_id)?;
                self.deps.scheduler.forget_tab(&tab_id);
                self.deps.scheduler.sync_user(user_id);
                self.send_text(chat_id, &format!("Closed tab {}.", record.display_name)).await;
            }
            CallbackAction::TabRecreate(tab_id) => {
                if self.deps.registry.get(&tab_id).is_none() {
                    self.send_text(chat_id, "Tab no longer exists.").await;
                    return Ok(());
                }
                match self.deps.driver.create_session(&tab_id).await {
                    Ok(()) => {
                        self.deps.registry.mark_active(&tab_id)?;
                        self.send_text(chat_id, "Session recreated.").await;
                    }
                    Err(e) => {
                        self.reply_driver_error(user_id, chat_id, Some(&tab_id), "recreate", &e)
                            .await;
                    }
                }
            }
            CallbackAction::IntervalList => {
                self.send(render::interval_menu(chat_id, state.interval)).await;
            }
            CallbackAction::IntervalSet(interval) => {
                self.deps.states.set_interval(user_id, interval)?;
                // Resets the timer phase as a side effect.
                self.deps.scheduler.sync_user(user_id);
                self.send_text(chat_id, &format!("Interval set to {}.", interval.label())).await;
            }
            CallbackAction::RefreshNow => {
                if self.active_record(user_id, chat_id).await.is_some() {
                    self.deps.scheduler.refresh_now(user_id).await;
                }
            }
            CallbackAction::EditList => {
                self.show_edit_menu(user_id, chat_id).await?;
            }
            CallbackAction::EditOpen(rel_path) => {
                self.open_editor(user_id, chat_id, &rel_path).await?;
            }
            CallbackAction::EditSave(_) => {
                if self.deps.edit.is_open(user_id) {
                    self.send_text(chat_id, "Send the new content as a message.").await;
                } else {
                    self.send_text(chat_id, "No edit session is open.").await;
                }
            }
            CallbackAction::JobsList => {
                self.show_jobs_menu(user_id, chat_id).await?;
            }
            CallbackAction::JobsCtrlZ => {
                let Some(record) = self.active_record(user_id, chat_id).await else {
                    return Ok(());
                };
                match self.deps.driver.send_key(&record.tab_id, ControlKey::CtrlZ).await {
                    Ok(()) => self.send_text(chat_id, "Sent CTRL-Z.").await,
                    Err(e) => {
                        self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), "ctrlz", &e)
                            .await
                    }
                }
            }
            CallbackAction::JobsBg(job_id) => {
                let Some(record) = self.active_record(user_id, chat_id).await else {
                    return Ok(());
                };
                let command = format!("bg %{job_id}");
                match self.deps.driver.send_text(&record.tab_id, &command).await {
                    Ok(()) => {
                        self.send_text(chat_id, &format!("Job %{job_id} moved to background."))
                            .await
                    }
                    Err(e) => {
                        self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), &command, &e)
                            .await
                    }
                }
            }
            CallbackAction::ModeClaude | CallbackAction::ModeShell => {
                let mode = if matches!(action, CallbackAction::ModeClaude) {
                    Mode::Claude
                } else {
                    Mode::Normal
                };
                self.deps.states.set_mode(user_id, mode)?;
                self.deps.scheduler.sync_user(user_id);
                let state = self.deps.states.get(user_id);
                self.send(render::main_menu(chat_id, &state)).await;
            }
            CallbackAction::Prompt(text) => {
                self.execute_command(user_id, chat_id, &text).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plain text
    // ------------------------------------------------------------------

    async fn handle_plain_text(
        &self,
        user_id: &str,
        chat_id: i64,
        text: &str,
    ) -> Result<(), ServiceError> {
        let state = self.deps.states.get(user_id);
        if !state.authorized {
            self.send(render::login_prompt(chat_id)).await;
            return Ok(());
        }

        if self.deps.edit.is_open(user_id) {
            return self.save_edit_content(user_id, chat_id, text).await;
        }

        let pending = self.pending_rename.lock().unwrap().get(user_id).cloned();
        if let Some(tab_id) = pending {
            return self.finish_rename(user_id, chat_id, &tab_id, text).await;
        }

        self.execute_command(user_id, chat_id, text).await
    }

    async fn save_edit_content(
        &self,
        user_id: &str,
        chat_id: i64,
        content: &str,
    ) -> Result<(), ServiceError> {
        match self.deps.edit.submit(user_id, content) {
            Ok(path) => {
                self.deps.audit.append(
                    AuditRecord::new(user_id, None, "<edit>", "edit_saved")
                        .with_detail(path.display().to_string()),
                );
                self.send_text(chat_id, "Saved.").await;
            }
            Err(e) => {
                warn!(user_id, error = %e, "edit save failed");
                self.send_text(chat_id, "Save failed; send the content again or /cancel.")
                    .await;
            }
        }
        Ok(())
    }

    async fn finish_rename(
        &self,
        user_id: &str,
        chat_id: i64,
        tab_id: &str,
        new_name: &str,
    ) -> Result<(), ServiceError> {
        match self.deps.registry.rename_tab(tab_id, new_name) {
            Ok(record) => {
                self.pending_rename.lock().unwrap().remove(user_id);
                self.send_text(chat_id, &format!("Tab renamed to {}.", record.display_name))
                    .await;
            }
            Err(tgbot_core::Error::DuplicateTabName(name)) => {
                self.send_text(chat_id, &format!("Name '{name}' is already taken.")).await;
            }
            Err(tgbot_core::Error::InvalidTabName(_)) => {
                self.send_text(chat_id, "The name must not be empty.").await;
            }
            Err(tgbot_core::Error::TabNotFound(_)) => {
                self.pending_rename.lock().unwrap().remove(user_id);
                self.send_text(chat_id, "Tab no longer exists.").await;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Guarded shell execution into the active tab.
    async fn execute_command(
        &self,
        user_id: &str,
        chat_id: i64,
        command: &str,
    ) -> Result<(), ServiceError> {
        let Some(record) = self.active_record(user_id, chat_id).await else {
            return Ok(());
        };

        if let Err(violation) = self.deps.policy.check(command) {
            self.deps.audit.append(AuditRecord::new(
                user_id,
                Some(&record.tab_id),
                command,
                violation.token(),
            ));
            let reply = match violation {
                tgbot_core::policy::PolicyViolation::Empty => "Command is empty.",
                tgbot_core::policy::PolicyViolation::TooLong => "Command rejected: too_long.",
                tgbot_core::policy::PolicyViolation::Blocked => "Command rejected: blocked.",
                tgbot_core::policy::PolicyViolation::NotAllowlisted => {
                    "Command rejected: not_allowlisted."
                }
            };
            self.send_text(chat_id, reply).await;
            return Ok(());
        }

        match self.deps.driver.has_session(&record.tab_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.send(render::recreate_offer(chat_id, &record.tab_id)).await;
                return Ok(());
            }
            Err(e) => {
                self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), command, &e)
                    .await;
                return Ok(());
            }
        }

        self.deps.registry.touch(&record.tab_id);
        match self.deps.driver.send_text(&record.tab_id, command).await {
            Ok(()) => {
                self.deps.audit.append(AuditRecord::new(
                    user_id,
                    Some(&record.tab_id),
                    command,
                    "sent",
                ));
                info!(user_id, tab_id = %record.tab_id, "command dispatched");
                self.deps.scheduler.flush_after_command(user_id).await;
            }
            Err(DriverError::SessionMissing(_)) => {
                self.send(render::recreate_offer(chat_id, &record.tab_id)).await;
            }
            Err(e) => {
                self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), command, &e)
                    .await;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Menus that need the terminal
    // ------------------------------------------------------------------

    async fn show_edit_menu(&self, user_id: &str, chat_id: i64) -> Result<(), ServiceError> {
        let Some(record) = self.active_record(user_id, chat_id).await else {
            return Ok(());
        };
        let cwd = match self.deps.driver.current_dir(&record.tab_id).await {
            Ok(cwd) => cwd,
            Err(e) => {
                self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), "edit:list", &e)
                    .await;
                return Ok(());
            }
        };
        let listing = self.deps.edit.list_files(&cwd, 0)?;
        self.send(render::edit_menu(chat_id, &cwd.display().to_string(), &listing))
            .await;
        Ok(())
    }

    async fn open_editor(
        &self,
        user_id: &str,
        chat_id: i64,
        rel_path: &str,
    ) -> Result<(), ServiceError> {
        let Some(record) = self.active_record(user_id, chat_id).await else {
            return Ok(());
        };
        let cwd = match self.deps.driver.current_dir(&record.tab_id).await {
            Ok(cwd) => cwd,
            Err(e) => {
                self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), "edit:open", &e)
                    .await;
                return Ok(());
            }
        };
        match self.deps.edit.open(user_id, &cwd, rel_path) {
            Ok((_, content)) => {
                let header = format!("Editing {rel_path}. Send the new content to save, /cancel to abort.\n\n");
                self.send_chunked(chat_id, &format!("{header}{content}")).await;
            }
            Err(tgbot_core::Error::EditSessionOpen(path)) => {
                self.send_text(chat_id, &format!("Finish the edit of {path} first (/cancel to abort)."))
                    .await;
            }
            Err(tgbot_core::Error::PathOutsideRoot(_)) => {
                self.send_text(chat_id, "Illegal path.").await;
            }
            Err(tgbot_core::Error::NotAFile(_)) => {
                self.send_text(chat_id, "File does not exist or is not editable.").await;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn show_jobs_menu(&self, user_id: &str, chat_id: i64) -> Result<(), ServiceError> {
        let Some(record) = self.active_record(user_id, chat_id).await else {
            return Ok(());
        };
        let jobs = async {
            self.deps.driver.send_text(&record.tab_id, "jobs -l").await?;
            let capture = self.deps.driver.capture(&record.tab_id, self.deps.scrollback).await?;
            Ok::<_, DriverError>(parse_jobs(&capture))
        }
        .await;
        match jobs {
            Ok(jobs) => self.send(render::jobs_menu(chat_id, &jobs)).await,
            Err(e) => {
                self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), "jobs -l", &e)
                    .await
            }
        }
        Ok(())
    }

    async fn create_tab(&self, user_id: &str, chat_id: i64) -> Result<(), ServiceError> {
        let existing = self.deps.registry.list_tabs(user_id);
        let taken: Vec<&str> = existing.iter().map(|t| t.display_name.as_str()).collect();
        let mut index = existing.len() + 1;
        let mut name = format!("tab-{index}");
        while taken.contains(&name.as_str()) {
            index += 1;
            name = format!("tab-{index}");
        }

        let record = self.deps.registry.create_tab(user_id, &name)?;
        if let Err(e) = self.deps.driver.create_session(&record.tab_id).await {
            // Roll the record back so the registry stays one-to-one with
            // sessions.
            let _ = self.deps.registry.close_tab(&record.tab_id);
            self.reply_driver_error(user_id, chat_id, Some(&record.tab_id), "tab:new", &e)
                .await;
            return Ok(());
        }
        self.deps.states.set_active_tab(user_id, Some(record.tab_id.clone()))?;
        self.deps.scheduler.sync_user(user_id);
        self.send_text(chat_id, &format!("Created tab {}.", record.display_name)).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// The user's active tab record, or a guidance message.
    async fn active_record(&self, user_id: &str, chat_id: i64) -> Option<TabRecord> {
        let state = self.deps.states.get(user_id);
        let Some(tab_id) = state.active_tab_id else {
            self.send_text(chat_id, "Create or select a tab first (/tabs).").await;
            return None;
        };
        match self.deps.registry.get(&tab_id) {
            Some(record) => Some(record),
            None => {
                self.send_text(chat_id, "The active tab is invalid, select another.").await;
                None
            }
        }
    }

    async fn reply_driver_error(
        &self,
        user_id: &str,
        chat_id: i64,
        tab_id: Option<&str>,
        command: &str,
        error: &DriverError,
    ) {
        let mut record = AuditRecord::new(user_id, tab_id, command, "driver_fault");
        if let DriverError::Fault { stderr, .. } = error {
            record = record.with_detail(stderr.clone());
        }
        self.deps.audit.append(record);
        warn!(user_id, %error, "driver operation failed");
        if matches!(error, DriverError::SessionMissing(_)) {
            if let Some(tab_id) = tab_id {
                self.send(render::recreate_offer(chat_id, tab_id)).await;
                return;
            }
        }
        self.send_text(chat_id, "Terminal driver error, try again.").await;
    }

    async fn send_text(&self, chat_id: i64, text: &str) {
        self.send(Outbound::text(chat_id, text)).await;
    }

    async fn send_chunked(&self, chat_id: i64, text: &str) {
        for chunk in output::split_message(text, self.deps.limits) {
            self.send(Outbound::text(chat_id, chunk)).await;
        }
    }

    async fn send(&self, message: Outbound) {
        if let Err(e) = self.deps.transport.send(message).await {
            warn!(error = %e, "outbound send failed");
        }
    }
}

fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0))
}
