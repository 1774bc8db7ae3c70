//! tgbot service layer
//!
//! The dispatcher (per-user state machine over inbound chat updates), the
//! output scheduler (periodic and prompt-triggered capture emission), and the
//! pluggable chat transport with webhook and long-poll adapters.

pub mod callback;
pub mod dispatcher;
pub mod render;
pub mod scheduler;
pub mod telegram;
pub mod transport;
pub mod webhook;

pub use dispatcher::{Dispatcher, DispatcherDeps};
pub use scheduler::Scheduler;
pub use transport::{Button, ChatTransport, Outbound, TransportError, Update, UpdateSource};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-user command locks shared by the dispatcher and the scheduler.
///
/// The dispatcher's worker holds a user's lock for the whole event; scheduler
/// ticks use `try_lock` and skip instead of queueing behind a slow command.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
