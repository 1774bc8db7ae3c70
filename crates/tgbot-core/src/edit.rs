// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Edit-session manager
//!
//! A stateful single-file exchange: open a file, send its content to the
//! user, and replace the file with the next plain-text message. At most one
//! session per user; saves are atomic; cancel never touches the file.
//! Sessions live in memory only and do not survive a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditState {
    AwaitingContent,
    Saving,
    Closed,
}

/// An open edit session.
#[derive(Debug, Clone)]
pub struct EditSession {
    pub edit_id: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub state: EditState,
}

/// One page of a directory listing.
#[derive(Debug, Clone)]
pub struct FileListing {
    pub files: Vec<String>,
    pub page: usize,
    pub total: usize,
    pub has_more: bool,
}

/// Per-user edit sessions.
#[derive(Debug, Default)]
pub struct EditManager {
    sessions: Mutex<HashMap<String, EditSession>>,
    page_size: usize,
}

impl EditManager {
    pub fn new(page_size: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Regular files directly under `dir`, sorted, one page at a time.
    pub fn list_files(&self, dir: &Path, page: usize) -> Result<FileListing> {
        let mut files = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        files.sort();
        let total = files.len();
        let start = page * self.page_size;
        let end = (start + self.page_size).min(total);
        let page_files = if start < total {
            files[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(FileListing {
            files: page_files,
            page,
            total,
            has_more: end < total,
        })
    }

    /// Open a file for editing, confined to `base_dir`. Returns the session
    /// and the current file content.
    pub fn open(&self, user_id: &str, base_dir: &Path, rel_path: &str) -> Result<(EditSession, String)> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(open) = sessions.get(user_id) {
            return Err(Error::EditSessionOpen(open.path.display().to_string()));
        }

        let base = base_dir.canonicalize()?;
        let target = base.join(rel_path);
        let target = target
            .canonicalize()
            .map_err(|_| Error::NotAFile(rel_path.to_string()))?;
        if !target.starts_with(&base) {
            return Err(Error::PathOutsideRoot(rel_path.to_string()));
        }
        if !target.is_file() {
            return Err(Error::NotAFile(rel_path.to_string()));
        }

        let content = fs::read_to_string(&target)?;
        let session = EditSession {
            edit_id: Uuid::new_v4().simple().to_string(),
            path: target,
            started_at: Utc::now(),
            state: EditState::AwaitingContent,
        };
        sessions.insert(user_id.to_string(), session.clone());
        Ok((session, content))
    }

    /// Replace the file content with `content` and close the session.
    pub fn submit(&self, user_id: &str, content: &str) -> Result<PathBuf> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(user_id).ok_or(Error::NoEditSession)?;
        session.state = EditState::Saving;
        let path = session.path.clone();

        let temp = path.with_extension("tgbot-edit.tmp");
        let write = fs::write(&temp, content).and_then(|()| fs::rename(&temp, &path));
        match write {
            Ok(()) => {
                session.state = EditState::Closed;
                sessions.remove(user_id);
                Ok(path)
            }
            Err(e) => {
                // Leave the session open so the user can retry or cancel.
                session.state = EditState::AwaitingContent;
                let _ = fs::remove_file(&temp);
                Err(Error::Io(e))
            }
        }
    }

    /// Close without writing. Returns the abandoned session, if any.
    pub fn cancel(&self, user_id: &str) -> Option<EditSession> {
        self.sessions.lock().unwrap().remove(user_id)
    }

    pub fn current(&self, user_id: &str) -> Option<EditSession> {
        self.sessions.lock().unwrap().get(user_id).cloned()
    }

    pub fn is_open(&self, user_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_and_submit_replaces_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "old").unwrap();
        let manager = EditManager::new(20);

        let (session, content) = manager.open("42", dir.path(), "notes.txt").unwrap();
        assert_eq!(content, "old");
        assert_eq!(session.state, EditState::AwaitingContent);

        let path = manager.submit("42", "hello").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "hello");
        assert!(!manager.is_open("42"));
    }

    #[test]
    fn cancel_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "old").unwrap();
        let manager = EditManager::new(20);
        manager.open("42", dir.path(), "notes.txt").unwrap();
        manager.cancel("42");
        assert_eq!(
            fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "old"
        );
        assert!(matches!(manager.submit("42", "x"), Err(Error::NoEditSession)));
    }

    #[test]
    fn second_open_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        let manager = EditManager::new(20);
        manager.open("42", dir.path(), "a.txt").unwrap();
        assert!(matches!(
            manager.open("42", dir.path(), "b.txt"),
            Err(Error::EditSessionOpen(_))
        ));
        // A different user is unaffected.
        manager.open("7", dir.path(), "b.txt").unwrap();
    }

    #[test]
    fn path_escape_is_rejected() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(dir.path().join("secret.txt"), "s").unwrap();
        let manager = EditManager::new(20);
        let result = manager.open("42", &sub, "../secret.txt");
        assert!(matches!(result, Err(Error::PathOutsideRoot(_))));
    }

    #[test]
    fn listing_is_paginated_and_files_only() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let manager = EditManager::new(2);
        let first = manager.list_files(dir.path(), 0).unwrap();
        assert_eq!(first.files, vec!["a.txt", "b.txt"]);
        assert!(first.has_more);
        let second = manager.list_files(dir.path(), 1).unwrap();
        assert_eq!(second.files, vec!["c.txt"]);
        assert!(!second.has_more);
    }
}
