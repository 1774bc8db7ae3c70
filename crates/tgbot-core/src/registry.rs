// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Durable tab ↔ session registry
//!
//! Tab identifiers are generated once and survive restarts; the multiplexer
//! session name is derived from the tab id, never stored input. Writes go
//! through a temp file and a rename so a crash cannot leave a torn file.
//! Reconciliation aligns the persisted records with the live session set.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use tgbot_mux::{session_name, TerminalDriver, SESSION_PREFIX};

use crate::error::{Error, Result};

const SCHEMA_VERSION: u32 = 1;

/// Whether the tab's backing session is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Active,
    /// Present in the registry but the session is gone and was not recreated.
    Broken,
}

/// A persisted tab record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabRecord {
    pub tab_id: String,
    pub user_id: String,
    pub display_name: String,
    pub session_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default = "default_status")]
    pub status: TabStatus,
}

fn default_status() -> TabStatus {
    TabStatus::Active
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    tabs: BTreeMap<String, TabRecord>,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    /// Tabs whose sessions were recreated.
    pub recreated: Vec<String>,
    /// Tabs marked broken because their session is gone.
    pub broken: Vec<String>,
    /// Live `tgbot_*` sessions with no registry entry. Reported, not killed.
    pub orphans: Vec<String>,
}

/// Durable registry with a single internal writer.
pub struct TagRegistry {
    path: PathBuf,
    tabs: Mutex<BTreeMap<String, TabRecord>>,
}

impl TagRegistry {
    /// Load the registry; a missing file is an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tabs = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&contents)?;
            file.tabs
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            tabs: Mutex::new(tabs),
        })
    }

    fn save_locked(&self, tabs: &BTreeMap<String, TabRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = RegistryFile {
            version: SCHEMA_VERSION,
            tabs: tabs.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        let temp = self.path.with_extension("tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    /// Create a tab. `(user_id, display_name)` must be unique per user.
    pub fn create_tab(&self, user_id: &str, display_name: &str) -> Result<TabRecord> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(Error::InvalidTabName("name must not be empty".to_string()));
        }
        let mut tabs = self.tabs.lock().unwrap();
        if tabs
            .values()
            .any(|t| t.user_id == user_id && t.display_name == display_name)
        {
            return Err(Error::DuplicateTabName(display_name.to_string()));
        }
        let tab_id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let record = TabRecord {
            session_name: session_name(&tab_id),
            tab_id: tab_id.clone(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            created_at: now,
            last_used_at: now,
            status: TabStatus::Active,
        };
        tabs.insert(tab_id, record.clone());
        self.save_locked(&tabs)?;
        Ok(record)
    }

    pub fn rename_tab(&self, tab_id: &str, new_name: &str) -> Result<TabRecord> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(Error::InvalidTabName("name must not be empty".to_string()));
        }
        let mut tabs = self.tabs.lock().unwrap();
        let user_id = tabs
            .get(tab_id)
            .ok_or_else(|| Error::TabNotFound(tab_id.to_string()))?
            .user_id
            .clone();
        if tabs
            .values()
            .any(|t| t.user_id == user_id && t.display_name == new_name && t.tab_id != tab_id)
        {
            return Err(Error::DuplicateTabName(new_name.to_string()));
        }
        let record = tabs.get_mut(tab_id).expect("checked above");
        record.display_name = new_name.to_string();
        let updated = record.clone();
        self.save_locked(&tabs)?;
        Ok(updated)
    }

    pub fn close_tab(&self, tab_id: &str) -> Result<TabRecord> {
        let mut tabs = self.tabs.lock().unwrap();
        let record = tabs
            .remove(tab_id)
            .ok_or_else(|| Error::TabNotFound(tab_id.to_string()))?;
        self.save_locked(&tabs)?;
        Ok(record)
    }

    pub fn get(&self, tab_id: &str) -> Option<TabRecord> {
        self.tabs.lock().unwrap().get(tab_id).cloned()
    }

    pub fn list_tabs(&self, user_id: &str) -> Vec<TabRecord> {
        let tabs = self.tabs.lock().unwrap();
        let mut records: Vec<TabRecord> =
            tabs.values().filter(|t| t.user_id == user_id).cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Stamp `last_used_at` on command dispatch. Best-effort persistence.
    pub fn touch(&self, tab_id: &str) {
        let mut tabs = self.tabs.lock().unwrap();
        if let Some(record) = tabs.get_mut(tab_id) {
            record.last_used_at = Utc::now();
            if let Err(e) = self.save_locked(&tabs) {
                warn!(tab_id, error = %e, "failed to persist last_used_at");
            }
        }
    }

    /// Mark a tab usable again after its session was recreated on demand.
    pub fn mark_active(&self, tab_id: &str) -> Result<()> {
        let mut tabs = self.tabs.lock().unwrap();
        let record = tabs
            .get_mut(tab_id)
            .ok_or_else(|| Error::TabNotFound(tab_id.to_string()))?;
        record.status = TabStatus::Active;
        self.save_locked(&tabs)
    }

    /// Align the registry with the live session set.
    ///
    /// Missing sessions are recreated when `create_missing` is set, otherwise
    /// the tab is marked broken. Live `tgbot_*` sessions without a record are
    /// reported as orphans and left alone. Running this twice in a row is a
    /// fixed point.
    pub async fn reconcile(
        &self,
        driver: &dyn TerminalDriver,
        create_missing: bool,
    ) -> Result<ReconcileReport> {
        let snapshot: Vec<TabRecord> = {
            let tabs = self.tabs.lock().unwrap();
            tabs.values().cloned().collect()
        };
        let live: Vec<String> = driver
            .list_sessions()
            .await
            .map_err(|e| Error::Config(format!("cannot list sessions: {e}")))?;

        let mut report = ReconcileReport::default();
        let mut statuses: BTreeMap<String, TabStatus> = BTreeMap::new();

        for record in &snapshot {
            if live.iter().any(|s| *s == record.session_name) {
                statuses.insert(record.tab_id.clone(), TabStatus::Active);
                continue;
            }
            if create_missing {
                match driver.create_session(&record.tab_id).await {
                    Ok(()) => {
                        info!(tab_id = %record.tab_id, "recreated missing session");
                        report.recreated.push(record.tab_id.clone());
                        statuses.insert(record.tab_id.clone(), TabStatus::Active);
                    }
                    Err(e) => {
                        warn!(tab_id = %record.tab_id, error = %e, "could not recreate session");
                        report.broken.push(record.tab_id.clone());
                        statuses.insert(record.tab_id.clone(), TabStatus::Broken);
                    }
                }
            } else {
                report.broken.push(record.tab_id.clone());
                statuses.insert(record.tab_id.clone(), TabStatus::Broken);
            }
        }

        for session in &live {
            if session.starts_with(SESSION_PREFIX)
                && !snapshot.iter().any(|r| r.session_name == *session)
            {
                warn!(%session, "orphan session has no registry entry");
                report.orphans.push(session.clone());
            }
        }

        let mut tabs = self.tabs.lock().unwrap();
        let mut changed = false;
        for (tab_id, status) in statuses {
            if let Some(record) = tabs.get_mut(&tab_id) {
                if record.status != status {
                    record.status = status;
                    changed = true;
                }
            }
        }
        if changed {
            self.save_locked(&tabs)?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tgbot_mux::testing::InMemoryDriver;

    fn registry(dir: &TempDir) -> TagRegistry {
        TagRegistry::load(dir.path().join("registry.json")).unwrap()
    }

    #[test]
    fn tab_id_is_stable_across_reload() {
        let dir = TempDir::new().unwrap();
        let created = registry(&dir).create_tab("42", "build").unwrap();

        let reloaded = registry(&dir);
        let record = reloaded.get(&created.tab_id).unwrap();
        assert_eq!(record.tab_id, created.tab_id);
        assert_eq!(record.session_name, format!("tgbot_{}", created.tab_id));
        assert_eq!(record.display_name, "build");
    }

    #[test]
    fn duplicate_names_rejected_per_user() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.create_tab("42", "build").unwrap();
        assert!(matches!(
            registry.create_tab("42", "build"),
            Err(Error::DuplicateTabName(_))
        ));
        // A different user may reuse the name.
        registry.create_tab("7", "build").unwrap();
    }

    #[test]
    fn rename_checks_uniqueness() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let a = registry.create_tab("42", "a").unwrap();
        registry.create_tab("42", "b").unwrap();
        assert!(matches!(
            registry.rename_tab(&a.tab_id, "b"),
            Err(Error::DuplicateTabName(_))
        ));
        registry.rename_tab(&a.tab_id, "c").unwrap();
        assert_eq!(registry.get(&a.tab_id).unwrap().display_name, "c");
    }

    #[tokio::test]
    async fn reconcile_recreates_missing_sessions() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let driver = InMemoryDriver::new();
        let tab = registry.create_tab("42", "build").unwrap();
        // Session never created; reconcile should bring it up.
        let report = registry.reconcile(&driver, true).await.unwrap();
        assert_eq!(report.recreated, vec![tab.tab_id.clone()]);
        assert!(driver.has_session(&tab.tab_id).await.unwrap());
        assert_eq!(registry.get(&tab.tab_id).unwrap().status, TabStatus::Active);
    }

    #[tokio::test]
    async fn reconcile_marks_broken_without_create() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let driver = InMemoryDriver::new();
        let tab = registry.create_tab("42", "build").unwrap();
        let report = registry.reconcile(&driver, false).await.unwrap();
        assert_eq!(report.broken, vec![tab.tab_id.clone()]);
        assert_eq!(registry.get(&tab.tab_id).unwrap().status, TabStatus::Broken);
    }

    #[tokio::test]
    async fn reconcile_reports_orphans_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let driver = InMemoryDriver::new();
        driver.add_raw_session("tgbot_orphan");
        driver.add_raw_session("unrelated");

        let first = registry.reconcile(&driver, true).await.unwrap();
        assert_eq!(first.orphans, vec!["tgbot_orphan".to_string()]);

        let second = registry.reconcile(&driver, true).await.unwrap();
        assert_eq!(second.orphans, first.orphans);
        assert!(second.recreated.is_empty());
        assert!(second.broken.is_empty());
        // The orphan must still be alive.
        assert!(driver
            .list_sessions()
            .await
            .unwrap()
            .contains(&"tgbot_orphan".to_string()));
    }
}
