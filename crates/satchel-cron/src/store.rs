// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable scheduled-task store.
//!
//! Tasks live in a single JSON file. Every mutation rewrites the file before
//! returning, so an acknowledged change survives a crash. The scheduler is
//! the only writer of `last_run_at`/`next_run_at`; management operations
//! touch the other fields.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use satchel_core::{Result, SatchelError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::schedule::{next_run_at, Schedule};

/// A persisted scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Schedule expression (see the grammar in [`crate::schedule`]).
    pub schedule: String,
    pub command_text: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    pub created_at: i64,
    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub next_run_at: Option<i64>,
}

impl ScheduledTask {
    fn parsed_schedule(&self) -> Option<Schedule> {
        self.schedule.parse().ok()
    }

    fn anchor(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created_at, 0).unwrap_or_else(Utc::now)
    }
}

/// Handle to the task set. Cheap to clone; all clones share one file.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Mutex<BTreeMap<String, ScheduledTask>>>,
    path: PathBuf,
}

impl TaskStore {
    /// Load the store from `path`, tolerating a missing file. Entries with
    /// unparseable schedules are kept but disabled.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tasks = BTreeMap::new();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<ScheduledTask>>(&raw) {
                Ok(entries) => {
                    let now = Utc::now();
                    for mut task in entries {
                        match task.parsed_schedule() {
                            Some(schedule) => {
                                if task.next_run_at.is_none() {
                                    task.next_run_at =
                                        Some(next_run_at(schedule, task.anchor(), now).timestamp());
                                }
                            }
                            None => {
                                warn!(
                                    task_id = task.id.as_str(),
                                    schedule = task.schedule.as_str(),
                                    "task has invalid schedule, disabling"
                                );
                                task.enabled = false;
                            }
                        }
                        tasks.insert(task.id.clone(), task);
                    }
                }
                Err(e) => warn!(error = %e, "task file unreadable, starting empty"),
            }
        }
        Self {
            inner: Arc::new(Mutex::new(tasks)),
            path,
        }
    }

    /// Validate and add a task. The file is written before this returns.
    pub fn add(
        &self,
        schedule_expr: &str,
        command_text: &str,
        description: &str,
    ) -> Result<ScheduledTask> {
        let schedule: Schedule = schedule_expr.parse()?;
        let command_text = command_text.trim();
        if command_text.is_empty() {
            return Err(SatchelError::InvalidArgument(
                "task command text must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let task = {
            let mut tasks = self.lock()?;
            let mut id = format!("task_{}", now.timestamp_millis());
            let mut bump = 0;
            while tasks.contains_key(&id) {
                bump += 1;
                id = format!("task_{}_{bump}", now.timestamp_millis());
            }
            let task = ScheduledTask {
                id: id.clone(),
                schedule: schedule_expr.trim().to_string(),
                command_text: command_text.to_string(),
                enabled: true,
                description: description.trim().to_string(),
                created_at: now.timestamp(),
                last_run_at: None,
                next_run_at: Some(next_run_at(schedule, now, now).timestamp()),
            };
            tasks.insert(id, task.clone());
            self.save_locked(&tasks)?;
            task
        };
        Ok(task)
    }

    /// Remove a task. Returns false when the id is unknown.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut tasks = self.lock()?;
        let removed = tasks.remove(id).is_some();
        if removed {
            self.save_locked(&tasks)?;
        }
        Ok(removed)
    }

    /// Enable or disable a task. Returns false when the id is unknown.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut tasks = self.lock()?;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(false);
        };
        task.enabled = enabled;
        if enabled
            && let Some(schedule) = task.parsed_schedule()
        {
            // Re-enabling recomputes the horizon so a long-disabled task does
            // not fire immediately for every missed window.
            task.next_run_at = Some(next_run_at(schedule, task.anchor(), Utc::now()).timestamp());
        }
        self.save_locked(&tasks)?;
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.lock()?.get(id).cloned())
    }

    /// All tasks ordered by id.
    pub fn list(&self) -> Result<Vec<ScheduledTask>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    pub fn counts(&self) -> Result<(usize, usize)> {
        let tasks = self.lock()?;
        let enabled = tasks.values().filter(|t| t.enabled).count();
        Ok((tasks.len(), enabled))
    }

    /// Enabled tasks whose cached next-run is due at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .lock()?
            .values()
            .filter(|t| {
                t.enabled
                    && t.next_run_at
                        .map(|next| next <= now.timestamp())
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    /// Record a run: advance `last_run_at` and recompute `next_run_at`.
    pub fn mark_ran(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.lock()?;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(());
        };
        task.last_run_at = Some(now.timestamp());
        if let Some(schedule) = task.parsed_schedule() {
            task.next_run_at = Some(next_run_at(schedule, task.anchor(), now).timestamp());
        }
        self.save_locked(&tasks)?;
        Ok(())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, ScheduledTask>>> {
        self.inner
            .lock()
            .map_err(|_| SatchelError::Internal("task store poisoned".to_string()))
    }

    fn save_locked(&self, tasks: &BTreeMap<String, ScheduledTask>) -> Result<()> {
        let entries: Vec<&ScheduledTask> = tasks.values().collect();
        let raw = serde_json::to_string_pretty(&entries)
            .map_err(|e| SatchelError::Internal(format!("task serialization: {e}")))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_list_delete_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let store = TaskStore::load(&path);

        let task = store.add("08:30", "/status", "morning check").unwrap();
        assert!(task.enabled);
        assert!(task.next_run_at.is_some());

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].command_text, "/status");

        assert!(store.delete(&task.id).unwrap());
        assert!(!store.delete(&task.id).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn invalid_schedule_is_rejected_at_add() {
        let dir = tempdir().unwrap();
        let store = TaskStore::load(dir.path().join("tasks.json"));
        assert!(store.add("25:00", "/status", "").is_err());
        assert!(store.add("every 0m", "/status", "").is_err());
        assert!(store.add("08:30", "   ", "").is_err());
    }

    #[test]
    fn mutations_survive_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let store = TaskStore::load(&path);
        let task = store.add("every 5m", "/ping", "").unwrap();
        store.set_enabled(&task.id, false).unwrap();

        let reloaded = TaskStore::load(&path);
        let tasks = reloaded.list().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task.id);
        assert!(!tasks[0].enabled);
        assert_eq!(tasks[0].schedule, "every 5m");
    }

    #[test]
    fn due_and_mark_ran_advance_monotonically() {
        let dir = tempdir().unwrap();
        let store = TaskStore::load(dir.path().join("tasks.json"));
        let task = store.add("every 1m", "/status", "").unwrap();

        let now = Utc::now();
        let later = now + chrono::Duration::seconds(61);
        let due = store.due(later).unwrap();
        assert_eq!(due.len(), 1);

        store.mark_ran(&task.id, later).unwrap();
        let after = store.get(&task.id).unwrap().unwrap();
        assert_eq!(after.last_run_at, Some(later.timestamp()));
        assert!(after.next_run_at.unwrap() > later.timestamp());

        // Immediately after a run nothing is due.
        assert!(store.due(later).unwrap().is_empty());
    }

    #[test]
    fn disabled_tasks_are_never_due() {
        let dir = tempdir().unwrap();
        let store = TaskStore::load(dir.path().join("tasks.json"));
        let task = store.add("every 1m", "/status", "").unwrap();
        store.set_enabled(&task.id, false).unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(store.due(later).unwrap().is_empty());
    }

    #[test]
    fn corrupted_schedule_on_disk_is_disabled_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[{"id":"task_1","schedule":"bogus","command_text":"/x","enabled":true,"created_at":0}]"#,
        )
        .unwrap();

        let store = TaskStore::load(&path);
        let tasks = store.list().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].enabled);
    }
}
