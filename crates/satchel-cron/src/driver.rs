// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scheduler driver.
//!
//! Ticks on a fixed interval, executes every due task through the
//! [`TaskExecutor`], and records the run. "Run now" requests arrive on a
//! channel so they execute on the same task as scheduled runs; the driver is
//! the only mutator of `last_run_at`/`next_run_at`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{ScheduledTask, TaskStore};

/// What caused a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    Manual,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Schedule => write!(f, "schedule"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Executes one task's command text. Implemented over the command dispatcher
/// by the serve wiring; failures must be swallowed there, never bubbled into
/// the driver.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &ScheduledTask, trigger: Trigger);
}

/// The scheduler: owns the tick loop and the run-now channel.
pub struct Scheduler {
    store: TaskStore,
    executor: Arc<dyn TaskExecutor>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(store: TaskStore, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            store,
            executor,
            tick: Duration::from_secs(30),
        }
    }

    /// Override the tick interval. Tests use sub-second ticks.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Drive the scheduler until cancelled. `run_now_rx` receives task ids
    /// for manual execution.
    pub async fn run(
        self,
        mut run_now_rx: mpsc::Receiver<String>,
        cancel: CancellationToken,
    ) {
        info!(tick_secs = self.tick.as_secs(), "scheduler running");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => self.run_due().await,
                request = run_now_rx.recv() => {
                    match request {
                        Some(task_id) => self.run_one(&task_id).await,
                        None => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("scheduler stopped");
    }

    /// Execute every due task exactly once for this tick.
    async fn run_due(&self) {
        let now = Utc::now();
        let due = match self.store.due(now) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "due-task query failed");
                return;
            }
        };

        for task in due {
            debug!(task_id = task.id.as_str(), "task due");
            // Advance the horizon before executing so a slow command cannot
            // double-fire on the next tick.
            if let Err(e) = self.store.mark_ran(&task.id, now) {
                warn!(error = %e, task_id = task.id.as_str(), "mark_ran failed");
                continue;
            }
            self.executor.execute(&task, Trigger::Schedule).await;
        }
    }

    /// Execute one task regardless of due-ness, still recording the run.
    async fn run_one(&self, task_id: &str) {
        let task = match self.store.get(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "run-now for unknown task");
                return;
            }
            Err(e) => {
                warn!(error = %e, "run-now lookup failed");
                return;
            }
        };
        if let Err(e) = self.store.mark_ran(task_id, Utc::now()) {
            warn!(error = %e, task_id, "mark_ran failed");
        }
        self.executor.execute(&task, Trigger::Manual).await;
    }
}
