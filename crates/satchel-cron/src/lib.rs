// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduled tasks: a minimal schedule grammar, a durable JSON-file task
//! store, and the tick driver that injects task commands into the dispatcher.

pub mod driver;
pub mod schedule;
pub mod store;

pub use driver::{Scheduler, TaskExecutor, Trigger};
pub use schedule::{next_run_at, Schedule};
pub use store::{ScheduledTask, TaskStore};
