// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence for the ordered update log.
//!
//! All writes are serialized through tokio-rusqlite's single background
//! thread. The [`database::Database`] struct IS the single writer; do NOT
//! create additional connections for writes. Reads go through the same
//! connection and therefore never observe a partially written record.

pub mod database;
pub mod log;

pub use database::Database;
pub use log::{StoreStats, UpdateLog};
