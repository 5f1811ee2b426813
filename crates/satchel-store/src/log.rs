// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The append-only ordered update log.
//!
//! Ids come from SQLite's AUTOINCREMENT rowid: strictly increasing, never
//! reused even after deletion, assigned atomically with the insert. Append
//! and id assignment therefore cannot race; no two callers ever observe the
//! same id.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use satchel_core::{Attachment, AttachmentKind, Direction, Message, NewMessage, SatchelError};
use serde::Serialize;

use crate::database::{map_tr_err, Database};

/// Counters reported by the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub message_count: i64,
    pub inbound_count: i64,
    pub max_update_id: i64,
    pub db_size_bytes: u64,
}

/// Handle to the message log. Cheap to clone; all clones share the single
/// writer connection.
#[derive(Clone)]
pub struct UpdateLog {
    db: Arc<Database>,
    default_limit: u32,
    max_limit: u32,
}

impl UpdateLog {
    pub fn new(db: Database, default_limit: u32, max_limit: u32) -> Self {
        Self {
            db: Arc::new(db),
            default_limit,
            max_limit,
        }
    }

    /// Append a message, assigning the next id. Returns the assigned id.
    ///
    /// Fails with `InvalidArgument` when `reply_to_id` references a missing
    /// message, and with `Storage` on a duplicate `remote_id`.
    pub async fn append(&self, msg: NewMessage) -> Result<i64, SatchelError> {
        let created_at = Utc::now().timestamp();
        let result = self
            .db
            .connection()
            .call(move |conn| {
                if let Some(reply_to) = msg.reply_to_id {
                    let exists: bool = conn
                        .query_row(
                            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
                            params![reply_to],
                            |row| row.get(0),
                        )?;
                    if !exists {
                        return Ok(Err(reply_to));
                    }
                }

                let (file_name, file_kind, stored_path, file_size) = match &msg.attachment {
                    Some(a) => (
                        Some(a.file_name.clone()),
                        Some(a.kind.to_string()),
                        a.stored_path.clone(),
                        a.size.map(|s| s as i64),
                    ),
                    None => (None, None, None, None),
                };

                conn.execute(
                    "INSERT INTO messages
                       (remote_id, direction, text, file_name, file_kind, stored_path, file_size, reply_to_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        msg.remote_id,
                        msg.direction.to_string(),
                        msg.text,
                        file_name,
                        file_kind,
                        stored_path,
                        file_size,
                        msg.reply_to_id,
                        created_at,
                    ],
                )?;
                Ok(Ok(conn.last_insert_rowid()))
            })
            .await
            .map_err(map_tr_err)?;

        result.map_err(|reply_to| {
            SatchelError::InvalidArgument(format!(
                "reply_to_id {reply_to} does not reference a stored message"
            ))
        })
    }

    /// Messages with `id > after_id`, ascending, at most `limit` (clamped to
    /// the configured maximum; `None` uses the default).
    pub async fn query(
        &self,
        after_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, SatchelError> {
        let limit = limit.unwrap_or(self.default_limit).min(self.max_limit) as i64;
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, remote_id, direction, text, file_name, file_kind,
                            stored_path, file_size, reply_to_id, created_at
                     FROM messages WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![after_id, limit], row_to_message)?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row?);
                }
                Ok(messages)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Fetch a single message by id.
    pub async fn get(&self, id: i64) -> Result<Message, SatchelError> {
        let found = self
            .db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, remote_id, direction, text, file_name, file_kind,
                            stored_path, file_size, reply_to_id, created_at
                     FROM messages WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map(params![id], row_to_message)?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_tr_err)?;

        found.ok_or_else(|| SatchelError::NotFound(format!("message {id}")))
    }

    /// Look up a message by the remote endpoint's id. Used for inbound dedup.
    pub async fn find_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<Message>, SatchelError> {
        let remote_id = remote_id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, remote_id, direction, text, file_name, file_kind,
                            stored_path, file_size, reply_to_id, created_at
                     FROM messages WHERE remote_id = ?1",
                )?;
                let mut rows = stmt.query_map(params![remote_id], row_to_message)?;
                match rows.next() {
                    Some(row) => Ok(Some(row?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    /// Record where a downloaded attachment landed on disk.
    pub async fn set_stored_path(&self, id: i64, path: &str) -> Result<(), SatchelError> {
        let path = path.to_string();
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE messages SET stored_path = ?2 WHERE id = ?1",
                    params![id, path],
                )?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Delete a single message. The id is never reassigned.
    pub async fn delete(&self, id: i64) -> Result<bool, SatchelError> {
        self.db
            .connection()
            .call(move |conn| {
                let n = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Bulk retention sweep: delete messages older than `retention_days`.
    /// Returns the number of rows removed.
    pub async fn purge_older_than(&self, retention_days: u32) -> Result<usize, SatchelError> {
        let cutoff = Utc::now().timestamp() - i64::from(retention_days) * 86_400;
        self.db
            .connection()
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM messages WHERE created_at < ?1",
                    params![cutoff],
                )?;
                Ok(n)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Highest id assigned so far (0 when the log is empty).
    pub async fn max_id(&self) -> Result<i64, SatchelError> {
        self.db
            .connection()
            .call(|conn| {
                let max: Option<i64> =
                    conn.query_row("SELECT MAX(id) FROM messages", [], |row| row.get(0))?;
                Ok(max.unwrap_or(0))
            })
            .await
            .map_err(map_tr_err)
    }

    /// Counters for the status surface.
    pub async fn stats(&self) -> Result<StoreStats, SatchelError> {
        let (message_count, inbound_count, max_update_id) = self
            .db
            .connection()
            .call(|conn| {
                let total: i64 =
                    conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
                let inbound: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE direction = 'inbound'",
                    [],
                    |row| row.get(0),
                )?;
                let max: Option<i64> =
                    conn.query_row("SELECT MAX(id) FROM messages", [], |row| row.get(0))?;
                Ok((total, inbound, max.unwrap_or(0)))
            })
            .await
            .map_err(map_tr_err)?;

        let db_size_bytes = std::fs::metadata(self.db.path())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            message_count,
            inbound_count,
            max_update_id,
            db_size_bytes,
        })
    }

    /// Close the underlying connection. Only succeeds once every clone has
    /// been dropped; otherwise a no-op.
    pub async fn close(self) -> Result<(), SatchelError> {
        match Arc::try_unwrap(self.db) {
            Ok(db) => db.close().await,
            Err(_) => Ok(()),
        }
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let file_name: Option<String> = row.get(4)?;
    let file_kind: Option<String> = row.get(5)?;
    let stored_path: Option<String> = row.get(6)?;
    let file_size: Option<i64> = row.get(7)?;

    let attachment = file_name.map(|name| Attachment {
        file_name: name,
        kind: match file_kind.as_deref() {
            Some("image") => AttachmentKind::Image,
            _ => AttachmentKind::File,
        },
        stored_path,
        size: file_size.map(|s| s as u64),
    });

    let direction: String = row.get(2)?;
    Ok(Message {
        id: row.get(0)?,
        remote_id: row.get(1)?,
        direction: if direction == "outbound" {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        text: row.get(3)?,
        attachment,
        reply_to_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}
