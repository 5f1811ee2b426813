// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management: PRAGMA setup, WAL mode, schema, lifecycle.

use satchel_core::SatchelError;

/// Wrapper around the single tokio-rusqlite connection.
///
/// tokio-rusqlite serializes all closure calls on one background thread,
/// which gives the update log its single-writer discipline for free.
pub struct Database {
    conn: tokio_rusqlite::Connection,
    path: String,
}

impl Database {
    /// Open (or create) the database at `path`, apply pragmas, and create
    /// the schema if missing.
    pub async fn open(path: &str) -> Result<Self, SatchelError> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(SatchelError::storage)?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA foreign_keys=ON;",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        Ok(Self {
            conn,
            path: path.to_string(),
        })
    }

    /// The underlying connection. Query code calls through `connection().call()`.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Filesystem path of the database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the connection, flushing WAL state.
    pub async fn close(self) -> Result<(), SatchelError> {
        self.conn
            .close()
            .await
            .map_err(|e| SatchelError::storage(e))
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id   TEXT UNIQUE,
    direction   TEXT NOT NULL,
    text        TEXT NOT NULL,
    file_name   TEXT,
    file_kind   TEXT,
    stored_path TEXT,
    file_size   INTEGER,
    reply_to_id INTEGER,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
CREATE INDEX IF NOT EXISTS idx_messages_remote_id ON messages(remote_id);
";

/// Map a tokio-rusqlite error into the workspace error type.
pub(crate) fn map_tr_err(err: tokio_rusqlite::Error) -> SatchelError {
    SatchelError::Storage {
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();

        let count: i64 = db
            .connection()
            .call(|conn| {
                let n = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='messages'",
                    [],
                    |row| row.get(0),
                )?;
                Ok::<i64, rusqlite::Error>(n)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        db.close().await.unwrap();
        let db = Database::open(path.to_str().unwrap()).await.unwrap();
        db.close().await.unwrap();
    }
}
