// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session state: login FSM data, credentials, sync cursor, persistence.
//!
//! Invariant: `login_state == LoggedIn` implies `credentials.is_some()` and a
//! usable sync cursor. Every transition out of `LoggedIn` goes through
//! [`SessionState::invalidate`], which clears the cursor.

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};
use satchel_core::{Result, SatchelError};

/// States of the login FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginState {
    /// No session; a login ticket must be requested.
    LoggedOut,
    /// Ticket issued, QR displayed, waiting for the scan.
    AwaitingScan,
    /// Remote reports the code was scanned but not yet confirmed.
    Scanned,
    /// Handshake complete; credentials and sync cursor are valid.
    LoggedIn,
}

impl std::fmt::Display for LoginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoginState::LoggedOut => write!(f, "logged_out"),
            LoginState::AwaitingScan => write!(f, "awaiting_scan"),
            LoginState::Scanned => write!(f, "scanned"),
            LoginState::LoggedIn => write!(f, "logged_in"),
        }
    }
}

/// Opaque token bundle issued by the remote endpoint at handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub skey: String,
    pub sid: String,
    pub uin: String,
    pub pass_ticket: String,
}

impl Credentials {
    /// True when every field the remote requires is present.
    pub fn is_complete(&self) -> bool {
        !self.skey.is_empty()
            && !self.sid.is_empty()
            && !self.uin.is_empty()
            && !self.pass_ticket.is_empty()
    }
}

/// One entry of the remote sync key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKeyEntry {
    #[serde(rename = "Key")]
    pub key: i64,
    #[serde(rename = "Val")]
    pub val: i64,
}

/// The remote long-poll position marker. Advances only on successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncKey {
    #[serde(rename = "Count", default)]
    pub count: i64,
    #[serde(rename = "List", default)]
    pub list: Vec<SyncKeyEntry>,
}

impl SyncKey {
    /// The `k_v|k_v` form the synccheck endpoint expects.
    pub fn check_format(&self) -> String {
        self.list
            .iter()
            .map(|e| format!("{}_{}", e.key, e.val))
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn is_valid(&self) -> bool {
        !self.list.is_empty()
    }
}

/// A persisted cookie (name/value is all the remote cares about).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

/// The whole of the session engine's mutable state, one instance per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub login_state: LoginState,
    pub credentials: Option<Credentials>,
    pub sync_key: SyncKey,
    pub user_name: String,
    pub device_id: String,
    /// Current login ticket (QR uuid) and its fetch time (unix seconds).
    pub login_ticket: Option<String>,
    pub ticket_fetched_at: i64,
    /// Unix seconds of the last successful poll or probe.
    pub last_heartbeat_at: i64,
    /// Consecutive poll failures. Reset to 0 by any successful poll.
    pub reconnect_attempts: u32,
    /// Cookies captured from the handshake, persisted across restarts.
    pub cookies: Vec<StoredCookie>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            login_state: LoginState::LoggedOut,
            credentials: None,
            sync_key: SyncKey::default(),
            user_name: String::new(),
            device_id: generate_device_id(),
            login_ticket: None,
            ticket_fetched_at: 0,
            last_heartbeat_at: 0,
            reconnect_attempts: 0,
            cookies: Vec::new(),
        }
    }
}

impl SessionState {
    /// True when the persisted credential bundle could plausibly resume a
    /// session without a new scan.
    pub fn has_auth(&self) -> bool {
        self.credentials
            .as_ref()
            .map(Credentials::is_complete)
            .unwrap_or(false)
    }

    /// Transition out of `LoggedIn`: drop the sync cursor so a stale cursor
    /// can never be replayed against a new login.
    pub fn invalidate(&mut self) {
        self.login_state = LoginState::LoggedOut;
        self.sync_key = SyncKey::default();
        self.credentials = None;
        self.login_ticket = None;
    }

    /// Load persisted state from `path`, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<SessionState>(&raw) {
                Ok(mut state) => {
                    // A restart never resumes mid-handshake; either the
                    // credential bundle is complete or we start over.
                    if state.has_auth() {
                        state.login_state = LoginState::LoggedIn;
                    } else {
                        state.invalidate();
                    }
                    state.reconnect_attempts = 0;
                    state.login_ticket = None;
                    state
                }
                Err(e) => {
                    tracing::warn!(error = %e, "state file unreadable, starting fresh");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persist to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| SatchelError::Internal(format!("state serialization: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// 15-digit random device id, generated once and persisted.
pub fn generate_device_id() -> String {
    let mut rng = rand::thread_rng();
    (0..15)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn logged_in_state() -> SessionState {
        SessionState {
            login_state: LoginState::LoggedIn,
            credentials: Some(Credentials {
                skey: "@crypt_k".to_string(),
                sid: "sid1".to_string(),
                uin: "42".to_string(),
                pass_ticket: "pt".to_string(),
            }),
            sync_key: SyncKey {
                count: 1,
                list: vec![SyncKeyEntry { key: 1, val: 100 }],
            },
            ..SessionState::default()
        }
    }

    #[test]
    fn invalidate_clears_cursor_and_credentials() {
        let mut state = logged_in_state();
        state.invalidate();
        assert_eq!(state.login_state, LoginState::LoggedOut);
        assert!(!state.sync_key.is_valid());
        assert!(state.credentials.is_none());
    }

    #[test]
    fn synckey_check_format() {
        let key = SyncKey {
            count: 2,
            list: vec![
                SyncKeyEntry { key: 1, val: 100 },
                SyncKeyEntry { key: 2, val: 200 },
            ],
        };
        assert_eq!(key.check_format(), "1_100|2_200");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let state = logged_in_state();
        state.save(&path).unwrap();

        let loaded = SessionState::load_or_default(&path);
        assert_eq!(loaded.login_state, LoginState::LoggedIn);
        assert_eq!(loaded.credentials, state.credentials);
        assert_eq!(loaded.sync_key, state.sync_key);
        assert_eq!(loaded.reconnect_attempts, 0);
    }

    #[test]
    fn load_missing_file_defaults_to_logged_out() {
        let dir = tempdir().unwrap();
        let state = SessionState::load_or_default(&dir.path().join("nope.json"));
        assert_eq!(state.login_state, LoginState::LoggedOut);
        assert!(!state.has_auth());
        assert_eq!(state.device_id.len(), 15);
    }

    #[test]
    fn load_with_partial_credentials_starts_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = logged_in_state();
        state.credentials = Some(Credentials {
            skey: String::new(),
            ..state.credentials.unwrap()
        });
        state.save(&path).unwrap();

        let loaded = SessionState::load_or_default(&path);
        assert_eq!(loaded.login_state, LoginState::LoggedOut);
        assert!(loaded.credentials.is_none());
    }
}
