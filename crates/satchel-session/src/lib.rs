// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session engine: sole owner of the authenticated connection to the
//! remote self-chat endpoint.
//!
//! Responsibilities:
//! - login handshake (ticket fetch, QR poll, credential capture)
//! - long-poll message retrieval with reconnect-and-backoff
//! - heartbeat probing
//! - outbound text/file sends and media downloads
//! - HTTP trace recording with credential redaction
//!
//! All session-state mutation happens behind one mutex inside
//! [`engine::SessionEngine`]; the poll loop and heartbeat share a single
//! actor task so they cannot race on the sync cursor or reconnect counter.

pub mod engine;
pub mod protocol;
pub mod state;
pub mod trace;

pub use engine::{LoginStatusDetail, SessionEngine, SessionEvent};
pub use protocol::{LoginPoll, RemoteClient, RemoteHosts, SyncStatus};
pub use state::{Credentials, LoginState, SessionState, SyncKey};
pub use trace::TraceRecorder;
