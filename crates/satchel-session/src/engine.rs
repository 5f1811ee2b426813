// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session engine: login FSM driver, poll loop, heartbeat, reconnect.
//!
//! One actor task ([`SessionEngine::run`]) owns the poll loop and the
//! heartbeat timer via a single `select!`, so every session-state mutation is
//! serialized behind the state mutex with no second writer. Send operations
//! read a credential snapshot and never mutate session state.
//!
//! Inbound messages are appended to the update log in arrival order and then
//! forwarded as [`SessionEvent`]s; the consumer (dispatcher wiring) decides
//! what to do with them.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use satchel_config::SatchelConfig;
use satchel_core::{Direction, Message, NewMessage, Result, SatchelError};
use satchel_store::UpdateLog;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{normalize, LoginPoll, RemoteClient, RemoteHosts, RemoteMessage, SyncStatus};
use crate::state::{LoginState, SessionState};
use crate::trace::TraceRecorder;

/// Login tickets expire remotely after roughly four minutes.
const TICKET_MAX_AGE_SECS: i64 = 240;
/// Pause between login polls / idle checks when not logged in.
const LOGIN_POLL_PAUSE: Duration = Duration::from_secs(2);
/// Ceiling for exponential reconnect backoff.
const MAX_BACKOFF_SECS: u64 = 60;
/// Raw remote messages kept around for media downloads.
const RAW_CACHE_LIMIT: usize = 500;

/// Events emitted by the engine for the dispatch wiring.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new inbound message was appended to the update log.
    Inbound(Message),
    /// The handshake completed; the session is live.
    LoggedIn,
    /// The session ended (explicit logout, invalidation, or reconnect cap).
    LoggedOut { reason: String },
}

/// Snapshot returned by the login-status surface.
#[derive(Debug, Clone, Serialize)]
pub struct LoginStatusDetail {
    pub logged_in: bool,
    pub state: String,
    /// Boundary status code: 200 confirmed, 201 scanned, 408 waiting.
    pub code: u16,
    pub has_ticket: bool,
    pub ticket_age_secs: Option<i64>,
    pub user_name: String,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: i64,
    pub trace_enabled: bool,
}

pub struct SessionEngine {
    client: RemoteClient,
    state: Mutex<SessionState>,
    /// Serializes the whole login-poll round trip so the engine loop and the
    /// HTTP surface cannot run two handshakes at once.
    login_gate: Mutex<()>,
    log: UpdateLog,
    events: mpsc::Sender<SessionEvent>,
    state_path: PathBuf,
    download_dir: PathBuf,
    auto_download: bool,
    max_upload_bytes: u64,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    /// Raw remote messages by remote id, for later media downloads.
    raw_cache: std::sync::Mutex<(HashMap<String, RemoteMessage>, VecDeque<String>)>,
}

impl SessionEngine {
    /// Build the engine from configuration, restoring persisted state.
    pub fn new(
        config: &SatchelConfig,
        log: UpdateLog,
        trace: Arc<TraceRecorder>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>)> {
        let hosts = RemoteHosts::resolve(&config.remote.entry_host);
        let client = RemoteClient::new(
            hosts,
            trace,
            Duration::from_secs(config.session.poll_timeout_secs),
        )?;
        Self::with_client(config, client, log)
    }

    /// Build the engine around an existing client. Tests use this to point at
    /// a mock remote.
    pub fn with_client(
        config: &SatchelConfig,
        client: RemoteClient,
        log: UpdateLog,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SessionEvent>)> {
        let state_path = PathBuf::from(&config.storage.state_path);
        let state = SessionState::load_or_default(&state_path);
        if state.login_state == LoginState::LoggedIn {
            info!(user = state.user_name.as_str(), "resuming persisted session");
        }
        client.restore_cookies(&state.cookies);

        let (tx, rx) = mpsc::channel(256);
        let engine = Arc::new(Self {
            client,
            state: Mutex::new(state),
            login_gate: Mutex::new(()),
            log,
            events: tx,
            state_path,
            download_dir: PathBuf::from(&config.files.download_dir),
            auto_download: config.files.auto_download,
            max_upload_bytes: config.files.max_upload_bytes,
            heartbeat_interval: Duration::from_secs(config.session.heartbeat_interval_secs),
            reconnect_delay: Duration::from_secs(config.session.reconnect_delay_secs),
            max_reconnect_attempts: config.session.max_reconnect_attempts,
            raw_cache: std::sync::Mutex::new((HashMap::new(), VecDeque::new())),
        });
        Ok((engine, rx))
    }

    /// The engine actor: drives login polling, the message poll loop, and the
    /// heartbeat until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("session engine running");
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it.
        heartbeat.tick().await;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.login_state().await {
                LoginState::LoggedIn => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.poll_once() => {
                            if let Err(e) = result {
                                self.handle_poll_failure(&e, &cancel).await;
                            }
                        }
                        _ = heartbeat.tick() => {
                            if let Err(e) = self.heartbeat_probe().await {
                                self.handle_poll_failure(&e, &cancel).await;
                            }
                        }
                    }
                }
                LoginState::AwaitingScan | LoginState::Scanned => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(LOGIN_POLL_PAUSE) => {
                            if let Err(e) = self.poll_login_once().await {
                                debug!(error = %e, "login poll failed");
                            }
                        }
                    }
                }
                LoginState::LoggedOut => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(LOGIN_POLL_PAUSE) => {}
                    }
                }
            }
        }

        if let Err(e) = self.persist().await {
            warn!(error = %e, "final state persist failed");
        }
        info!("session engine stopped");
    }

    /// Current login state.
    pub async fn login_state(&self) -> LoginState {
        self.state.lock().await.login_state
    }

    /// Status snapshot for the HTTP surface.
    pub async fn login_status(&self) -> LoginStatusDetail {
        let state = self.state.lock().await;
        let code = match state.login_state {
            LoginState::LoggedIn => 200,
            LoginState::Scanned => 201,
            LoginState::AwaitingScan => 408,
            LoginState::LoggedOut => 408,
        };
        LoginStatusDetail {
            logged_in: state.login_state == LoginState::LoggedIn,
            state: state.login_state.to_string(),
            code,
            has_ticket: state.login_ticket.is_some(),
            ticket_age_secs: state
                .login_ticket
                .as_ref()
                .map(|_| Utc::now().timestamp() - state.ticket_fetched_at),
            user_name: state.user_name.clone(),
            reconnect_attempts: state.reconnect_attempts,
            last_heartbeat_at: state.last_heartbeat_at,
            trace_enabled: self.client.trace().enabled(),
        }
    }

    /// Fetch the login QR PNG, requesting a fresh ticket when the current one
    /// is missing or stale. Returns `None` when already logged in.
    pub async fn login_qr(&self) -> Result<Option<Vec<u8>>> {
        let _gate = self.login_gate.lock().await;

        let ticket = {
            let state = self.state.lock().await;
            if state.login_state == LoginState::LoggedIn {
                return Ok(None);
            }
            let fresh = Utc::now().timestamp() - state.ticket_fetched_at < TICKET_MAX_AGE_SECS;
            state.login_ticket.clone().filter(|_| fresh)
        };

        let ticket = match ticket {
            Some(t) => t,
            None => {
                let t = self.client.fetch_login_ticket().await?;
                let mut state = self.state.lock().await;
                state.login_ticket = Some(t.clone());
                state.ticket_fetched_at = Utc::now().timestamp();
                state.login_state = LoginState::AwaitingScan;
                info!("issued fresh login ticket");
                t
            }
        };

        let png = self.client.fetch_qr_png(&ticket).await?;
        Ok(Some(png))
    }

    /// Poll the remote login endpoint once and advance the FSM.
    pub async fn poll_login_once(&self) -> Result<LoginState> {
        let _gate = self.login_gate.lock().await;

        let (ticket, device_id) = {
            let state = self.state.lock().await;
            if state.login_state == LoginState::LoggedIn {
                return Ok(LoginState::LoggedIn);
            }
            match state.login_ticket.clone() {
                Some(t) => (t, state.device_id.clone()),
                None => return Ok(state.login_state),
            }
        };

        match self.client.poll_login(&ticket).await? {
            LoginPoll::Waiting => {
                let mut state = self.state.lock().await;
                state.login_state = LoginState::AwaitingScan;
                Ok(LoginState::AwaitingScan)
            }
            LoginPoll::Scanned => {
                let mut state = self.state.lock().await;
                if state.login_state != LoginState::Scanned {
                    info!("login code scanned, awaiting confirmation");
                }
                state.login_state = LoginState::Scanned;
                Ok(LoginState::Scanned)
            }
            LoginPoll::TicketExpired => {
                let mut state = self.state.lock().await;
                state.login_ticket = None;
                state.login_state = LoginState::LoggedOut;
                debug!("login ticket expired");
                Ok(LoginState::LoggedOut)
            }
            LoginPoll::Confirmed { redirect } => {
                let handshake = self.client.complete_login(&redirect, &device_id).await?;
                self.client.restore_cookies(&handshake.cookies);
                {
                    let mut state = self.state.lock().await;
                    state.credentials = Some(handshake.credentials);
                    state.sync_key = handshake.sync_key;
                    state.user_name = handshake.user_name;
                    state.cookies = handshake.cookies;
                    state.login_state = LoginState::LoggedIn;
                    state.login_ticket = None;
                    state.reconnect_attempts = 0;
                    state.last_heartbeat_at = Utc::now().timestamp();
                }
                self.persist().await?;
                info!("login confirmed, session established");
                let _ = self.events.send(SessionEvent::LoggedIn).await;
                Ok(LoginState::LoggedIn)
            }
        }
    }

    /// Explicit logout: drop credentials and cursor, persist, notify.
    pub async fn logout(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.invalidate();
        }
        self.persist().await?;
        let _ = self
            .events
            .send(SessionEvent::LoggedOut {
                reason: "explicit logout".to_string(),
            })
            .await;
        Ok(())
    }

    /// Send a text message to the self-chat. Requires `LoggedIn`; appends an
    /// outbound message to the log on success and returns its id.
    pub async fn send_text(&self, text: &str, reply_to: Option<i64>) -> Result<i64> {
        if text.is_empty() {
            return Err(SatchelError::InvalidArgument("empty message text".to_string()));
        }
        let (creds, device_id, user_name) = self.auth_snapshot().await?;
        if let Some(id) = reply_to {
            self.log.get(id).await?;
        }

        let remote_id = self
            .client
            .send_text(&creds, &device_id, &user_name, text)
            .await?;

        let mut msg = NewMessage::text(Direction::Outbound, text);
        msg.remote_id = (!remote_id.is_empty()).then_some(remote_id);
        msg.reply_to_id = reply_to;
        self.log.append(msg).await
    }

    /// Send a file from a server path. Requires `LoggedIn`.
    pub async fn send_file(&self, path: &Path, reply_to: Option<i64>) -> Result<i64> {
        let (creds, device_id, user_name) = self.auth_snapshot().await?;
        if let Some(id) = reply_to {
            self.log.get(id).await?;
        }
        if !path.exists() {
            return Err(SatchelError::NotFound(format!("file {}", path.display())));
        }
        let size_on_disk = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size_on_disk > self.max_upload_bytes {
            return Err(SatchelError::InvalidArgument(format!(
                "file exceeds the configured upload cap of {} bytes",
                self.max_upload_bytes
            )));
        }

        let remote_id = self
            .client
            .send_file(&creds, &device_id, &user_name, path)
            .await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let size = std::fs::metadata(path).map(|m| m.len()).ok();
        let is_image = matches!(
            Path::new(&file_name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .as_deref(),
            Some("jpg") | Some("jpeg") | Some("png") | Some("gif") | Some("webp")
        );

        let mut msg = NewMessage::text(Direction::Outbound, format!("[File: {file_name}]"));
        msg.remote_id = (!remote_id.is_empty()).then_some(remote_id);
        msg.reply_to_id = reply_to;
        msg.attachment = Some(satchel_core::Attachment {
            file_name,
            kind: if is_image {
                satchel_core::AttachmentKind::Image
            } else {
                satchel_core::AttachmentKind::File
            },
            stored_path: Some(path.display().to_string()),
            size,
        });
        self.log.append(msg).await
    }

    /// Download the media content of a stored inbound message into the
    /// download directory. Returns the path written.
    pub async fn download_attachment(&self, message_id: i64) -> Result<PathBuf> {
        let message = self.log.get(message_id).await?;
        let remote_id = message
            .remote_id
            .clone()
            .ok_or_else(|| SatchelError::NotFound(format!("message {message_id} has no remote id")))?;
        let attachment = message
            .attachment
            .clone()
            .ok_or_else(|| SatchelError::Unsupported("message carries no attachment".to_string()))?;

        let raw = {
            let cache = self
                .raw_cache
                .lock()
                .map_err(|_| SatchelError::Internal("raw cache poisoned".to_string()))?;
            cache.0.get(&remote_id).cloned()
        }
        .ok_or_else(|| {
            SatchelError::NotFound(format!(
                "media details for message {message_id} are no longer available"
            ))
        })?;

        let (creds, _, _) = self.auth_snapshot().await?;
        let bytes = self.client.download_media(&creds, &raw).await?;

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let target = unique_path(&self.download_dir, &attachment.file_name);
        tokio::fs::write(&target, &bytes).await?;
        self.log
            .set_stored_path(message_id, &target.display().to_string())
            .await?;
        info!(path = %target.display(), "attachment downloaded");
        Ok(target)
    }

    /// Persist session state to disk.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.state.lock().await.clone();
        snapshot.save(&self.state_path)
    }

    // --- internals -----------------------------------------------------

    async fn auth_snapshot(&self) -> Result<(crate::state::Credentials, String, String)> {
        let state = self.state.lock().await;
        if state.login_state != LoginState::LoggedIn {
            return Err(SatchelError::NotAuthenticated(format!(
                "session is {}",
                state.login_state
            )));
        }
        let creds = state
            .credentials
            .clone()
            .ok_or_else(|| SatchelError::Internal("logged in without credentials".to_string()))?;
        Ok((creds, state.device_id.clone(), state.user_name.clone()))
    }

    /// One poll round: synccheck, then sync when data is pending. Updates the
    /// cursor and counters on success.
    async fn poll_once(&self) -> Result<()> {
        let (creds, device_id) = {
            let state = self.state.lock().await;
            let creds = state
                .credentials
                .clone()
                .ok_or_else(|| SatchelError::NotAuthenticated("no credentials".to_string()))?;
            (creds, state.device_id.clone())
        };
        let sync_key = self.state.lock().await.sync_key.clone();

        match self.client.sync_check(&creds, &sync_key, &device_id).await? {
            SyncStatus::Quiet => {
                self.mark_poll_success(None).await;
                Ok(())
            }
            SyncStatus::Invalidated => Err(SatchelError::SessionInvalidated(
                "synccheck reported logout".to_string(),
            )),
            SyncStatus::NewData => {
                let (next_key, messages) =
                    self.client.sync(&creds, &sync_key, &device_id).await?;
                for remote in messages {
                    self.ingest(remote, &creds).await;
                }
                self.mark_poll_success(Some(next_key)).await;
                self.persist().await?;
                Ok(())
            }
        }
    }

    async fn mark_poll_success(&self, next_key: Option<crate::state::SyncKey>) {
        let mut state = self.state.lock().await;
        if let Some(key) = next_key {
            state.sync_key = key;
        }
        state.reconnect_attempts = 0;
        state.last_heartbeat_at = Utc::now().timestamp();
    }

    /// Append one remote message to the log (deduped by remote id) and
    /// forward it to the event channel.
    async fn ingest(&self, remote: RemoteMessage, creds: &crate::state::Credentials) {
        self.cache_raw(remote.clone());

        let Some(new_msg) = normalize(&remote) else {
            debug!(msg_type = remote.msg_type, "unmodeled message type skipped");
            return;
        };

        // Echoes of our own sends and replays after a cursor hiccup both
        // surface as duplicate remote ids.
        match self.log.find_by_remote_id(&remote.msg_id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "dedup lookup failed");
                return;
            }
        }

        let has_attachment = new_msg.attachment.is_some();
        let id = match self.log.append(new_msg).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "inbound append failed");
                return;
            }
        };

        if has_attachment && self.auto_download {
            if let Err(e) = self.download_inbound(id, &remote, creds).await {
                warn!(error = %e, message_id = id, "auto-download failed");
            }
        }

        match self.log.get(id).await {
            Ok(message) => {
                let _ = self.events.send(SessionEvent::Inbound(message)).await;
            }
            Err(e) => error!(error = %e, "stored message readback failed"),
        }
    }

    async fn download_inbound(
        &self,
        message_id: i64,
        remote: &RemoteMessage,
        creds: &crate::state::Credentials,
    ) -> Result<()> {
        let bytes = self.client.download_media(creds, remote).await?;
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let name = if remote.file_name.is_empty() {
            format!("media_{}", remote.msg_id)
        } else {
            remote.file_name.clone()
        };
        let target = unique_path(&self.download_dir, &name);
        tokio::fs::write(&target, &bytes).await?;
        self.log
            .set_stored_path(message_id, &target.display().to_string())
            .await
    }

    fn cache_raw(&self, remote: RemoteMessage) {
        if remote.msg_id.is_empty() {
            return;
        }
        if let Ok(mut cache) = self.raw_cache.lock() {
            let (map, order) = &mut *cache;
            if !map.contains_key(&remote.msg_id) {
                order.push_back(remote.msg_id.clone());
                if order.len() > RAW_CACHE_LIMIT
                    && let Some(evicted) = order.pop_front()
                {
                    map.remove(&evicted);
                }
            }
            map.insert(remote.msg_id.clone(), remote);
        }
    }

    /// Heartbeat: when the last successful poll is older than twice the
    /// interval, probe with a synccheck. Errors propagate into the reconnect
    /// path like any poll failure.
    async fn heartbeat_probe(&self) -> Result<()> {
        let stale = {
            let state = self.state.lock().await;
            let age = Utc::now().timestamp() - state.last_heartbeat_at;
            age > 2 * self.heartbeat_interval.as_secs() as i64
        };
        if !stale {
            return Ok(());
        }
        debug!("heartbeat: probing stale connection");

        let (creds, device_id) = {
            let state = self.state.lock().await;
            let creds = state
                .credentials
                .clone()
                .ok_or_else(|| SatchelError::NotAuthenticated("no credentials".to_string()))?;
            (creds, state.device_id.clone())
        };
        let sync_key = self.state.lock().await.sync_key.clone();

        match self.client.sync_check(&creds, &sync_key, &device_id).await? {
            SyncStatus::Invalidated => Err(SatchelError::SessionInvalidated(
                "heartbeat probe rejected".to_string(),
            )),
            _ => {
                self.mark_poll_success(None).await;
                Ok(())
            }
        }
    }

    /// Count a poll failure. Below the cap: wait the backoff delay (doubling
    /// per consecutive failure, bounded). At the cap: transition to
    /// `LoggedOut` and stop polling until a new login is initiated.
    async fn handle_poll_failure(&self, err: &SatchelError, cancel: &CancellationToken) {
        let attempts = {
            let mut state = self.state.lock().await;
            state.reconnect_attempts += 1;
            state.reconnect_attempts
        };

        if attempts >= self.max_reconnect_attempts {
            error!(
                attempts,
                error = %err,
                "reconnect cap reached, logging out"
            );
            {
                let mut state = self.state.lock().await;
                state.invalidate();
            }
            if let Err(e) = self.persist().await {
                warn!(error = %e, "persist after logout failed");
            }
            let _ = self
                .events
                .send(SessionEvent::LoggedOut {
                    reason: format!("reconnect cap reached: {err}"),
                })
                .await;
            return;
        }

        let delay = backoff_delay(self.reconnect_delay, attempts);
        warn!(
            attempts,
            max = self.max_reconnect_attempts,
            delay_secs = delay.as_secs(),
            error = %err,
            "poll failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

/// Exponential backoff from a base delay, capped.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(6);
    Duration::from_secs((base.as_secs() * factor).min(MAX_BACKOFF_SECS))
}

/// Pick a non-clobbering path for `name` inside `dir`.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = Path::new(name).extension().and_then(|e| e.to_str());
    for i in 1..10_000 {
        let next = match ext {
            Some(ext) => dir.join(format!("{stem}_{i}.{ext}")),
            None => dir.join(format!("{stem}_{i}")),
        };
        if !next.exists() {
            return next;
        }
    }
    dir.join(format!("{stem}_{}", Utc::now().timestamp_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Credentials, SyncKey, SyncKeyEntry};
    use satchel_store::Database;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn engine_with_mock(
        server: &MockServer,
    ) -> (Arc<SessionEngine>, mpsc::Receiver<SessionEvent>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = SatchelConfig::default();
        config.storage.state_path = dir
            .path()
            .join("state.json")
            .to_str()
            .unwrap()
            .to_string();
        config.files.download_dir = dir.path().join("downloads").to_str().unwrap().to_string();
        config.files.auto_download = false;
        config.session.max_reconnect_attempts = 3;
        config.session.reconnect_delay_secs = 0;

        let db = Database::open(dir.path().join("log.db").to_str().unwrap())
            .await
            .unwrap();
        let log = UpdateLog::new(db, 100, 1000);

        let uri = server.uri();
        let hosts = RemoteHosts::explicit(&uri, &uri, &uri, &uri);
        let client = RemoteClient::new(
            hosts,
            Arc::new(TraceRecorder::disabled()),
            Duration::from_secs(5),
        )
        .unwrap();

        let (engine, rx) = SessionEngine::with_client(&config, client, log).unwrap();
        (engine, rx, dir)
    }

    async fn force_logged_in(engine: &SessionEngine) {
        let mut state = engine.state.lock().await;
        state.login_state = LoginState::LoggedIn;
        state.credentials = Some(Credentials {
            skey: "@crypt_k".to_string(),
            sid: "sid1".to_string(),
            uin: "42".to_string(),
            pass_ticket: "pt".to_string(),
        });
        state.sync_key = SyncKey {
            count: 1,
            list: vec![SyncKeyEntry { key: 1, val: 10 }],
        };
        state.user_name = "@self".to_string();
    }

    #[tokio::test]
    async fn send_when_logged_out_fails_without_append() {
        let server = MockServer::start().await;
        let (engine, _rx, _dir) = engine_with_mock(&server).await;

        let err = engine.send_text("hello", None).await.unwrap_err();
        assert!(matches!(err, SatchelError::NotAuthenticated(_)));
        assert_eq!(engine.log.max_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn login_poll_sequence_advances_fsm() {
        let server = MockServer::start().await;
        let (engine, mut rx, _dir) = engine_with_mock(&server).await;

        // Ticket fetch + QR.
        Mock::given(method("GET"))
            .and(path("/jslogin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"window.QRLogin.code = 200; window.QRLogin.uuid = "tick-1";"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/qrcode/tick-1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, 0x50]))
            .mount(&server)
            .await;

        let png = engine.login_qr().await.unwrap();
        assert!(png.is_some());
        assert_eq!(engine.login_state().await, LoginState::AwaitingScan);

        // 408: still waiting.
        let waiting = Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("window.code=408;"))
            .up_to_n_times(1)
            .mount_as_scoped(&server)
            .await;
        assert_eq!(
            engine.poll_login_once().await.unwrap(),
            LoginState::AwaitingScan
        );
        drop(waiting);

        // 201: scanned, not yet confirmed.
        let scanned = Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("window.code=201;"))
            .up_to_n_times(1)
            .mount_as_scoped(&server)
            .await;
        assert_eq!(engine.poll_login_once().await.unwrap(), LoginState::Scanned);
        drop(scanned);

        // 200: confirmed, redirect to the handshake.
        let redirect = format!(
            "{}/cgi-bin/mmwebwx-bin/webwxnewloginpage?ticket=t1&uuid=tick-1&scan=1",
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "window.code=200;\nwindow.redirect_uri=\"{redirect}\";"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/webwxnewloginpage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "webwx_data_ticket=dt-1; Path=/")
                    .set_body_string(
                        "<error><ret>0</ret><skey>@crypt_s</skey><wxsid>sid-9</wxsid>\
                         <wxuin>777</wxuin><pass_ticket>pt-9</pass_ticket></error>",
                    ),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/mmwebwx-bin/webwxinit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "BaseResponse": {"Ret": 0},
                "User": {"UserName": "@self", "Uin": 777},
                "SyncKey": {"Count": 1, "List": [{"Key": 1, "Val": 100}]},
            })))
            .mount(&server)
            .await;

        assert_eq!(engine.poll_login_once().await.unwrap(), LoginState::LoggedIn);
        let status = engine.login_status().await;
        assert!(status.logged_in);
        assert_eq!(status.code, 200);
        assert!(matches!(rx.recv().await, Some(SessionEvent::LoggedIn)));

        // QR request while logged in short-circuits.
        assert!(engine.login_qr().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poll_ingests_messages_in_order_and_advances_cursor() {
        let server = MockServer::start().await;
        let (engine, mut rx, _dir) = engine_with_mock(&server).await;
        force_logged_in(&engine).await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/synccheck"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"window.synccheck={retcode:"0",selector:"2"}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/mmwebwx-bin/webwxsync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "BaseResponse": {"Ret": 0},
                "SyncKey": {"Count": 1, "List": [{"Key": 1, "Val": 11}]},
                "AddMsgList": [
                    {"MsgId": "r1", "MsgType": 1, "Content": "first",
                     "FromUserName": "filehelper", "ToUserName": "@self"},
                    {"MsgId": "r2", "MsgType": 1, "Content": "second",
                     "FromUserName": "filehelper", "ToUserName": "@self"},
                ],
            })))
            .mount(&server)
            .await;

        engine.poll_once().await.unwrap();

        let messages = engine.log.query(0, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "first");
        assert_eq!(messages[1].text, "second");
        assert_eq!(messages[0].direction, Direction::Inbound);

        let state = engine.state.lock().await;
        assert_eq!(state.sync_key.list[0].val, 11);
        assert_eq!(state.reconnect_attempts, 0);
        drop(state);

        match rx.recv().await {
            Some(SessionEvent::Inbound(m)) => assert_eq!(m.text, "first"),
            other => panic!("expected inbound event, got {other:?}"),
        }

        // A second poll replaying the same remote ids appends nothing.
        engine.poll_once().await.unwrap();
        assert_eq!(engine.log.max_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reconnect_cap_transitions_to_logged_out() {
        let server = MockServer::start().await;
        let (engine, mut rx, _dir) = engine_with_mock(&server).await;
        force_logged_in(&engine).await;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/synccheck"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"window.synccheck={retcode:"1101",selector:"0"}"#),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let err = engine.poll_once().await.unwrap_err();
            assert!(matches!(err, SatchelError::SessionInvalidated(_)));
            engine.handle_poll_failure(&err, &cancel).await;
        }

        assert_eq!(engine.login_state().await, LoginState::LoggedOut);
        let state = engine.state.lock().await;
        assert!(!state.sync_key.is_valid(), "cursor must be invalidated");
        drop(state);

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::LoggedOut { .. })
        ));
    }

    #[tokio::test]
    async fn successful_poll_resets_reconnect_attempts() {
        let server = MockServer::start().await;
        let (engine, _rx, _dir) = engine_with_mock(&server).await;
        force_logged_in(&engine).await;
        engine.state.lock().await.reconnect_attempts = 2;

        Mock::given(method("GET"))
            .and(path("/cgi-bin/mmwebwx-bin/synccheck"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"window.synccheck={retcode:"0",selector:"0"}"#),
            )
            .mount(&server)
            .await;

        engine.poll_once().await.unwrap();
        assert_eq!(engine.state.lock().await.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn send_text_appends_outbound_with_remote_id() {
        let server = MockServer::start().await;
        let (engine, _rx, _dir) = engine_with_mock(&server).await;
        force_logged_in(&engine).await;

        Mock::given(method("POST"))
            .and(path("/cgi-bin/mmwebwx-bin/webwxsendmsg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "BaseResponse": {"Ret": 0},
                "MsgID": "sent-1",
            })))
            .mount(&server)
            .await;

        let id = engine.send_text("hello there", None).await.unwrap();
        let stored = engine.log.get(id).await.unwrap();
        assert_eq!(stored.direction, Direction::Outbound);
        assert_eq!(stored.remote_id.as_deref(), Some("sent-1"));
        assert_eq!(stored.text, "hello there");
    }

    #[tokio::test]
    async fn remote_rejection_is_delivery_failed() {
        let server = MockServer::start().await;
        let (engine, _rx, _dir) = engine_with_mock(&server).await;
        force_logged_in(&engine).await;

        Mock::given(method("POST"))
            .and(path_regex(r"/cgi-bin/mmwebwx-bin/webwxsendmsg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "BaseResponse": {"Ret": 1, "ErrMsg": "nope"},
            })))
            .mount(&server)
            .await;

        let err = engine.send_text("hello", None).await.unwrap_err();
        assert!(matches!(err, SatchelError::DeliveryFailed(_)));
        assert_eq!(engine.log.max_id().await.unwrap(), 0, "no append on failure");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(base, 10), Duration::from_secs(60));
    }

    #[test]
    fn unique_path_avoids_clobbering() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let next = unique_path(dir.path(), "a.txt");
        assert_eq!(next.file_name().unwrap(), "a_1.txt");
        let fresh = unique_path(dir.path(), "b.txt");
        assert_eq!(fresh.file_name().unwrap(), "b.txt");
    }
}
