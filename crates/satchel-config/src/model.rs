// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs.
//!
//! All sections use `#[serde(deny_unknown_fields)]` so a typoed key is
//! rejected at startup instead of being silently ignored.

use serde::{Deserialize, Serialize};

/// Top-level Satchel configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SatchelConfig {
    /// HTTP gateway bind settings and server identity.
    #[serde(default)]
    pub server: ServerConfig,

    /// Remote self-chat endpoint settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Download directory and file handling.
    #[serde(default)]
    pub files: FilesConfig,

    /// Message log and state file paths.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Extension unit settings.
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Poll/heartbeat/reconnect tuning.
    #[serde(default)]
    pub session: SessionConfig,

    /// Outbound webhook targets.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Outbound HTTP allowlist for proxying commands.
    #[serde(default)]
    pub http: HttpConfig,

    /// Remote-protocol trace recorder.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Logging.
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP gateway bind settings and server identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Label reported by `/status`-style surfaces. Defaults to the hostname.
    #[serde(default = "default_label")]
    pub label: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            label: default_label(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8600
}

fn default_label() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "satchel".to_string())
}

/// Remote self-chat endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Entry host for the remote file-helper web API. The login and media
    /// hosts are derived from it.
    #[serde(default = "default_entry_host")]
    pub entry_host: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            entry_host: default_entry_host(),
        }
    }
}

fn default_entry_host() -> String {
    "szfilehelper.weixin.qq.com".to_string()
}

/// Download directory and file handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FilesConfig {
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Download inbound attachments as they arrive.
    #[serde(default = "default_true")]
    pub auto_download: bool,

    /// Purge stored messages and files older than this many days. 0 keeps
    /// everything.
    #[serde(default)]
    pub retention_days: u32,

    /// Upper bound for outbound file sends. The remote rejects larger uploads.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            auto_download: true,
            retention_days: 0,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_download_dir() -> String {
    "downloads".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> u64 {
    25 * 1024 * 1024
}

/// Message log and state file paths, plus query bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_message_db_path")]
    pub message_db_path: String,

    /// Session credentials and sync cursor, persisted across restarts.
    #[serde(default = "default_state_path")]
    pub state_path: String,

    /// Scheduled task definitions.
    #[serde(default = "default_task_path")]
    pub task_path: String,

    #[serde(default = "default_query_default_limit")]
    pub query_default_limit: u32,

    #[serde(default = "default_query_max_limit")]
    pub query_max_limit: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            message_db_path: default_message_db_path(),
            state_path: default_state_path(),
            task_path: default_task_path(),
            query_default_limit: default_query_default_limit(),
            query_max_limit: default_query_max_limit(),
        }
    }
}

fn default_message_db_path() -> String {
    "messages.db".to_string()
}

fn default_state_path() -> String {
    "state.json".to_string()
}

fn default_task_path() -> String {
    "tasks.json".to_string()
}

fn default_query_default_limit() -> u32 {
    100
}

fn default_query_max_limit() -> u32 {
    1000
}

/// Extension unit settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsConfig {
    /// Directory holding per-unit manifest overrides.
    #[serde(default = "default_plugins_dir")]
    pub dir: String,

    /// Prefix that marks message text as a command invocation.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugins_dir(),
            command_prefix: default_command_prefix(),
        }
    }
}

fn default_plugins_dir() -> String {
    "plugins".to_string()
}

fn default_command_prefix() -> String {
    "/".to_string()
}

/// Poll/heartbeat/reconnect tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Base delay between reconnect attempts; backoff doubles from here.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Consecutive poll failures tolerated before giving up and logging out.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Read timeout for the remote long-poll request.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_poll_timeout_secs() -> u64 {
    40
}

/// Outbound webhook targets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// Push target for new inbound updates. `None` disables the push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,

    #[serde(default = "default_push_timeout_secs")]
    pub push_timeout_secs: u64,

    /// Chat-responder target consulted for non-command text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_url: Option<String>,

    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,

    /// Whether non-command text is routed to the chat responder at all.
    #[serde(default)]
    pub chat_enabled: bool,

    /// Cap on concurrent in-flight push deliveries.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            push_url: None,
            push_timeout_secs: default_push_timeout_secs(),
            chat_url: None,
            chat_timeout_secs: default_chat_timeout_secs(),
            chat_enabled: false,
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_push_timeout_secs() -> u64 {
    10
}

fn default_chat_timeout_secs() -> u64 {
    20
}

fn default_max_in_flight() -> usize {
    8
}

/// Outbound HTTP allowlist for proxying commands.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Hosts a plugin may proxy requests to. Empty means loopback and
    /// private ranges only.
    #[serde(default)]
    pub allowlist: Vec<String>,
}

/// Remote-protocol trace recorder.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TraceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mask credential fields in recorded URLs and bodies.
    #[serde(default = "default_true")]
    pub redact: bool,

    /// Body preview clip length in bytes.
    #[serde(default = "default_trace_max_body")]
    pub max_body: usize,

    #[serde(default = "default_trace_dir")]
    pub dir: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact: true,
            max_body: default_trace_max_body(),
            dir: default_trace_dir(),
        }
    }
}

fn default_trace_max_body() -> usize {
    4096
}

fn default_trace_dir() -> String {
    "trace_logs".to_string()
}

/// Logging.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = SatchelConfig::default();
        assert_eq!(config.server.port, 8600);
        assert_eq!(config.session.max_reconnect_attempts, 10);
        assert_eq!(config.storage.query_default_limit, 100);
        assert!(config.trace.enabled);
        assert!(!config.webhook.chat_enabled);
        assert_eq!(config.plugins.command_prefix, "/");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = SatchelConfig::default();
        let toml = toml::to_string(&config).unwrap();
        let back: SatchelConfig = toml::from_str(&toml).unwrap();
        assert_eq!(back.server.port, config.server.port);
        assert_eq!(back.remote.entry_host, config.remote.entry_host);
    }
}
