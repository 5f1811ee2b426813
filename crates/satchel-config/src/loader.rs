// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered merging.
//!
//! Merge order (later overrides earlier): compiled defaults,
//! `~/.config/satchel/satchel.toml`, `./satchel.toml`, `SATCHEL_*` env vars.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use satchel_core::SatchelError;

use crate::model::SatchelConfig;

/// Load configuration from the standard hierarchy with env overrides.
pub fn load_config() -> Result<SatchelConfig, SatchelError> {
    Figment::new()
        .merge(Serialized::defaults(SatchelConfig::default()))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("satchel/satchel.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("satchel.toml"))
        .merge(env_provider())
        .extract()
        .map_err(|e| SatchelError::Config(e.to_string()))
}

/// Load configuration from inline TOML only. Used by tests.
pub fn load_config_from_str(toml_content: &str) -> Result<SatchelConfig, SatchelError> {
    Figment::new()
        .merge(Serialized::defaults(SatchelConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
        .map_err(|e| SatchelError::Config(e.to_string()))
}

/// Load configuration from an explicit file path with env overrides.
pub fn load_config_from_path(path: &Path) -> Result<SatchelConfig, SatchelError> {
    Figment::new()
        .merge(Serialized::defaults(SatchelConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
        .map_err(|e| SatchelError::Config(e.to_string()))
}

/// Environment provider with explicit section mapping.
///
/// Uses `Env::map()` rather than `Env::split("_")` so keys that themselves
/// contain underscores map correctly: `SATCHEL_STORAGE_MESSAGE_DB_PATH`
/// becomes `storage.message_db_path`, not `storage.message.db.path`.
fn env_provider() -> Env {
    Env::prefixed("SATCHEL_").map(|key| {
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("server_", "server.", 1)
            .replacen("remote_", "remote.", 1)
            .replacen("files_", "files.", 1)
            .replacen("storage_", "storage.", 1)
            .replacen("plugins_", "plugins.", 1)
            .replacen("session_", "session.", 1)
            .replacen("webhook_", "webhook.", 1)
            .replacen("http_", "http.", 1)
            .replacen("trace_", "trace.", 1)
            .replacen("log_", "log.", 1);
        mapped.into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_yields_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.server.port, 8600);
        assert_eq!(config.session.heartbeat_interval_secs, 30);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = load_config_from_str(
            r#"
            [server]
            port = 9001

            [session]
            max_reconnect_attempts = 3

            [webhook]
            push_url = "http://localhost:9999/hook"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.session.max_reconnect_attempts, 3);
        assert_eq!(
            config.webhook.push_url.as_deref(),
            Some("http://localhost:9999/hook")
        );
    }

    #[test]
    fn unknown_key_is_rejected() {
        let result = load_config_from_str(
            r#"
            [server]
            prot = 9001
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = load_config_from_str(
            r#"
            [files]
            retention_days = 14
            "#,
        )
        .unwrap();
        assert_eq!(config.files.retention_days, 14);
        assert!(config.files.auto_download);
        assert_eq!(config.files.download_dir, "downloads");
    }
}
