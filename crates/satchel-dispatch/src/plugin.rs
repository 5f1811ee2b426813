// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The extension interface: plugins, commands, message handlers, routes, and
//! the capability contexts they receive.
//!
//! There are no ambient globals. Load hooks get a [`PluginContext`]; command
//! and handler bodies get a [`CommandContext`] carrying the session handle,
//! update log, task store, and configuration.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use satchel_config::SatchelConfig;
use satchel_core::{Message, Result};
use satchel_cron::TaskStore;
use satchel_session::SessionEngine;
use satchel_store::UpdateLog;
use satchel_webhook::ChatResponder;
use tokio::sync::mpsc;

/// Shared capabilities handed to every command and handler invocation.
pub struct Services {
    pub engine: Arc<SessionEngine>,
    pub log: UpdateLog,
    pub tasks: TaskStore,
    pub config: Arc<SatchelConfig>,
    /// Runtime toggle for routing non-command text to the chat responder.
    pub chat_enabled: AtomicBool,
    pub chat: Option<ChatResponder>,
    /// Queue for "run this task now" requests, drained by the scheduler.
    pub run_now_tx: mpsc::Sender<String>,
    pub registry: Arc<crate::registry::PluginRegistry>,
    pub started_at: Instant,
    /// Client for plugin-initiated outbound requests (allowlist-gated).
    pub http: reqwest::Client,
}

/// Context passed to plugin lifecycle hooks.
#[derive(Clone)]
pub struct PluginContext {
    pub config: Arc<SatchelConfig>,
}

/// One parsed inbound text, plus everything a handler may need.
pub struct CommandContext<'a> {
    /// The full original text, prefix included.
    pub raw_text: &'a str,
    /// Lowercased command name (empty for non-command text).
    pub command: String,
    /// Whitespace-delimited arguments after the command name.
    pub args: Vec<String>,
    /// Whether the text carried the command prefix.
    pub is_command: bool,
    /// The originating stored message, when dispatch came from the session.
    pub origin: Option<&'a Message>,
    pub services: &'a Services,
}

impl<'a> CommandContext<'a> {
    /// Parse `text` against the configured command prefix.
    pub fn parse(
        text: &'a str,
        prefix: &str,
        origin: Option<&'a Message>,
        services: &'a Services,
    ) -> Self {
        let trimmed = text.trim();
        let is_command = !prefix.is_empty() && trimmed.starts_with(prefix);
        let body = if is_command {
            trimmed[prefix.len()..].trim()
        } else {
            trimmed
        };

        let mut parts = body.split_whitespace();
        let command = if is_command {
            parts.next().unwrap_or_default().to_lowercase()
        } else {
            String::new()
        };
        let args: Vec<String> = if is_command {
            parts.map(str::to_string).collect()
        } else {
            Vec::new()
        };

        Self {
            raw_text: text,
            command,
            args,
            is_command,
            origin,
            services,
        }
    }

    /// The id to address a reply to, when the origin is a stored message.
    pub fn reply_to_id(&self) -> Option<i64> {
        self.origin.map(|m| m.id)
    }

    /// Everything after the command name, whitespace preserved.
    pub fn rest(&self) -> &str {
        if !self.is_command {
            return self.raw_text.trim();
        }
        let trimmed = self.raw_text.trim();
        let prefix = &self.services.config.plugins.command_prefix;
        let body = trimmed[prefix.len()..].trim_start();
        body.split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or("")
    }
}

/// Static description of a command for registration and help output.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Unique across the registry, matched case-insensitively.
    pub name: &'static str,
    /// Each alias is unique across the whole registry too.
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub usage: &'static str,
    /// Hidden commands are callable but omitted from help.
    pub hidden: bool,
}

/// A named command invocation target.
#[async_trait]
pub trait Command: Send + Sync {
    fn spec(&self) -> CommandSpec;

    /// Execute the command. `Ok(None)` means "nothing to say"; errors are
    /// caught at the dispatch boundary and become visible error replies.
    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>>;
}

/// Outcome of one message-handler invocation. Explicitly distinguishes
/// "reply with this" from "no opinion" -- an empty reply string is a real,
/// deliberate reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled(String),
    Continue,
}

/// A pre-command message interceptor.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower priorities run first; ties break by registration order.
    fn priority(&self) -> i32 {
        0
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<HandlerOutcome>;
}

/// Handler behind a plugin-contributed HTTP route.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(
        &self,
        query: &HashMap<String, String>,
        body: serde_json::Value,
        services: &Services,
    ) -> Result<serde_json::Value>;
}

/// A route contributed by a plugin, mounted under `/ext` by the gateway.
#[derive(Clone)]
pub struct Route {
    /// Uppercase HTTP method.
    pub method: &'static str,
    /// Path relative to `/ext`, e.g. `/example/ping`.
    pub path: &'static str,
    pub handler: Arc<dyn RouteHandler>,
}

/// Everything a plugin contributes at load time.
#[derive(Default)]
pub struct Contribution {
    pub commands: Vec<Arc<dyn Command>>,
    pub handlers: Vec<Arc<dyn MessageHandler>>,
    pub routes: Vec<Route>,
}

/// A loadable extension unit.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique unit name; owns every contribution under it.
    fn name(&self) -> &'static str;

    /// The unit's contributions. Called once per load.
    fn provides(&self) -> Contribution;

    /// Invoked exactly once per load cycle, before contributions activate.
    async fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Invoked exactly once per unload cycle, before removal.
    async fn on_unload(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }
}

/// Factory producing a fresh plugin instance per load cycle.
pub type PluginFactory = fn() -> Box<dyn Plugin>;

#[cfg(test)]
mod tests {
    use super::*;

    // CommandContext parsing is exercised without Services via a thin check
    // of the tokenizer rules only; full parses are covered in dispatch tests.

    #[test]
    fn handler_outcome_distinguishes_empty_reply() {
        assert_ne!(
            HandlerOutcome::Handled(String::new()),
            HandlerOutcome::Continue
        );
    }
}
