// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The built-in extension unit: the command set the bridge ships with.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use satchel_core::{Result, SatchelError};
use tracing::info;

use crate::plugin::{
    Command, CommandContext, CommandSpec, Contribution, Plugin, PluginContext,
};

pub struct BuiltinPlugin;

#[async_trait]
impl Plugin for BuiltinPlugin {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn provides(&self) -> Contribution {
        Contribution {
            commands: vec![
                Arc::new(HelpCommand),
                Arc::new(StatusCommand),
                Arc::new(VersionCommand),
                Arc::new(PingCommand),
                Arc::new(ChatCommand),
                Arc::new(TaskCommand),
                Arc::new(PluginsCommand),
                Arc::new(ReloadCommand),
                Arc::new(SendFileCommand),
                Arc::new(FetchCommand),
            ],
            handlers: vec![],
            routes: vec![],
        }
    }

    async fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
        info!("builtin command set loaded");
        Ok(())
    }
}

struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "help",
            aliases: &["h"],
            description: "list available commands",
            usage: "/help",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some(ctx.services.registry.table().help_text()))
    }
}

struct StatusCommand;

#[async_trait]
impl Command for StatusCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "status",
            aliases: &["stat"],
            description: "show bridge status",
            usage: "/status",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let services = ctx.services;
        let login = services.engine.login_status().await;
        let stats = services.log.stats().await?;
        let (task_count, enabled_tasks) = services.tasks.counts()?;
        let plugin_count = services.registry.summaries().await.len();
        let uptime = services.started_at.elapsed().as_secs();
        let chat = services.chat_enabled.load(Ordering::Relaxed);

        Ok(Some(format!(
            "server={}\nuptime={uptime}s\nsession={}\nreconnect_attempts={}\n\
             messages={} (inbound {})\nmax_update_id={}\ntasks={task_count} ({enabled_tasks} enabled)\n\
             plugins={plugin_count}\nchat_mode={}",
            services.config.server.label,
            login.state,
            login.reconnect_attempts,
            stats.message_count,
            stats.inbound_count,
            stats.max_update_id,
            if chat { "on" } else { "off" },
        )))
    }
}

struct VersionCommand;

#[async_trait]
impl Command for VersionCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "version",
            aliases: &["ver"],
            description: "show version",
            usage: "/version",
            hidden: false,
        }
    }

    async fn execute(&self, _ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some(format!("satchel v{}", env!("CARGO_PKG_VERSION"))))
    }
}

struct PingCommand;

#[async_trait]
impl Command for PingCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "ping",
            aliases: &[],
            description: "connectivity check",
            usage: "/ping",
            hidden: false,
        }
    }

    async fn execute(&self, _ctx: &CommandContext<'_>) -> Result<Option<String>> {
        Ok(Some("pong".to_string()))
    }
}

struct ChatCommand;

#[async_trait]
impl Command for ChatCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "chat",
            aliases: &[],
            description: "chat responder on|off|status",
            usage: "/chat on|off|status",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let services = ctx.services;
        let configured = services.chat.is_some();
        match ctx.args.first().map(String::as_str) {
            Some("on") => {
                if !configured {
                    return Ok(Some(
                        "No chat responder configured (webhook.chat_url is unset).".to_string(),
                    ));
                }
                services.chat_enabled.store(true, Ordering::Relaxed);
                Ok(Some("Chat mode is on.".to_string()))
            }
            Some("off") => {
                services.chat_enabled.store(false, Ordering::Relaxed);
                Ok(Some("Chat mode is off.".to_string()))
            }
            Some("status") | None => Ok(Some(format!(
                "Chat mode is {} (responder {}).",
                if services.chat_enabled.load(Ordering::Relaxed) {
                    "on"
                } else {
                    "off"
                },
                if configured { "configured" } else { "not configured" },
            ))),
            Some(other) => Err(SatchelError::InvalidArgument(format!(
                "unknown chat subcommand '{other}'"
            ))),
        }
    }
}

struct TaskCommand;

#[async_trait]
impl Command for TaskCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "task",
            aliases: &["tasks"],
            description: "scheduled task management",
            usage: "/task list|add <schedule> <command>|del <id>|on <id>|off <id>|run <id>",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let services = ctx.services;
        match ctx.args.first().map(String::as_str) {
            Some("list") | None => {
                let tasks = services.tasks.list()?;
                if tasks.is_empty() {
                    return Ok(Some("No scheduled tasks.".to_string()));
                }
                let mut lines = vec![format!("{} scheduled task(s):", tasks.len())];
                for task in tasks {
                    lines.push(format!(
                        "  {} [{}] {} -> {}{}",
                        task.id,
                        if task.enabled { "on" } else { "off" },
                        task.schedule,
                        task.command_text,
                        if task.description.is_empty() {
                            String::new()
                        } else {
                            format!(" ({})", task.description)
                        },
                    ));
                }
                Ok(Some(lines.join("\n")))
            }
            Some("add") => {
                // Schedule is one token (HH:MM) or three ("every 5m" style
                // collapses to two: "every" + "5m").
                let args = &ctx.args[1..];
                let (schedule, command_start) = match args.first().map(String::as_str) {
                    Some("every") if args.len() >= 2 => {
                        (format!("every {}", args[1]), 2)
                    }
                    Some(first) => (first.to_string(), 1),
                    None => {
                        return Err(SatchelError::InvalidArgument(
                            "usage: /task add <schedule> <command>".to_string(),
                        ))
                    }
                };
                let command_text = args[command_start..].join(" ");
                let task = services.tasks.add(&schedule, &command_text, "")?;
                Ok(Some(format!("Task {} added ({}).", task.id, task.schedule)))
            }
            Some("del") => {
                let id = require_id(&ctx.args)?;
                if services.tasks.delete(id)? {
                    Ok(Some(format!("Task {id} deleted.")))
                } else {
                    Ok(Some(format!("No task {id}.")))
                }
            }
            Some("on") | Some("off") => {
                let enable = ctx.args[0] == "on";
                let id = require_id(&ctx.args)?;
                if services.tasks.set_enabled(id, enable)? {
                    Ok(Some(format!(
                        "Task {id} {}.",
                        if enable { "enabled" } else { "disabled" }
                    )))
                } else {
                    Ok(Some(format!("No task {id}.")))
                }
            }
            Some("run") => {
                let id = require_id(&ctx.args)?;
                if services.tasks.get(id)?.is_none() {
                    return Ok(Some(format!("No task {id}.")));
                }
                services
                    .run_now_tx
                    .send(id.to_string())
                    .await
                    .map_err(|_| SatchelError::Internal("scheduler not running".to_string()))?;
                Ok(Some(format!("Task {id} triggered.")))
            }
            Some(other) => Err(SatchelError::InvalidArgument(format!(
                "unknown task subcommand '{other}'"
            ))),
        }
    }
}

fn require_id(args: &[String]) -> Result<&str> {
    args.get(1)
        .map(String::as_str)
        .ok_or_else(|| SatchelError::InvalidArgument("a task id is required".to_string()))
}

struct PluginsCommand;

#[async_trait]
impl Command for PluginsCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "plugins",
            aliases: &[],
            description: "list loaded extension units",
            usage: "/plugins",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let summaries = ctx.services.registry.summaries().await;
        let errors = ctx.services.registry.errors().await;
        let mut lines = vec![format!("{} unit(s) loaded:", summaries.len())];
        for summary in summaries {
            lines.push(format!(
                "  {} ({} commands, {} handlers, {} routes)",
                summary.name, summary.commands, summary.handlers, summary.routes
            ));
        }
        if !errors.is_empty() {
            lines.push(format!("{} load error(s):", errors.len()));
            for error in errors {
                lines.push(format!("  {}: {}", error.plugin, error.reason));
            }
        }
        Ok(Some(lines.join("\n")))
    }
}

struct ReloadCommand;

#[async_trait]
impl Command for ReloadCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "reload",
            aliases: &[],
            description: "reload all extension units",
            usage: "/reload",
            hidden: true,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let errors = ctx.services.registry.reload_all().await;
        let loaded = ctx.services.registry.summaries().await.len();
        Ok(Some(if errors.is_empty() {
            format!("Reloaded {loaded} unit(s).")
        } else {
            format!("Reloaded {loaded} unit(s), {} failed.", errors.len())
        }))
    }
}

struct SendFileCommand;

#[async_trait]
impl Command for SendFileCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "sendfile",
            aliases: &[],
            description: "send a server-side file to the chat",
            usage: "/sendfile <path>",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let path = ctx.rest();
        if path.is_empty() {
            return Err(SatchelError::InvalidArgument(
                "usage: /sendfile <path>".to_string(),
            ));
        }
        let id = ctx
            .services
            .engine
            .send_file(&PathBuf::from(path), ctx.reply_to_id())
            .await?;
        Ok(Some(format!("File sent (message {id}).")))
    }
}

struct FetchCommand;

#[async_trait]
impl Command for FetchCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "fetch",
            aliases: &[],
            description: "fetch an allowlisted URL",
            usage: "/fetch <url>",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        let url = ctx.rest();
        if url.is_empty() {
            return Err(SatchelError::InvalidArgument("usage: /fetch <url>".to_string()));
        }
        if !satchel_security::url_allowed(url, &ctx.services.config.http.allowlist) {
            return Ok(Some(format!("URL not allowed by the outbound policy: {url}")));
        }

        let resp = ctx
            .services
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| SatchelError::network("fetch", e))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| SatchelError::network("fetch body", e))?;
        let mut preview: String = body.chars().take(800).collect();
        if preview.len() < body.len() {
            preview.push_str(" ...");
        }
        Ok(Some(format!("HTTP {status}\n{preview}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_specs_have_unique_names_and_aliases() {
        let contribution = BuiltinPlugin.provides();
        let mut seen = std::collections::HashSet::new();
        for command in &contribution.commands {
            let spec = command.spec();
            assert!(seen.insert(spec.name.to_string()), "dup name {}", spec.name);
            for alias in spec.aliases {
                assert!(seen.insert(alias.to_string()), "dup alias {alias}");
            }
        }
    }

    #[test]
    fn reload_is_hidden_from_help() {
        let contribution = BuiltinPlugin.provides();
        let reload = contribution
            .commands
            .iter()
            .find(|c| c.spec().name == "reload")
            .unwrap();
        assert!(reload.spec().hidden);
    }
}
