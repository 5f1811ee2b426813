// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dispatch algorithm.
//!
//! For inbound text: run the handler chain in priority order (first
//! `Handled` wins), then command resolution, then -- for plain text with chat
//! mode on -- the chat responder. Every failure is converted into a visible
//! error reply; nothing here can take down the session engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use satchel_core::{Message, SatchelError};
use tracing::{debug, warn};

use crate::plugin::{CommandContext, HandlerOutcome, Services};

pub struct Dispatcher {
    services: Arc<Services>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Dispatch inbound text. `origin` is the stored message that carried the
    /// text; `allow_chat` is false for synthetic input (scheduled tasks, the
    /// management API) so it can never loop through the chat responder.
    ///
    /// Returns the reply to send, if any.
    pub async fn dispatch(
        &self,
        text: &str,
        origin: Option<&Message>,
        allow_chat: bool,
    ) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        let prefix = self.services.config.plugins.command_prefix.clone();
        let table = self.services.registry.table();
        let ctx = CommandContext::parse(text, &prefix, origin, &self.services);

        // 1. Handler chain: first non-Continue outcome short-circuits.
        for handler in table.handlers() {
            match handler.handle(&ctx).await {
                Ok(HandlerOutcome::Handled(reply)) => {
                    debug!(handler = handler.name(), "message claimed by handler");
                    return Some(reply);
                }
                Ok(HandlerOutcome::Continue) => {}
                Err(e) => {
                    // A broken handler must not block the chain.
                    warn!(handler = handler.name(), error = %e, "message handler failed");
                }
            }
        }

        // 2. Command resolution.
        if ctx.is_command {
            if ctx.command.is_empty() {
                return None;
            }
            return match table.resolve(&ctx.command) {
                Some(command) => match command.execute(&ctx).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        let err = SatchelError::CommandExecution {
                            command: ctx.command.clone(),
                            reason: e.to_string(),
                        };
                        warn!(command = ctx.command.as_str(), error = %e, "command failed");
                        Some(err.to_string())
                    }
                },
                None => Some(format!(
                    "Unknown command '{prefix}{}'.\n\n{}",
                    ctx.command,
                    table.help_text()
                )),
            };
        }

        // 3. Chat responder for plain text.
        if allow_chat
            && self.services.chat_enabled.load(Ordering::Relaxed)
            && let Some(chat) = &self.services.chat
            && let Some(origin) = origin
        {
            return Some(chat.reply(trimmed, origin).await);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        Command, CommandSpec, Contribution, MessageHandler, Plugin, PluginContext,
    };
    use crate::registry::PluginRegistry;
    use async_trait::async_trait;
    use satchel_config::SatchelConfig;
    use satchel_core::{Direction, Result};
    use satchel_cron::TaskStore;
    use satchel_session::{RemoteClient, RemoteHosts, SessionEngine, TraceRecorder};
    use satchel_store::{Database, UpdateLog};
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct EchoCommand;

    #[async_trait]
    impl Command for EchoCommand {
        fn spec(&self) -> CommandSpec {
            CommandSpec {
                name: "echo",
                aliases: &[],
                description: "repeat the arguments",
                usage: "/echo <text>",
                hidden: false,
            }
        }

        async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
            Ok(Some(ctx.args.join(" ")))
        }
    }

    struct FailingCommand;

    #[async_trait]
    impl Command for FailingCommand {
        fn spec(&self) -> CommandSpec {
            CommandSpec {
                name: "explode",
                aliases: &[],
                description: "always fails",
                usage: "/explode",
                hidden: true,
            }
        }

        async fn execute(&self, _ctx: &CommandContext<'_>) -> Result<Option<String>> {
            Err(SatchelError::Internal("kaboom".to_string()))
        }
    }

    struct SpamFilter;

    #[async_trait]
    impl MessageHandler for SpamFilter {
        fn name(&self) -> &'static str {
            "spam_filter"
        }

        fn priority(&self) -> i32 {
            10
        }

        async fn handle(&self, ctx: &CommandContext<'_>) -> Result<HandlerOutcome> {
            if ctx.raw_text.contains("spam") {
                Ok(HandlerOutcome::Handled("spam dropped".to_string()))
            } else {
                Ok(HandlerOutcome::Continue)
            }
        }
    }

    struct TestPlugin;

    #[async_trait]
    impl Plugin for TestPlugin {
        fn name(&self) -> &'static str {
            "testing"
        }

        fn provides(&self) -> Contribution {
            Contribution {
                commands: vec![Arc::new(EchoCommand), Arc::new(FailingCommand)],
                handlers: vec![],
                routes: vec![],
            }
        }
    }

    struct SpamPlugin;

    #[async_trait]
    impl Plugin for SpamPlugin {
        fn name(&self) -> &'static str {
            "spam"
        }

        fn provides(&self) -> Contribution {
            Contribution {
                commands: vec![],
                handlers: vec![Arc::new(SpamFilter)],
                routes: vec![],
            }
        }
    }

    async fn services_with(factories: Vec<crate::plugin::PluginFactory>) -> (Arc<Services>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = SatchelConfig::default();
        config.storage.state_path = dir.path().join("state.json").to_str().unwrap().to_string();
        config.plugins.dir = dir.path().join("plugins").to_str().unwrap().to_string();
        let config = Arc::new(config);

        let db = Database::open(dir.path().join("log.db").to_str().unwrap())
            .await
            .unwrap();
        let log = UpdateLog::new(db, 100, 1000);

        // The engine never talks to the network in these tests.
        let hosts = RemoteHosts::explicit(
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
        );
        let client = RemoteClient::new(
            hosts,
            Arc::new(TraceRecorder::disabled()),
            Duration::from_secs(1),
        )
        .unwrap();
        let (engine, _events) = SessionEngine::with_client(&config, client, log.clone()).unwrap();

        let registry = Arc::new(PluginRegistry::new(
            factories,
            dir.path().join("plugins"),
            PluginContext {
                config: config.clone(),
            },
        ));
        registry.load_all().await;

        let (run_now_tx, _run_now_rx) = mpsc::channel(8);
        let services = Arc::new(Services {
            engine,
            log,
            tasks: TaskStore::load(dir.path().join("tasks.json")),
            config,
            chat_enabled: AtomicBool::new(false),
            chat: None,
            run_now_tx,
            registry,
            started_at: Instant::now(),
            http: reqwest::Client::new(),
        });
        (services, dir)
    }

    fn stored(text: &str) -> Message {
        Message {
            id: 1,
            remote_id: None,
            direction: Direction::Inbound,
            text: text.to_string(),
            attachment: None,
            reply_to_id: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn echo_command_returns_arguments() {
        let (services, _dir) = services_with(vec![|| Box::new(TestPlugin)]).await;
        let dispatcher = Dispatcher::new(services);

        let reply = dispatcher
            .dispatch("/echo hello world", Some(&stored("/echo hello world")), true)
            .await;
        assert_eq!(reply.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn unknown_command_yields_help_fallback() {
        let (services, _dir) = services_with(vec![|| Box::new(TestPlugin)]).await;
        let dispatcher = Dispatcher::new(services);

        let reply = dispatcher.dispatch("/unknowncmd", None, true).await.unwrap();
        assert!(reply.contains("Unknown command '/unknowncmd'"));
        assert!(reply.contains("/echo"), "fallback lists available commands");
    }

    #[tokio::test]
    async fn command_failure_becomes_error_reply() {
        let (services, _dir) = services_with(vec![|| Box::new(TestPlugin)]).await;
        let dispatcher = Dispatcher::new(services);

        let reply = dispatcher.dispatch("/explode", None, true).await.unwrap();
        assert!(reply.contains("command 'explode' failed"));
    }

    #[tokio::test]
    async fn handler_short_circuits_before_commands() {
        let (services, _dir) =
            services_with(vec![|| Box::new(TestPlugin), || Box::new(SpamPlugin)]).await;
        let dispatcher = Dispatcher::new(services);

        let reply = dispatcher
            .dispatch("/echo buy spam now", None, true)
            .await;
        assert_eq!(reply.as_deref(), Some("spam dropped"));
    }

    #[tokio::test]
    async fn unloading_plugin_removes_its_handler() {
        let (services, _dir) =
            services_with(vec![|| Box::new(TestPlugin), || Box::new(SpamPlugin)]).await;
        let dispatcher = Dispatcher::new(services.clone());

        assert_eq!(
            dispatcher.dispatch("spam message", None, false).await.as_deref(),
            Some("spam dropped")
        );

        services.registry.unload("spam").await.unwrap();

        // Falls through the (now empty) chain; not a command, chat off.
        assert_eq!(dispatcher.dispatch("spam message", None, false).await, None);
        // Command parsing still works after the unload.
        assert_eq!(
            dispatcher.dispatch("/echo spam", None, false).await.as_deref(),
            Some("spam")
        );
    }

    #[tokio::test]
    async fn plain_text_without_chat_yields_nothing() {
        let (services, _dir) = services_with(vec![|| Box::new(TestPlugin)]).await;
        let dispatcher = Dispatcher::new(services);
        assert_eq!(dispatcher.dispatch("just chatting", None, true).await, None);
    }

    #[tokio::test]
    async fn duplicate_command_fails_only_offending_unit() {
        struct DupPlugin;

        #[async_trait]
        impl Plugin for DupPlugin {
            fn name(&self) -> &'static str {
                "dup"
            }
            fn provides(&self) -> Contribution {
                Contribution {
                    commands: vec![Arc::new(EchoCommand)],
                    handlers: vec![],
                    routes: vec![],
                }
            }
        }

        let (services, _dir) =
            services_with(vec![|| Box::new(TestPlugin), || Box::new(DupPlugin)]).await;
        let summaries = services.registry.summaries().await;
        assert_eq!(summaries.len(), 1, "duplicate unit must be rejected");
        let errors = services.registry.errors().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].reason.contains("echo"));
    }

    #[tokio::test]
    async fn failing_on_load_does_not_block_other_units() {
        struct BrokenPlugin;

        #[async_trait]
        impl Plugin for BrokenPlugin {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn provides(&self) -> Contribution {
                Contribution::default()
            }
            async fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
                Err(SatchelError::Internal("bad init".to_string()))
            }
        }

        let (services, _dir) =
            services_with(vec![|| Box::new(BrokenPlugin), || Box::new(TestPlugin)]).await;
        let summaries = services.registry.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "testing");

        let dispatcher = Dispatcher::new(services);
        assert_eq!(
            dispatcher.dispatch("/echo ok", None, false).await.as_deref(),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn reload_keeps_commands_available() {
        let (services, _dir) = services_with(vec![|| Box::new(TestPlugin)]).await;
        let dispatcher = Dispatcher::new(services.clone());

        services.registry.reload_all().await;
        assert_eq!(
            dispatcher.dispatch("/echo back", None, false).await.as_deref(),
            Some("back")
        );
    }

    #[tokio::test]
    async fn manifest_override_disables_unit() {
        let dir = TempDir::new().unwrap();
        let plugins_dir = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        std::fs::write(
            plugins_dir.join("testing.toml"),
            "plugin = \"testing\"\nenabled = false\n",
        )
        .unwrap();

        let config = Arc::new(SatchelConfig::default());
        let registry = PluginRegistry::new(
            vec![|| Box::new(TestPlugin)],
            plugins_dir,
            PluginContext {
                config: config.clone(),
            },
        );
        registry.load_all().await;
        assert!(registry.summaries().await.is_empty());
        assert!(registry.table().resolve("echo").is_none());
    }
}
