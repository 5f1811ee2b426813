// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small demonstration unit: one command, one handler, one route.
//! Disable it with a manifest file: `plugin = "example"` / `enabled = false`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use satchel_core::Result;

use crate::plugin::{
    Command, CommandContext, CommandSpec, Contribution, HandlerOutcome, MessageHandler, Plugin,
    Route, RouteHandler, Services,
};

pub struct ExamplePlugin;

#[async_trait]
impl Plugin for ExamplePlugin {
    fn name(&self) -> &'static str {
        "example"
    }

    fn provides(&self) -> Contribution {
        Contribution {
            commands: vec![Arc::new(EchoCommand)],
            handlers: vec![Arc::new(GreetingHandler)],
            routes: vec![Route {
                method: "GET",
                path: "/example/ping",
                handler: Arc::new(PingRoute),
            }],
        }
    }
}

struct EchoCommand;

#[async_trait]
impl Command for EchoCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: "echo",
            aliases: &[],
            description: "repeat the given text",
            usage: "/echo <text>",
            hidden: false,
        }
    }

    async fn execute(&self, ctx: &CommandContext<'_>) -> Result<Option<String>> {
        if ctx.args.is_empty() {
            Ok(Some("Nothing to echo.".to_string()))
        } else {
            Ok(Some(ctx.args.join(" ")))
        }
    }
}

/// Replies to bare greetings so an empty deployment feels alive. Runs late
/// (high priority value) so real filters can claim messages first.
struct GreetingHandler;

#[async_trait]
impl MessageHandler for GreetingHandler {
    fn name(&self) -> &'static str {
        "greeting"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn handle(&self, ctx: &CommandContext<'_>) -> Result<HandlerOutcome> {
        if ctx.is_command {
            return Ok(HandlerOutcome::Continue);
        }
        let normalized = ctx.raw_text.trim().to_lowercase();
        if matches!(normalized.as_str(), "hello" | "hi" | "hey") {
            Ok(HandlerOutcome::Handled(
                "Hello! Send /help to see what I can do.".to_string(),
            ))
        } else {
            Ok(HandlerOutcome::Continue)
        }
    }
}

struct PingRoute;

#[async_trait]
impl RouteHandler for PingRoute {
    async fn handle(
        &self,
        _query: &HashMap<String, String>,
        _body: serde_json::Value,
        _services: &Services,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "pong": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_contributes_one_of_each() {
        let contribution = ExamplePlugin.provides();
        assert_eq!(contribution.commands.len(), 1);
        assert_eq!(contribution.handlers.len(), 1);
        assert_eq!(contribution.routes.len(), 1);
        assert_eq!(contribution.routes[0].path, "/example/ping");
    }
}
