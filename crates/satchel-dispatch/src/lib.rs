// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin registry and command dispatcher.
//!
//! Extension units implement the [`Plugin`] trait and contribute commands,
//! message handlers, and routes. The registry owns each unit's contributions
//! keyed by unit name, so unloading is a precise set-removal. Dispatch reads
//! go through an atomically swapped routing table; a reload in progress never
//! exposes a half-built chain.

pub mod builtin;
pub mod dispatch;
pub mod example;
pub mod plugin;
pub mod registry;

pub use dispatch::Dispatcher;
pub use plugin::{
    Command, CommandContext, CommandSpec, Contribution, HandlerOutcome, MessageHandler, Plugin,
    PluginContext, Route, RouteHandler, Services,
};
pub use registry::{LoadError, PluginRegistry, PluginSummary};

/// The compiled-in extension catalog: every unit the registry can load.
pub fn catalog() -> Vec<plugin::PluginFactory> {
    vec![
        || Box::new(builtin::BuiltinPlugin),
        || Box::new(example::ExamplePlugin),
    ]
}
