// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The plugin registry: loads extension units from the compiled-in catalog,
//! owns their contributions, and publishes an atomically swapped dispatch
//! table.
//!
//! Failure isolation: one unit failing to load (hook error, duplicate
//! command, bad manifest) records a [`LoadError`] and never blocks the other
//! units.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::Utc;
use satchel_core::{Result, SatchelError};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::plugin::{
    Command, Contribution, MessageHandler, Plugin, PluginContext, PluginFactory, Route,
    RouteHandler,
};

/// The routing table dispatch reads. Immutable once published.
pub struct DispatchTable {
    commands: HashMap<String, Arc<dyn Command>>,
    canonical: Vec<Arc<dyn Command>>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    routes: Vec<Route>,
}

impl DispatchTable {
    fn empty() -> Self {
        Self {
            commands: HashMap::new(),
            canonical: Vec::new(),
            handlers: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Resolve a command by exact name or alias (case-insensitive).
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(&name.to_lowercase()).cloned()
    }

    /// Handlers in execution order: ascending priority, registration order
    /// within a priority.
    pub fn handlers(&self) -> &[Arc<dyn MessageHandler>] {
        &self.handlers
    }

    /// Commands in registration order, one entry per command (no aliases).
    pub fn commands(&self) -> &[Arc<dyn Command>] {
        &self.canonical
    }

    /// Resolve a plugin route by method and `/ext`-relative path.
    pub fn route(&self, method: &str, path: &str) -> Option<Arc<dyn RouteHandler>> {
        self.routes
            .iter()
            .find(|r| r.method.eq_ignore_ascii_case(method) && r.path == path)
            .map(|r| r.handler.clone())
    }

    /// The help text used for `/help` and the unknown-command fallback.
    pub fn help_text(&self) -> String {
        let mut lines = vec!["Available commands:".to_string()];
        for command in &self.canonical {
            let spec = command.spec();
            if spec.hidden {
                continue;
            }
            let aliases = if spec.aliases.is_empty() {
                String::new()
            } else {
                format!(" (aliases: {})", spec.aliases.join(", "))
            };
            lines.push(format!("  /{} - {}{}", spec.name, spec.description, aliases));
        }
        lines.join("\n")
    }
}

/// A unit that failed to load, and why.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LoadError {
    pub plugin: String,
    pub reason: String,
}

/// Listing entry for the plugin management surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PluginSummary {
    pub name: String,
    pub loaded_at: i64,
    pub commands: usize,
    pub handlers: usize,
    pub routes: usize,
}

struct LoadedPlugin {
    name: String,
    loaded_at: i64,
    plugin: Box<dyn Plugin>,
    contribution: Contribution,
}

#[derive(Default)]
struct Inner {
    loaded: Vec<LoadedPlugin>,
    errors: Vec<LoadError>,
}

/// Per-unit enablement override, one TOML file per unit in the plugin dir.
#[derive(Debug, Deserialize)]
struct ManifestOverride {
    plugin: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub struct PluginRegistry {
    factories: Vec<PluginFactory>,
    manifest_dir: PathBuf,
    ctx: PluginContext,
    inner: Mutex<Inner>,
    table: ArcSwap<DispatchTable>,
}

impl PluginRegistry {
    pub fn new(factories: Vec<PluginFactory>, manifest_dir: PathBuf, ctx: PluginContext) -> Self {
        Self {
            factories,
            manifest_dir,
            ctx,
            inner: Mutex::new(Inner::default()),
            table: ArcSwap::from_pointee(DispatchTable::empty()),
        }
    }

    /// Current routing table snapshot.
    pub fn table(&self) -> Arc<DispatchTable> {
        self.table.load_full()
    }

    /// Load every catalog unit not yet loaded, honoring manifest overrides.
    /// Per-unit failures are recorded and skipped.
    pub async fn load_all(&self) -> Vec<LoadError> {
        let mut inner = self.inner.lock().await;
        inner.errors.clear();
        self.load_units(&mut inner).await;
        self.publish(&inner);
        info!(
            loaded = inner.loaded.len(),
            errors = inner.errors.len(),
            "plugin load complete"
        );
        inner.errors.clone()
    }

    /// Unload one unit: run its hook, then remove every contribution it owns.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let index = inner
            .loaded
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| SatchelError::NotFound(format!("plugin '{name}'")))?;

        let unit = inner.loaded.remove(index);
        if let Err(e) = unit.plugin.on_unload(&self.ctx).await {
            warn!(plugin = name, error = %e, "on_unload hook failed");
        }
        self.publish(&inner);
        info!(plugin = name, "plugin unloaded");
        Ok(())
    }

    /// Unload everything, then load the catalog again. The table is swapped
    /// only after the new set is assembled, so concurrent dispatch reads see
    /// either the old table or the new one, never a partial chain.
    pub async fn reload_all(&self) -> Vec<LoadError> {
        let mut inner = self.inner.lock().await;
        for unit in inner.loaded.drain(..) {
            if let Err(e) = unit.plugin.on_unload(&self.ctx).await {
                warn!(plugin = unit.name.as_str(), error = %e, "on_unload hook failed");
            }
        }
        inner.errors.clear();
        self.load_units(&mut inner).await;
        self.publish(&inner);
        info!(loaded = inner.loaded.len(), "plugin reload complete");
        inner.errors.clone()
    }

    /// Listing for the management surface.
    pub async fn summaries(&self) -> Vec<PluginSummary> {
        let inner = self.inner.lock().await;
        inner
            .loaded
            .iter()
            .map(|p| PluginSummary {
                name: p.name.clone(),
                loaded_at: p.loaded_at,
                commands: p.contribution.commands.len(),
                handlers: p.contribution.handlers.len(),
                routes: p.contribution.routes.len(),
            })
            .collect()
    }

    /// Errors recorded by the most recent load/reload.
    pub async fn errors(&self) -> Vec<LoadError> {
        self.inner.lock().await.errors.clone()
    }

    async fn load_units(&self, inner: &mut Inner) {
        let overrides = self.read_overrides(&mut inner.errors);

        for factory in &self.factories {
            let plugin = factory();
            let name = plugin.name().to_string();

            if inner.loaded.iter().any(|p| p.name == name) {
                continue;
            }
            if overrides.get(name.as_str()) == Some(&false) {
                info!(plugin = name.as_str(), "plugin disabled by manifest");
                continue;
            }

            if let Err(e) = plugin.on_load(&self.ctx).await {
                warn!(plugin = name.as_str(), error = %e, "on_load hook failed");
                inner.errors.push(LoadError {
                    plugin: name,
                    reason: e.to_string(),
                });
                continue;
            }

            let contribution = plugin.provides();
            if let Err(reason) = check_conflicts(&inner.loaded, &contribution) {
                if let Err(e) = plugin.on_unload(&self.ctx).await {
                    warn!(plugin = name.as_str(), error = %e, "rollback on_unload failed");
                }
                inner.errors.push(LoadError {
                    plugin: name.clone(),
                    reason,
                });
                continue;
            }

            info!(
                plugin = name.as_str(),
                commands = contribution.commands.len(),
                handlers = contribution.handlers.len(),
                "plugin loaded"
            );
            inner.loaded.push(LoadedPlugin {
                name,
                loaded_at: Utc::now().timestamp(),
                plugin,
                contribution,
            });
        }
    }

    fn read_overrides(&self, errors: &mut Vec<LoadError>) -> HashMap<String, bool> {
        let mut overrides = HashMap::new();
        let Ok(entries) = std::fs::read_dir(&self.manifest_dir) else {
            return overrides;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let file = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("manifest")
                .to_string();
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| toml::from_str::<ManifestOverride>(&raw).map_err(|e| e.to_string()))
            {
                Ok(manifest) => {
                    overrides.insert(manifest.plugin, manifest.enabled);
                }
                Err(reason) => {
                    warn!(file = file.as_str(), reason = reason.as_str(), "bad plugin manifest");
                    errors.push(LoadError {
                        plugin: file,
                        reason,
                    });
                }
            }
        }
        overrides
    }

    /// Rebuild and swap the dispatch table from the loaded set.
    fn publish(&self, inner: &Inner) {
        let mut table = DispatchTable::empty();
        for unit in &inner.loaded {
            for command in &unit.contribution.commands {
                let spec = command.spec();
                table
                    .commands
                    .insert(spec.name.to_lowercase(), command.clone());
                for alias in spec.aliases {
                    table.commands.insert(alias.to_lowercase(), command.clone());
                }
                table.canonical.push(command.clone());
            }
            table.handlers.extend(unit.contribution.handlers.iter().cloned());
            table.routes.extend(unit.contribution.routes.iter().cloned());
        }
        // Stable by construction: equal priorities keep registration order.
        table.handlers.sort_by_key(|h| h.priority());
        self.table.store(Arc::new(table));
    }
}

/// A unit may not register a command name or alias another unit owns.
fn check_conflicts(loaded: &[LoadedPlugin], incoming: &Contribution) -> std::result::Result<(), String> {
    let mut taken: HashSet<String> = HashSet::new();
    for unit in loaded {
        for command in &unit.contribution.commands {
            let spec = command.spec();
            taken.insert(spec.name.to_lowercase());
            for alias in spec.aliases {
                taken.insert(alias.to_lowercase());
            }
        }
    }

    let mut own: HashSet<String> = HashSet::new();
    for command in &incoming.commands {
        let spec = command.spec();
        for key in std::iter::once(spec.name).chain(spec.aliases.iter().copied()) {
            let key = key.to_lowercase();
            if taken.contains(&key) || !own.insert(key.clone()) {
                return Err(format!("command or alias '{key}' is already registered"));
            }
        }
    }
    Ok(())
}
