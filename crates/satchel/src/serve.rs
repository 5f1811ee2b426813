// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `satchel serve`: wire every component and run until shutdown.
//!
//! Task layout: one actor drives the session engine (poll + heartbeat), one
//! drives the scheduler, one pumps inbound events into the dispatcher and
//! webhook fan-out, one sweeps retention; the gateway serves in the
//! foreground. Everything watches one cancellation token.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use satchel_config::SatchelConfig;
use satchel_core::{Result, SatchelError, Update};
use satchel_cron::{ScheduledTask, Scheduler, TaskExecutor, TaskStore, Trigger};
use satchel_dispatch::{catalog, Dispatcher, PluginContext, PluginRegistry, Services};
use satchel_gateway::{start_server, GatewayState};
use satchel_session::{SessionEngine, SessionEvent, TraceRecorder};
use satchel_store::{Database, UpdateLog};
use satchel_webhook::{ChatResponder, WebhookDispatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shutdown;

pub async fn run_serve(config: SatchelConfig) -> Result<()> {
    init_tracing(&config.log.level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting satchel");

    std::fs::create_dir_all(&config.files.download_dir)?;
    std::fs::create_dir_all(&config.plugins.dir)?;
    let config = Arc::new(config);

    // Storage: the single-writer update log.
    let db = Database::open(&config.storage.message_db_path).await?;
    let log = UpdateLog::new(
        db,
        config.storage.query_default_limit,
        config.storage.query_max_limit,
    );

    let cancel = shutdown::install_signal_handler();

    // Remote-protocol trace recorder with background flusher.
    let trace = Arc::new(TraceRecorder::new(&config.trace));
    trace.spawn_flusher(cancel.clone());

    // Session engine.
    let (engine, events_rx) = SessionEngine::new(&config, log.clone(), trace)?;

    // Plugin registry from the compiled-in catalog plus manifest overrides.
    let registry = Arc::new(PluginRegistry::new(
        catalog(),
        PathBuf::from(&config.plugins.dir),
        PluginContext {
            config: config.clone(),
        },
    ));
    let load_errors = registry.load_all().await;
    for error in &load_errors {
        warn!(plugin = error.plugin.as_str(), reason = error.reason.as_str(), "plugin failed to load");
    }

    // Scheduled tasks.
    let tasks = TaskStore::load(&config.storage.task_path);
    let (run_now_tx, run_now_rx) = mpsc::channel(16);

    // Shared capability object for commands and handlers.
    let services = Arc::new(Services {
        engine: engine.clone(),
        log: log.clone(),
        tasks: tasks.clone(),
        config: config.clone(),
        chat_enabled: AtomicBool::new(config.webhook.chat_enabled),
        chat: ChatResponder::from_config(&config.webhook, &config.server.label),
        run_now_tx,
        registry: registry.clone(),
        started_at: Instant::now(),
        http: reqwest::Client::new(),
    });
    let dispatcher = Arc::new(Dispatcher::new(services.clone()));
    let webhook = Arc::new(WebhookDispatcher::new(&config.webhook));

    // Scheduler: injects task command text into the dispatcher.
    let executor = Arc::new(DispatchExecutor {
        dispatcher: dispatcher.clone(),
        engine: engine.clone(),
    });
    let scheduler = Scheduler::new(tasks.clone(), executor);
    tokio::spawn(scheduler.run(run_now_rx, cancel.clone()));

    // Inbound pump: session events -> webhook fan-out + dispatch + reply.
    tokio::spawn(inbound_pump(
        events_rx,
        dispatcher.clone(),
        webhook.clone(),
        engine.clone(),
        cancel.clone(),
    ));

    // Retention sweep, once an hour, when configured.
    if config.files.retention_days > 0 {
        tokio::spawn(retention_loop(
            log.clone(),
            config.files.retention_days,
            cancel.clone(),
        ));
    }

    // The engine actor: poll loop + heartbeat.
    let engine_task = tokio::spawn(engine.clone().run(cancel.clone()));

    // Gateway in the foreground.
    let state = GatewayState {
        services,
        dispatcher,
        webhook,
    };
    let serve_result = start_server(&config.server.host, config.server.port, state, cancel.clone()).await;

    // Shut everything down, even when the server exited with an error.
    cancel.cancel();
    if let Err(e) = engine_task.await {
        warn!(error = %e, "engine task join failed");
    }
    if let Err(e) = engine.persist().await {
        warn!(error = %e, "final session persist failed");
    }

    info!("satchel shutdown complete");
    serve_result
}

/// Runs one scheduled task's command through the dispatcher and sends any
/// reply back into the chat, tagged with the task id and trigger.
struct DispatchExecutor {
    dispatcher: Arc<Dispatcher>,
    engine: Arc<SessionEngine>,
}

#[async_trait]
impl TaskExecutor for DispatchExecutor {
    async fn execute(&self, task: &ScheduledTask, trigger: Trigger) {
        info!(task_id = task.id.as_str(), %trigger, "running scheduled task");
        let reply = self
            .dispatcher
            .dispatch(&task.command_text, None, false)
            .await;
        if let Some(reply) = reply {
            let tagged = format!("[task:{}:{trigger}] {reply}", task.id);
            match self.engine.send_text(&tagged, None).await {
                Ok(_) => {}
                Err(SatchelError::NotAuthenticated(_)) => {
                    debug!(task_id = task.id.as_str(), "task reply dropped, not logged in");
                }
                Err(e) => warn!(error = %e, task_id = task.id.as_str(), "task reply send failed"),
            }
        }
    }
}

/// Consumes session events: pushes inbound updates to the webhook target,
/// routes text through the dispatcher, and delivers replies.
async fn inbound_pump(
    mut events: mpsc::Receiver<SessionEvent>,
    dispatcher: Arc<Dispatcher>,
    webhook: Arc<WebhookDispatcher>,
    engine: Arc<SessionEngine>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = cancel.cancelled() => break,
        };
        match event {
            Some(SessionEvent::Inbound(message)) => {
                webhook.push_update(&Update::from(message.clone()));

                let reply = dispatcher.dispatch(&message.text, Some(&message), true).await;
                if let Some(reply) = reply
                    && let Err(e) = engine.send_text(&reply, Some(message.id)).await
                {
                    warn!(error = %e, message_id = message.id, "reply delivery failed");
                }
            }
            Some(SessionEvent::LoggedIn) => {
                info!("session is live");
            }
            Some(SessionEvent::LoggedOut { reason }) => {
                warn!(reason = reason.as_str(), "session ended, re-login required");
            }
            None => break,
        }
    }
    debug!("inbound pump stopped");
}

/// Hourly retention sweep over the update log.
async fn retention_loop(log: UpdateLog, retention_days: u32, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match log.purge_older_than(retention_days).await {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "retention sweep removed old messages"),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("satchel={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
