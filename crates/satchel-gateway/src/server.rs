// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Router construction and server startup.

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use satchel_core::SatchelError;
use satchel_dispatch::{Dispatcher, Services};
use satchel_webhook::WebhookDispatcher;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::handlers;

/// Shared state for every request handler.
#[derive(Clone)]
pub struct GatewayState {
    pub services: Arc<Services>,
    pub dispatcher: Arc<Dispatcher>,
    pub webhook: Arc<WebhookDispatcher>,
}

/// Assemble the full route set.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        // Status and login.
        .route("/", get(handlers::get_status))
        .route("/health", get(handlers::get_health))
        .route("/qr", get(handlers::get_qr))
        .route("/login/status", get(handlers::get_login_status))
        .route("/logout", post(handlers::post_logout))
        // Quick send surface.
        .route("/send", post(handlers::post_send_simple))
        .route("/upload", post(handlers::post_upload))
        .route("/messages", get(handlers::get_messages))
        .route("/messages/{id}/download", post(handlers::post_download))
        // Bot-API compatible surface.
        .route("/bot/getUpdates", get(handlers::bot_get_updates))
        .route("/bot/sendMessage", post(handlers::bot_send_message))
        .route("/bot/sendDocument", post(handlers::bot_send_document))
        .route("/bot/sendPhoto", post(handlers::bot_send_photo))
        .route("/bot/getMe", get(handlers::bot_get_me))
        .route("/bot/getChat", get(handlers::bot_get_chat))
        .route("/bot/getFile", get(handlers::bot_get_file))
        .route("/bot/setWebhook", post(handlers::bot_set_webhook))
        .route("/bot/deleteWebhook", post(handlers::bot_delete_webhook))
        .route("/bot/getWebhookInfo", get(handlers::bot_get_webhook_info))
        // Capabilities the remote self-chat cannot express.
        .route("/bot/editMessageText", post(handlers::bot_unsupported))
        .route("/bot/deleteMessage", post(handlers::bot_unsupported))
        .route("/bot/forwardMessage", post(handlers::bot_unsupported))
        .route("/bot/sendLocation", post(handlers::bot_unsupported))
        .route("/bot/sendContact", post(handlers::bot_unsupported))
        .route("/bot/sendPoll", post(handlers::bot_unsupported))
        // Command execution.
        .route("/framework/execute", post(handlers::post_execute))
        // Plugin management.
        .route("/plugins", get(handlers::get_plugins))
        .route("/plugins/reload", post(handlers::post_plugins_reload))
        // Task management.
        .route("/tasks", get(handlers::get_tasks).post(handlers::post_tasks))
        .route("/tasks/{id}", delete(handlers::delete_task))
        .route("/tasks/{id}/enable", post(handlers::post_task_enable))
        .route("/tasks/{id}/disable", post(handlers::post_task_disable))
        .route("/tasks/{id}/run", post(handlers::post_task_run))
        // Plugin-contributed routes.
        .route("/ext/{*path}", axum::routing::any(handlers::ext_route))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn start_server(
    host: &str,
    port: u16,
    state: GatewayState,
    cancel: CancellationToken,
) -> Result<(), SatchelError> {
    let app = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SatchelError::Network {
            message: format!("failed to bind gateway to {addr}: {e}"),
            source: Some(Box::new(e)),
        })?;

    tracing::info!("gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| SatchelError::Network {
            message: format!("gateway server error: {e}"),
            source: Some(Box::new(e)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use satchel_config::SatchelConfig;
    use satchel_core::{Direction, NewMessage};
    use satchel_cron::TaskStore;
    use satchel_dispatch::{catalog, PluginContext, PluginRegistry};
    use satchel_session::{RemoteClient, RemoteHosts, SessionEngine, TraceRecorder};
    use satchel_store::{Database, UpdateLog};
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn test_router() -> (Router, Arc<Services>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = SatchelConfig::default();
        config.storage.state_path = dir.path().join("state.json").to_str().unwrap().to_string();
        config.plugins.dir = dir.path().join("plugins").to_str().unwrap().to_string();
        let config = Arc::new(config);

        let db = Database::open(dir.path().join("log.db").to_str().unwrap())
            .await
            .unwrap();
        let log = UpdateLog::new(db, 100, 1000);

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
            catalog(),
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
            config: config.clone(),
            chat_enabled: AtomicBool::new(false),
            chat: None,
            run_now_tx,
            registry,
            started_at: Instant::now(),
            http: reqwest::Client::new(),
        });

        let state = GatewayState {
            services: services.clone(),
            dispatcher: Arc::new(Dispatcher::new(services.clone())),
            webhook: Arc::new(WebhookDispatcher::new(&config.webhook)),
        };
        (build_router(state), services, dir)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn get_updates_honors_offset_and_limit() {
        let (router, services, _dir) = test_router().await;
        for i in 0..5 {
            services
                .log
                .append(NewMessage::text(Direction::Inbound, format!("m{i}")))
                .await
                .unwrap();
        }

        let response = router
            .oneshot(get("/bot/getUpdates?offset=2&limit=2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        let result = body["result"].as_array().unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["update_id"], 3);
        assert_eq!(result[0]["message"]["message_id"], 3);
        assert_eq!(result[1]["update_id"], 4);
    }

    #[tokio::test]
    async fn send_message_while_logged_out_yields_401_envelope() {
        let (router, _services, _dir) = test_router().await;
        let response = router
            .oneshot(post_json("/bot/sendMessage", serde_json::json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], 401);
    }

    #[tokio::test]
    async fn unsupported_methods_report_501_envelope() {
        let (router, _services, _dir) = test_router().await;
        let response = router
            .oneshot(post_json("/bot/editMessageText", serde_json::json!({})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], 501);
        assert!(body["description"]
            .as_str()
            .unwrap()
            .contains("not supported"));
    }

    #[tokio::test]
    async fn login_status_mirrors_boundary_code() {
        let (router, _services, _dir) = test_router().await;
        let response = router.oneshot(get("/login/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn task_lifecycle_over_http() {
        let (router, _services, _dir) = test_router().await;

        let response = router
            .clone()
            .oneshot(post_json(
                "/tasks",
                serde_json::json!({"schedule": "08:30", "command": "/status"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        let id = body["result"]["id"].as_str().unwrap().to_string();

        let response = router.clone().oneshot(get("/tasks")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["result"].as_array().unwrap().len(), 1);

        let response = router
            .clone()
            .oneshot(post_json(&format!("/tasks/{id}/disable"), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["ok"], true);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/tasks/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["ok"], true);

        // Unknown id reports a clean error.
        let response = router
            .oneshot(post_json("/tasks/nope/run", serde_json::json!({})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], 400);
    }

    #[tokio::test]
    async fn bad_schedule_is_rejected() {
        let (router, _services, _dir) = test_router().await;
        let response = router
            .oneshot(post_json(
                "/tasks",
                serde_json::json!({"schedule": "25:99", "command": "/status"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error_code"], 400);
    }

    #[tokio::test]
    async fn framework_execute_runs_commands() {
        let (router, _services, _dir) = test_router().await;
        let response = router
            .oneshot(post_json(
                "/framework/execute",
                serde_json::json!({"command": "/echo over http"}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["result"]["reply"], "over http");
    }

    #[tokio::test]
    async fn plugin_route_is_reachable_under_ext() {
        let (router, _services, _dir) = test_router().await;
        let response = router.oneshot(get("/ext/example/ping")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["result"]["pong"], true);
    }

    #[tokio::test]
    async fn plugins_listing_and_reload() {
        let (router, _services, _dir) = test_router().await;
        let response = router.clone().oneshot(get("/plugins")).await.unwrap();
        let body = body_json(response).await;
        let plugins = body["result"]["plugins"].as_array().unwrap();
        assert_eq!(plugins.len(), 2);

        let response = router
            .oneshot(post_json("/plugins/reload", serde_json::json!({})))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["result"]["loaded"], 2);
    }
}
