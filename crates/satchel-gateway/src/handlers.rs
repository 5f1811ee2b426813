// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request handlers for the gateway.
//!
//! The `/bot/*` surface mirrors the well-known bot-API envelope: HTTP 200
//! with `{ok, result}` on success and `{ok:false, error_code, description}`
//! on failure. Control routes (`/`, `/qr`, `/login/status`, ...) use plain
//! HTTP status codes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use satchel_core::{Message, SatchelError};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::server::GatewayState;

// --- envelope helpers ----------------------------------------------------

fn ok(result: serde_json::Value) -> Response {
    Json(json!({ "ok": true, "result": result })).into_response()
}

fn fail(code: u16, description: impl Into<String>) -> Response {
    Json(json!({
        "ok": false,
        "error_code": code,
        "description": description.into(),
    }))
    .into_response()
}

/// Map an error onto the bot-API envelope.
fn fail_from(err: &SatchelError) -> Response {
    let code = match err {
        SatchelError::NotAuthenticated(_) => 401,
        SatchelError::InvalidArgument(_) | SatchelError::NotFound(_) => 400,
        SatchelError::Unsupported(_) => 501,
        SatchelError::DeliveryFailed(_) => 502,
        _ => 500,
    };
    fail(code, err.to_string())
}

/// Marshal a stored message into the bot-API shape.
fn message_json(msg: &Message) -> serde_json::Value {
    json!({
        "message_id": msg.id,
        "date": msg.created_at,
        "text": msg.text,
        "type": msg.kind_str(),
        "is_from_bot": msg.direction == satchel_core::Direction::Outbound,
        "document": msg.attachment.as_ref().map(|a| json!({
            "file_name": a.file_name,
            "file_path": a.stored_path,
            "file_size": a.size,
        })),
        "reply_to_message_id": msg.reply_to_id,
    })
}

// --- status and login ----------------------------------------------------

pub async fn get_status(State(state): State<GatewayState>) -> Response {
    let services = &state.services;
    let login = services.engine.login_status().await;
    let stats = match services.log.stats().await {
        Ok(stats) => stats,
        Err(e) => return fail_from(&e),
    };
    let (task_count, enabled_tasks) = services.tasks.counts().unwrap_or((0, 0));
    let plugins = services.registry.summaries().await;
    let counters = state.webhook.counters();

    Json(json!({
        "service": "satchel",
        "version": env!("CARGO_PKG_VERSION"),
        "server_label": services.config.server.label,
        "uptime_seconds": services.started_at.elapsed().as_secs(),
        "login": login,
        "store": stats,
        "tasks": { "total": task_count, "enabled": enabled_tasks },
        "plugins": plugins.len(),
        "chat_enabled": services.chat_enabled.load(Ordering::Relaxed),
        "webhook": {
            "push_configured": state.webhook.configured(),
            "delivered": counters.delivered.load(Ordering::Relaxed),
            "failed": counters.failed.load(Ordering::Relaxed),
        },
    }))
    .into_response()
}

pub async fn get_health() -> Response {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

pub async fn get_qr(State(state): State<GatewayState>) -> Response {
    match state.services.engine.login_qr().await {
        Ok(Some(png)) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Ok(None) => (StatusCode::OK, "Already logged in").into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

/// Polls the login endpoint once. The HTTP status mirrors the boundary code:
/// 408 waiting for scan, 201 scanned-unconfirmed, 200 confirmed.
pub async fn get_login_status(State(state): State<GatewayState>) -> Response {
    if let Err(e) = state.services.engine.poll_login_once().await {
        warn!(error = %e, "login poll from status endpoint failed");
    }
    let detail = state.services.engine.login_status().await;
    let status = StatusCode::from_u16(detail.code).unwrap_or(StatusCode::OK);
    (status, Json(detail)).into_response()
}

pub async fn post_logout(State(state): State<GatewayState>) -> Response {
    match state.services.engine.logout().await {
        Ok(()) => ok(json!(true)),
        Err(e) => fail_from(&e),
    }
}

// --- quick send surface ---------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SimpleSend {
    pub content: String,
}

pub async fn post_send_simple(
    State(state): State<GatewayState>,
    Json(body): Json<SimpleSend>,
) -> Response {
    match state.services.engine.send_text(&body.content, None).await {
        Ok(id) => ok(json!({ "message_id": id, "text": body.content })),
        Err(e @ SatchelError::NotAuthenticated(_)) => {
            (StatusCode::UNAUTHORIZED, e.to_string()).into_response()
        }
        Err(e) => fail_from(&e),
    }
}

pub async fn post_upload(
    State(state): State<GatewayState>,
    mut multipart: Multipart,
) -> Response {
    let mut staged: Option<(String, PathBuf)> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .unwrap_or("upload.bin")
            .to_string();
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return fail(400, format!("unreadable upload: {e}")),
        };
        let staging = std::env::temp_dir().join(format!(
            "satchel_upload_{}_{file_name}",
            chrono::Utc::now().timestamp_millis()
        ));
        if let Err(e) = tokio::fs::write(&staging, &bytes).await {
            return fail(500, format!("staging upload: {e}"));
        }
        staged = Some((file_name, staging));
        break;
    }

    let Some((file_name, staging)) = staged else {
        return fail(400, "multipart field 'file' is required");
    };

    let result = state.services.engine.send_file(&staging, None).await;
    let _ = tokio::fs::remove_file(&staging).await;
    match result {
        Ok(id) => ok(json!({ "message_id": id, "file_name": file_name })),
        Err(e) => fail_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn get_messages(
    State(state): State<GatewayState>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(10);
    let max_id = match state.services.log.max_id().await {
        Ok(max) => max,
        Err(e) => return fail_from(&e),
    };
    let after = max_id - i64::from(limit.min(1000));
    match state.services.log.query(after.max(0), Some(limit)).await {
        Ok(messages) => ok(json!(messages.iter().map(message_json).collect::<Vec<_>>())),
        Err(e) => fail_from(&e),
    }
}

/// Fetch the media content of a stored inbound message into the download
/// directory. Useful when `files.auto_download` is off.
pub async fn post_download(State(state): State<GatewayState>, Path(id): Path<i64>) -> Response {
    match state.services.engine.download_attachment(id).await {
        Ok(path) => ok(json!({ "message_id": id, "file_path": path.display().to_string() })),
        Err(e) => fail_from(&e),
    }
}

// --- bot API -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GetUpdatesQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn bot_get_updates(
    State(state): State<GatewayState>,
    Query(query): Query<GetUpdatesQuery>,
) -> Response {
    match state.services.log.query(query.offset, query.limit).await {
        Ok(messages) => ok(json!(messages
            .iter()
            .map(|msg| json!({
                "update_id": msg.id,
                "message": message_json(msg),
            }))
            .collect::<Vec<_>>())),
        Err(e) => fail_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SendMessagePayload {
    pub text: String,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
    // Accepted for bot-API compatibility; the self-chat is the only peer.
    #[serde(default)]
    #[allow(dead_code)]
    pub chat_id: Option<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    pub parse_mode: Option<String>,
}

pub async fn bot_send_message(
    State(state): State<GatewayState>,
    Json(payload): Json<SendMessagePayload>,
) -> Response {
    match state
        .services
        .engine
        .send_text(&payload.text, payload.reply_to_message_id)
        .await
    {
        Ok(id) => ok(json!({
            "message_id": id,
            "date": chrono::Utc::now().timestamp(),
            "text": payload.text,
            "reply_to_message_id": payload.reply_to_message_id,
        })),
        Err(e) => fail_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SendDocumentPayload {
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
    #[serde(default)]
    pub caption: Option<String>,
}

async fn send_path(state: &GatewayState, payload: SendDocumentPayload) -> Response {
    let Some(path) = payload
        .document
        .or(payload.photo)
        .or(payload.file_path)
        .filter(|p| !p.is_empty())
    else {
        return fail(400, "Bad Request: document is required");
    };

    match state
        .services
        .engine
        .send_file(&PathBuf::from(&path), payload.reply_to_message_id)
        .await
    {
        Ok(id) => {
            if let Some(caption) = payload.caption.filter(|c| !c.is_empty())
                && let Err(e) = state.services.engine.send_text(&caption, None).await
            {
                warn!(error = %e, "caption send failed");
            }
            ok(json!({
                "message_id": id,
                "date": chrono::Utc::now().timestamp(),
                "reply_to_message_id": payload.reply_to_message_id,
            }))
        }
        Err(e) => fail_from(&e),
    }
}

pub async fn bot_send_document(
    State(state): State<GatewayState>,
    Json(payload): Json<SendDocumentPayload>,
) -> Response {
    send_path(&state, payload).await
}

pub async fn bot_send_photo(
    State(state): State<GatewayState>,
    Json(payload): Json<SendDocumentPayload>,
) -> Response {
    send_path(&state, payload).await
}

pub async fn bot_get_me(State(state): State<GatewayState>) -> Response {
    let login = state.services.engine.login_status().await;
    ok(json!({
        "id": 0,
        "is_bot": true,
        "first_name": "File Helper",
        "username": "filehelper",
        "logged_in": login.logged_in,
        "can_join_groups": false,
        "can_read_all_group_messages": false,
        "supports_inline_queries": false,
    }))
}

pub async fn bot_get_chat(State(_state): State<GatewayState>) -> Response {
    ok(json!({
        "id": 0,
        "type": "private",
        "first_name": "File Helper",
        "username": "filehelper",
    }))
}

#[derive(Debug, Deserialize)]
pub struct GetFileQuery {
    pub file_id: i64,
}

pub async fn bot_get_file(
    State(state): State<GatewayState>,
    Query(query): Query<GetFileQuery>,
) -> Response {
    match state.services.log.get(query.file_id).await {
        Ok(msg) => match msg.attachment {
            Some(att) => ok(json!({
                "file_id": msg.id,
                "file_unique_id": msg.remote_id,
                "file_size": att.size,
                "file_path": att.stored_path,
            })),
            None => fail(400, "Bad Request: message has no file"),
        },
        Err(e) => fail_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SetWebhookPayload {
    #[serde(default)]
    pub url: String,
}

pub async fn bot_set_webhook(
    State(state): State<GatewayState>,
    Json(payload): Json<SetWebhookPayload>,
) -> Response {
    state
        .webhook
        .set_push_url(Some(payload.url.trim().to_string()));
    ok(json!(true))
}

pub async fn bot_delete_webhook(State(state): State<GatewayState>) -> Response {
    state.webhook.set_push_url(None);
    ok(json!(true))
}

pub async fn bot_get_webhook_info(State(state): State<GatewayState>) -> Response {
    let counters = state.webhook.counters();
    ok(json!({
        "url": state.webhook.push_url().unwrap_or_default(),
        "has_custom_certificate": false,
        "pending_update_count": 0,
        "delivered": counters.delivered.load(Ordering::Relaxed),
        "failed": counters.failed.load(Ordering::Relaxed),
    }))
}

/// The remote self-chat has no message editing, deletion, forwarding, or
/// rich media types; report that instead of silently doing nothing.
pub async fn bot_unsupported(uri: Uri) -> Response {
    let method = uri.path().rsplit('/').next().unwrap_or("method");
    fail(
        501,
        format!("{method} is not supported by the self-chat bridge"),
    )
}

// --- command execution ----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ExecutePayload {
    pub command: String,
    #[serde(default)]
    pub send_back: bool,
}

pub async fn post_execute(
    State(state): State<GatewayState>,
    Json(payload): Json<ExecutePayload>,
) -> Response {
    let reply = state.dispatcher.dispatch(&payload.command, None, false).await;
    if payload.send_back
        && let Some(reply) = &reply
        && let Err(e) = state.services.engine.send_text(reply, None).await
    {
        warn!(error = %e, "send_back failed");
    }
    ok(json!({ "command": payload.command, "reply": reply }))
}

// --- plugin management ----------------------------------------------------

pub async fn get_plugins(State(state): State<GatewayState>) -> Response {
    let summaries = state.services.registry.summaries().await;
    let errors = state.services.registry.errors().await;
    ok(json!({ "plugins": summaries, "errors": errors }))
}

pub async fn post_plugins_reload(State(state): State<GatewayState>) -> Response {
    let errors = state.services.registry.reload_all().await;
    let summaries = state.services.registry.summaries().await;
    ok(json!({ "loaded": summaries.len(), "errors": errors }))
}

// --- task management ------------------------------------------------------

pub async fn get_tasks(State(state): State<GatewayState>) -> Response {
    match state.services.tasks.list() {
        Ok(tasks) => ok(json!(tasks)),
        Err(e) => fail_from(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AddTaskPayload {
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
}

pub async fn post_tasks(
    State(state): State<GatewayState>,
    Json(payload): Json<AddTaskPayload>,
) -> Response {
    match state
        .services
        .tasks
        .add(&payload.schedule, &payload.command, &payload.description)
    {
        Ok(task) => ok(json!(task)),
        Err(e) => fail_from(&e),
    }
}

pub async fn delete_task(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    match state.services.tasks.delete(&id) {
        Ok(true) => ok(json!(true)),
        Ok(false) => fail(400, format!("no task {id}")),
        Err(e) => fail_from(&e),
    }
}

async fn set_task_enabled(state: &GatewayState, id: &str, enabled: bool) -> Response {
    match state.services.tasks.set_enabled(id, enabled) {
        Ok(true) => ok(json!(true)),
        Ok(false) => fail(400, format!("no task {id}")),
        Err(e) => fail_from(&e),
    }
}

pub async fn post_task_enable(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    set_task_enabled(&state, &id, true).await
}

pub async fn post_task_disable(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    set_task_enabled(&state, &id, false).await
}

pub async fn post_task_run(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    match state.services.tasks.get(&id) {
        Ok(Some(_)) => match state.services.run_now_tx.send(id.clone()).await {
            Ok(()) => ok(json!({ "triggered": id })),
            Err(_) => fail(500, "scheduler not running"),
        },
        Ok(None) => fail(400, format!("no task {id}")),
        Err(e) => fail_from(&e),
    }
}

// --- plugin-contributed routes -------------------------------------------

pub async fn ext_route(
    State(state): State<GatewayState>,
    method: Method,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    let path = format!("/{path}");
    let table = state.services.registry.table();
    let Some(handler) = table.route(method.as_str(), &path) else {
        return fail(404, format!("no plugin route {} {path}", method.as_str()));
    };
    let body = body.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);
    match handler.handle(&query, body, &state.services).await {
        Ok(result) => ok(result),
        Err(e) => fail_from(&e),
    }
}
