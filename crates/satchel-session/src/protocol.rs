// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-level client for the remote file-helper web API.
//!
//! The remote speaks a scrape-friendly dialect: login endpoints return
//! javascript snippets (`window.code = 201`), the handshake returns XML, and
//! the sync endpoints return JSON wrapped in a `BaseResponse` envelope. This
//! module owns all of that surface; the engine above it only sees typed
//! results.

use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use rand::Rng;
use regex::Regex;
use satchel_core::{Result, SatchelError};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::state::{Credentials, StoredCookie, SyncKey};
use crate::trace::TraceRecorder;

/// Application id the remote expects on every call.
const APP_ID: &str = "wx_webfilehelper";
/// The self-chat peer name.
const SELF_CHAT: &str = "filehelper";
const LANG: &str = "zh_CN";
/// Remote-side cap on upload size.
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

static UUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"window\.QRLogin\.uuid\s*=\s*"([^"]+)""#).expect("static regex"));
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"window\.code\s*=\s*(\d+)").expect("static regex"));
static REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.redirect_uri\s*=\s*"([^"]+)""#).expect("static regex")
});
static RETCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"retcode\s*:\s*"?(\d+)"?"#).expect("static regex"));
static SELECTOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"selector\s*:\s*"?(\d+)"?"#).expect("static regex"));

/// The three hosts the protocol spans, derived from the entry host.
#[derive(Debug, Clone)]
pub struct RemoteHosts {
    /// Main API host (sync, send, init).
    pub entry: String,
    /// Login/QR host.
    pub login: String,
    /// Media upload/download host.
    pub file: String,
    /// QR image host.
    pub qr: String,
}

impl RemoteHosts {
    /// Derive login and file hosts from the entry host, as the remote's own
    /// web client does.
    pub fn resolve(entry_host: &str) -> Self {
        let (login, file) = if entry_host.contains("cmfilehelper.weixin") {
            ("login.wx8.qq.com", "file.wx8.qq.com")
        } else if entry_host.contains("szfilehelper.weixin.qq.com") {
            ("login.wx2.qq.com", "file.wx2.qq.com")
        } else {
            ("login.wx.qq.com", "file.wx.qq.com")
        };
        Self {
            entry: format!("https://{entry_host}"),
            login: format!("https://{login}"),
            file: format!("https://{file}"),
            qr: "https://login.weixin.qq.com".to_string(),
        }
    }

    /// Explicit base URLs. Used by tests to point at a local mock server.
    pub fn explicit(entry: &str, login: &str, file: &str, qr: &str) -> Self {
        Self {
            entry: entry.trim_end_matches('/').to_string(),
            login: login.trim_end_matches('/').to_string(),
            file: file.trim_end_matches('/').to_string(),
            qr: qr.trim_end_matches('/').to_string(),
        }
    }
}

/// Result of one login poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginPoll {
    /// 408: still waiting for the scan.
    Waiting,
    /// 201: scanned, awaiting confirmation on the device.
    Scanned,
    /// 200: confirmed; carries the redirect used to complete the handshake.
    Confirmed { redirect: String },
    /// 400/500/0: the ticket expired; a fresh one is needed.
    TicketExpired,
}

/// Outcome of a synccheck long-poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// New messages are waiting; fetch them with [`RemoteClient::sync`].
    NewData,
    /// The long-poll timed out with nothing new.
    Quiet,
    /// The remote no longer accepts our credentials.
    Invalidated,
}

/// A message as decoded from the remote sync payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    #[serde(rename = "MsgId", default)]
    pub msg_id: String,
    #[serde(rename = "MsgType", default)]
    pub msg_type: i64,
    #[serde(rename = "AppMsgType", default)]
    pub app_msg_type: i64,
    #[serde(rename = "Content", default)]
    pub content: String,
    #[serde(rename = "FileName", default)]
    pub file_name: String,
    #[serde(rename = "FromUserName", default)]
    pub from_user_name: String,
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: String,
    #[serde(rename = "MediaId", default)]
    pub media_id: String,
    #[serde(rename = "EncryFileName", default)]
    pub encry_file_name: String,
}

impl RemoteMessage {
    /// Messages outside the self-chat are dropped at the protocol boundary.
    pub fn involves_self_chat(&self) -> bool {
        self.from_user_name == SELF_CHAT || self.to_user_name == SELF_CHAT
    }

    pub fn is_text(&self) -> bool {
        self.msg_type == 1
    }

    pub fn is_image(&self) -> bool {
        self.msg_type == 3
    }

    pub fn is_file(&self) -> bool {
        self.msg_type == 49 && self.app_msg_type == 6
    }
}

#[derive(Debug, Deserialize)]
struct BaseResponse {
    #[serde(rename = "Ret", default = "ret_err")]
    ret: i64,
    #[serde(rename = "ErrMsg", default)]
    err_msg: String,
}

fn ret_err() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(rename = "BaseResponse")]
    base: Option<BaseResponse>,
    #[serde(rename = "SyncKey")]
    sync_key: Option<SyncKey>,
    #[serde(rename = "AddMsgList", default)]
    add_msg_list: Vec<RemoteMessage>,
}

#[derive(Debug, Deserialize)]
struct InitUser {
    #[serde(rename = "UserName", default)]
    user_name: String,
    #[serde(rename = "Uin", default)]
    uin: i64,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(rename = "BaseResponse")]
    base: Option<BaseResponse>,
    #[serde(rename = "User")]
    user: Option<InitUser>,
    #[serde(rename = "SyncKey")]
    sync_key: Option<SyncKey>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(rename = "BaseResponse")]
    base: Option<BaseResponse>,
    #[serde(rename = "MsgID", default)]
    msg_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(rename = "BaseResponse")]
    base: Option<BaseResponse>,
    #[serde(rename = "MediaId", default)]
    media_id: String,
}

/// What the handshake yields.
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    pub credentials: Credentials,
    pub sync_key: SyncKey,
    pub user_name: String,
    pub cookies: Vec<StoredCookie>,
}

/// HTTP client for the remote endpoints. Stateless apart from the cookie jar;
/// credentials are passed in per call so the engine stays the single owner of
/// session state.
pub struct RemoteClient {
    http: reqwest::Client,
    jar: Arc<reqwest::cookie::Jar>,
    hosts: RemoteHosts,
    trace: Arc<TraceRecorder>,
    poll_timeout: Duration,
}

impl RemoteClient {
    pub fn new(
        hosts: RemoteHosts,
        trace: Arc<TraceRecorder>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(10))
            .timeout(poll_timeout.max(Duration::from_secs(10)))
            .build()
            .map_err(|e| SatchelError::network("building http client", e))?;
        Ok(Self {
            http,
            jar,
            hosts,
            trace,
            poll_timeout,
        })
    }

    pub fn hosts(&self) -> &RemoteHosts {
        &self.hosts
    }

    pub fn trace(&self) -> &Arc<TraceRecorder> {
        &self.trace
    }

    /// Seed the cookie jar from persisted cookies.
    pub fn restore_cookies(&self, cookies: &[StoredCookie]) {
        let Ok(url) = self.hosts.entry.parse::<reqwest::Url>() else {
            return;
        };
        for cookie in cookies {
            self.jar
                .add_cookie_str(&format!("{}={}", cookie.name, cookie.value), &url);
        }
    }

    /// Fetch a fresh login ticket (QR uuid).
    pub async fn fetch_login_ticket(&self) -> Result<String> {
        let redirect = format!("{}/cgi-bin/mmwebwx-bin/webwxnewloginpage", self.hosts.entry);
        let url = format!(
            "{}/jslogin?appid={APP_ID}&redirect_uri={}&fun=new&lang={LANG}&_={}",
            self.hosts.login,
            urlencode(&redirect),
            now_ms(),
        );
        let body = self.get_text(&url).await?;
        UUID_RE
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                SatchelError::Decode(format!(
                    "no login ticket in jslogin response: {}",
                    &body[..body.len().min(120)]
                ))
            })
    }

    /// Fetch the QR PNG for a ticket.
    pub async fn fetch_qr_png(&self, ticket: &str) -> Result<Vec<u8>> {
        let url = format!("{}/qrcode/{ticket}", self.hosts.qr);
        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "GET", &url);
        let started = Instant::now();
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        self.trace.record_response(
            seq,
            "GET",
            &url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &format!("<<binary image {} bytes>>", bytes.len()),
        );
        if !status.is_success() {
            return Err(SatchelError::Network {
                message: format!("qr fetch returned {status}"),
                source: None,
            });
        }
        Ok(bytes.to_vec())
    }

    /// Poll the login endpoint once for the given ticket.
    pub async fn poll_login(&self, ticket: &str) -> Result<LoginPoll> {
        let url = format!(
            "{}/cgi-bin/mmwebwx-bin/login?loginicon=true&uuid={}&tip=1&r={}&_={}&appid={APP_ID}",
            self.hosts.login,
            urlencode(ticket),
            !(now_secs()),
            now_ms(),
        );
        let body = self.get_text(&url).await?;
        let code = CODE_RE
            .captures(&body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
            .unwrap_or(0);

        Ok(match code {
            200 => {
                let redirect = REDIRECT_RE
                    .captures(&body)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
                    .ok_or_else(|| {
                        SatchelError::Decode("login code 200 without redirect".to_string())
                    })?;
                LoginPoll::Confirmed { redirect }
            }
            201 => LoginPoll::Scanned,
            408 => LoginPoll::Waiting,
            _ => LoginPoll::TicketExpired,
        })
    }

    /// Complete the handshake after a confirmed scan: exchange the redirect
    /// for credentials, then initialize to capture identity and sync cursor.
    pub async fn complete_login(&self, redirect: &str, device_id: &str) -> Result<HandshakeResult> {
        // The redirect carries ticket/uuid/scan as query parameters.
        let parsed: reqwest::Url = redirect
            .parse()
            .map_err(|_| SatchelError::Decode(format!("unparseable redirect: {redirect}")))?;
        let query: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };

        let ticket = get("ticket");
        let uuid = get("uuid");
        let scan = get("scan");

        let url = format!("{}/cgi-bin/mmwebwx-bin/webwxnewloginpage", self.hosts.entry);
        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "GET", &url);
        let started = Instant::now();
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("fun", "new"),
                ("version", "v2"),
                ("ticket", ticket.as_str()),
                ("uuid", uuid.as_str()),
                ("lang", LANG),
                ("scan", scan.as_str()),
            ])
            .header("mmweb_appid", APP_ID)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;

        let status = resp.status();
        let cookies = resp
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect::<Vec<_>>();
        let xml = resp
            .text()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        self.trace.record_response(
            seq,
            "GET",
            &url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &xml,
        );

        let credentials = Credentials {
            skey: xml_tag(&xml, "skey"),
            sid: xml_tag(&xml, "wxsid"),
            uin: xml_tag(&xml, "wxuin"),
            pass_ticket: xml_tag(&xml, "pass_ticket"),
        };
        if !credentials.is_complete() {
            return Err(SatchelError::Decode(
                "handshake response missing auth fields".to_string(),
            ));
        }

        let (user_name, sync_key) = self.init(&credentials, device_id).await?;
        Ok(HandshakeResult {
            credentials,
            sync_key,
            user_name,
            cookies,
        })
    }

    /// Initialize the session: returns account identity and the first cursor.
    async fn init(&self, creds: &Credentials, device_id: &str) -> Result<(String, SyncKey)> {
        let url = format!(
            "{}/cgi-bin/mmwebwx-bin/webwxinit?r={}&lang={LANG}&pass_ticket={}",
            self.hosts.entry,
            !(now_ms() as i64),
            urlencode(&creds.pass_ticket),
        );
        let payload = json!({ "BaseRequest": base_request(creds, device_id) });
        let parsed: InitResponse = self.post_json(&url, &payload).await?;

        check_base(&parsed.base, "init")?;
        let sync_key = parsed.sync_key.unwrap_or_default();
        if !sync_key.is_valid() {
            return Err(SatchelError::Decode("init returned empty sync key".to_string()));
        }
        let user_name = parsed
            .user
            .map(|u| {
                if u.user_name.is_empty() && u.uin != 0 {
                    u.uin.to_string()
                } else {
                    u.user_name
                }
            })
            .unwrap_or_default();
        Ok((user_name, sync_key))
    }

    /// Long-poll for changes. Held open by the remote up to its own timeout.
    pub async fn sync_check(
        &self,
        creds: &Credentials,
        sync_key: &SyncKey,
        device_id: &str,
    ) -> Result<SyncStatus> {
        let url = format!(
            "{}/cgi-bin/mmwebwx-bin/synccheck?r={}&skey={}&sid={}&uin={}&deviceid={}&synckey={}&mmweb_appid={APP_ID}",
            self.hosts.entry,
            now_ms(),
            urlencode(&creds.skey),
            urlencode(&creds.sid),
            urlencode(&creds.uin),
            device_id,
            urlencode(&sync_key.check_format()),
        );
        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "GET", &url);
        let started = Instant::now();
        let resp = self
            .http
            .get(&url)
            .timeout(self.poll_timeout)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        self.trace.record_response(
            seq,
            "GET",
            &url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &body,
        );

        let retcode = RETCODE_RE
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| SatchelError::Decode(format!("synccheck unparseable: {body}")))?;
        if retcode != "0" {
            debug!(retcode = retcode.as_str(), "synccheck rejected");
            return Ok(SyncStatus::Invalidated);
        }
        let selector = SELECTOR_RE
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "0".to_string());
        Ok(if selector != "0" {
            SyncStatus::NewData
        } else {
            SyncStatus::Quiet
        })
    }

    /// Fetch pending messages and the advanced cursor.
    pub async fn sync(
        &self,
        creds: &Credentials,
        sync_key: &SyncKey,
        device_id: &str,
    ) -> Result<(SyncKey, Vec<RemoteMessage>)> {
        let url = format!(
            "{}/cgi-bin/mmwebwx-bin/webwxsync?sid={}&skey={}&pass_ticket={}",
            self.hosts.entry,
            urlencode(&creds.sid),
            urlencode(&creds.skey),
            urlencode(&creds.pass_ticket),
        );
        let payload = json!({
            "BaseRequest": base_request(creds, device_id),
            "SyncKey": sync_key,
            "rr": !(now_ms() as i64),
        });
        let parsed: SyncResponse = self.post_json(&url, &payload).await?;

        match &parsed.base {
            Some(base) if base.ret == 0 => {}
            Some(base) => {
                return Err(SatchelError::SessionInvalidated(format!(
                    "sync ret={} {}",
                    base.ret, base.err_msg
                )));
            }
            None => return Err(SatchelError::Decode("sync without BaseResponse".to_string())),
        }

        let next_key = parsed.sync_key.filter(SyncKey::is_valid);
        let messages = parsed
            .add_msg_list
            .into_iter()
            .filter(RemoteMessage::involves_self_chat)
            .collect();
        Ok((next_key.unwrap_or_else(|| sync_key.clone()), messages))
    }

    /// Send a text message to the self-chat. Returns the remote message id.
    pub async fn send_text(
        &self,
        creds: &Credentials,
        device_id: &str,
        user_name: &str,
        text: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/cgi-bin/mmwebwx-bin/webwxsendmsg?lang={LANG}&pass_ticket={}",
            self.hosts.entry,
            urlencode(&creds.pass_ticket),
        );
        let client_msg_id = generate_msg_id();
        let payload = json!({
            "BaseRequest": base_request(creds, device_id),
            "Msg": {
                "Type": 1,
                "Content": text,
                "ClientMsgId": client_msg_id,
                "LocalID": client_msg_id,
                "FromUserName": user_name,
                "ToUserName": SELF_CHAT,
            },
            "Scene": 0,
        });
        let parsed: SendResponse = self.post_json(&url, &payload).await?;
        match &parsed.base {
            Some(base) if base.ret == 0 => Ok(parsed.msg_id),
            Some(base) => Err(SatchelError::DeliveryFailed(format!(
                "send ret={} {}",
                base.ret, base.err_msg
            ))),
            None => Err(SatchelError::DeliveryFailed(
                "send without BaseResponse".to_string(),
            )),
        }
    }

    /// Upload a file and send it to the self-chat. Images go out as picture
    /// messages, everything else as an app-message with attachment metadata.
    pub async fn send_file(
        &self,
        creds: &Credentials,
        device_id: &str,
        user_name: &str,
        path: &Path,
    ) -> Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        let file_size = metadata.len();
        if file_size > MAX_UPLOAD_BYTES {
            return Err(SatchelError::InvalidArgument(format!(
                "file exceeds the {} MiB upload cap",
                MAX_UPLOAD_BYTES / (1024 * 1024)
            )));
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime = guess_mime(&file_name);
        let is_image = mime.starts_with("image/");
        let content = tokio::fs::read(path).await?;
        let file_md5 = hex_md5(&content);

        let media_id = self
            .upload_media(
                creds,
                device_id,
                user_name,
                &file_name,
                mime,
                if is_image { "pic" } else { "doc" },
                &file_md5,
                content,
            )
            .await?;

        let (url, payload) = if is_image {
            let url = format!(
                "{}/cgi-bin/mmwebwx-bin/webwxsendmsgimg?fun=async&f=json&pass_ticket={}",
                self.hosts.entry,
                urlencode(&creds.pass_ticket),
            );
            let client_msg_id = generate_msg_id();
            (
                url,
                json!({
                    "BaseRequest": base_request(creds, device_id),
                    "Msg": {
                        "Type": 3,
                        "MediaId": media_id,
                        "Content": "",
                        "ClientMsgId": client_msg_id,
                        "LocalID": client_msg_id,
                        "FromUserName": user_name,
                        "ToUserName": SELF_CHAT,
                    },
                    "Scene": 0,
                }),
            )
        } else {
            let url = format!(
                "{}/cgi-bin/mmwebwx-bin/webwxsendappmsg?fun=async&f=json&lang={LANG}&pass_ticket={}",
                self.hosts.entry,
                urlencode(&creds.pass_ticket),
            );
            let client_msg_id = generate_msg_id();
            (
                url,
                json!({
                    "BaseRequest": base_request(creds, device_id),
                    "Msg": {
                        "Type": 6,
                        "Content": appmsg_xml(&file_name, file_size, &media_id),
                        "ClientMsgId": client_msg_id,
                        "LocalID": client_msg_id,
                        "FromUserName": user_name,
                        "ToUserName": SELF_CHAT,
                    },
                    "Scene": 0,
                }),
            )
        };

        let parsed: SendResponse = self.post_json(&url, &payload).await?;
        match &parsed.base {
            Some(base) if base.ret == 0 => Ok(parsed.msg_id),
            Some(base) => Err(SatchelError::DeliveryFailed(format!(
                "file send ret={} {}",
                base.ret, base.err_msg
            ))),
            None => Err(SatchelError::DeliveryFailed(
                "file send without BaseResponse".to_string(),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_media(
        &self,
        creds: &Credentials,
        device_id: &str,
        user_name: &str,
        file_name: &str,
        mime: &str,
        media_kind: &str,
        file_md5: &str,
        content: Vec<u8>,
    ) -> Result<String> {
        let data_ticket = self
            .cookie_value("webwx_data_ticket")
            .unwrap_or_default();
        if data_ticket.is_empty() {
            warn!("webwx_data_ticket cookie missing; upload will likely be rejected");
        }

        let file_size = content.len() as u64;
        let upload_request = json!({
            "UploadType": 2,
            "BaseRequest": base_request(creds, device_id),
            "ClientMediaId": generate_msg_id(),
            "TotalLen": file_size,
            "StartPos": 0,
            "DataLen": file_size,
            "MediaType": 4,
            "FromUserName": user_name,
            "ToUserName": SELF_CHAT,
            "FileMd5": file_md5,
        });

        let url = format!(
            "{}/cgi-bin/mmwebwx-bin/webwxuploadmedia?f=json&random={}",
            self.hosts.file,
            random_string(4),
        );

        let part = reqwest::multipart::Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str(mime)
            .map_err(|e| SatchelError::network("building multipart", e))?;
        let form = reqwest::multipart::Form::new()
            .text("name", file_name.to_string())
            .text("type", mime.to_string())
            .text("size", file_size.to_string())
            .text("mediatype", media_kind.to_string())
            .text("uploadmediarequest", upload_request.to_string())
            .text("webwx_data_ticket", data_ticket)
            .text("pass_ticket", creds.pass_ticket.clone())
            .part("filename", part);

        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "POST", &url);
        let started = Instant::now();
        let resp = self
            .http
            .post(&url)
            .header("mmweb_appid", APP_ID)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "POST", &url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.trace_err(seq, "POST", &url, e))?;
        self.trace.record_response(
            seq,
            "POST",
            &url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &body,
        );

        let parsed: UploadResponse = serde_json::from_str(&body)
            .map_err(|e| SatchelError::Decode(format!("upload response: {e}")))?;
        match &parsed.base {
            Some(base) if base.ret == 0 && !parsed.media_id.is_empty() => Ok(parsed.media_id),
            Some(base) => Err(SatchelError::DeliveryFailed(format!(
                "upload ret={} {}",
                base.ret, base.err_msg
            ))),
            None => Err(SatchelError::DeliveryFailed(
                "upload without BaseResponse".to_string(),
            )),
        }
    }

    /// Download an inbound message's media content.
    pub async fn download_media(
        &self,
        creds: &Credentials,
        msg: &RemoteMessage,
    ) -> Result<Vec<u8>> {
        let url = if msg.is_image() {
            format!(
                "{}/cgi-bin/mmwebwx-bin/webwxgetmsgimg?MsgID={}&skey={}&type=slave&mmweb_appid={APP_ID}",
                self.hosts.entry,
                urlencode(&msg.msg_id),
                urlencode(&creds.skey),
            )
        } else if msg.is_file() {
            let data_ticket = self.cookie_value("webwx_data_ticket").unwrap_or_default();
            format!(
                "{}/cgi-bin/mmwebwx-bin/webwxgetmedia?sender={}&mediaid={}&encryfilename={}&fromuser={}&pass_ticket={}&webwx_data_ticket={}&sid={}&mmweb_appid={APP_ID}",
                self.hosts.file,
                urlencode(&msg.from_user_name),
                urlencode(&msg.media_id),
                urlencode(&msg.encry_file_name),
                urlencode(&creds.uin),
                urlencode(&creds.pass_ticket),
                urlencode(&data_ticket),
                urlencode(&creds.sid),
            )
        } else {
            return Err(SatchelError::Unsupported(
                "message carries no downloadable media".to_string(),
            ));
        };

        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "GET", &url);
        let started = Instant::now();
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| self.trace_err(seq, "GET", &url, e))?;
        self.trace.record_response(
            seq,
            "GET",
            &url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &format!("<<binary media {} bytes>>", bytes.len()),
        );
        if !status.is_success() {
            return Err(SatchelError::Network {
                message: format!("media download returned {status}"),
                source: None,
            });
        }
        Ok(bytes.to_vec())
    }

    fn cookie_value(&self, name: &str) -> Option<String> {
        use reqwest::cookie::CookieStore;
        let url = self.hosts.entry.parse::<reqwest::Url>().ok()?;
        let header = self.jar.cookies(&url)?;
        let raw = header.to_str().ok()?.to_string();
        raw.split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "GET", url);
        let started = Instant::now();
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "GET", url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.trace_err(seq, "GET", url, e))?;
        self.trace.record_response(
            seq,
            "GET",
            url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &body,
        );
        Ok(body)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let seq = self.trace.next_seq();
        self.trace.record_request(seq, "POST", url);
        let started = Instant::now();
        let resp = self
            .http
            .post(url)
            .header("mmweb_appid", APP_ID)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.trace_err(seq, "POST", url, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.trace_err(seq, "POST", url, e))?;
        self.trace.record_response(
            seq,
            "POST",
            url,
            status.as_u16(),
            started.elapsed().as_millis() as u64,
            &body,
        );
        serde_json::from_str(&body).map_err(|e| SatchelError::Decode(format!("{url}: {e}")))
    }

    fn trace_err(&self, seq: u64, method: &str, url: &str, err: reqwest::Error) -> SatchelError {
        self.trace.record_error(seq, method, url, &err.to_string());
        SatchelError::network(format!("{method} {url}"), err)
    }
}

/// Convert a remote message into the stored form. Returns `None` for types
/// the bridge does not model.
pub fn normalize(msg: &RemoteMessage) -> Option<satchel_core::NewMessage> {
    use satchel_core::{Attachment, AttachmentKind, Direction, NewMessage};

    if msg.msg_id.is_empty() {
        return None;
    }

    let make = |text: String, attachment: Option<Attachment>| NewMessage {
        remote_id: Some(msg.msg_id.clone()),
        direction: Direction::Inbound,
        text,
        attachment,
        reply_to_id: None,
    };

    if msg.is_text() {
        Some(make(unescape_html(&msg.content), None))
    } else if msg.is_image() {
        let name = if msg.file_name.is_empty() {
            format!("img_{}.jpg", msg.msg_id)
        } else {
            msg.file_name.clone()
        };
        Some(make(
            "[Image]".to_string(),
            Some(Attachment {
                file_name: name,
                kind: AttachmentKind::Image,
                stored_path: None,
                size: None,
            }),
        ))
    } else if msg.is_file() {
        let name = if msg.file_name.is_empty() {
            format!("file_{}", msg.msg_id)
        } else {
            msg.file_name.clone()
        };
        Some(make(
            format!("[File: {name}]"),
            Some(Attachment {
                file_name: name,
                kind: AttachmentKind::File,
                stored_path: None,
                size: None,
            }),
        ))
    } else {
        None
    }
}

fn base_request(creds: &Credentials, device_id: &str) -> serde_json::Value {
    let uin: serde_json::Value = match creds.uin.parse::<i64>() {
        Ok(n) => n.into(),
        Err(_) => creds.uin.clone().into(),
    };
    json!({
        "Uin": uin,
        "Sid": creds.sid,
        "Skey": creds.skey,
        "DeviceID": device_id,
    })
}

fn check_base(base: &Option<BaseResponse>, op: &str) -> Result<()> {
    match base {
        Some(b) if b.ret == 0 => Ok(()),
        Some(b) => Err(SatchelError::SessionInvalidated(format!(
            "{op} ret={} {}",
            b.ret, b.err_msg
        ))),
        None => Err(SatchelError::Decode(format!("{op} without BaseResponse"))),
    }
}

fn xml_tag(xml: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    match (xml.find(&open), xml.find(&close)) {
        (Some(start), Some(end)) if start + open.len() <= end => {
            xml[start + open.len()..end].to_string()
        }
        _ => String::new(),
    }
}

fn parse_set_cookie(header: &str) -> Option<StoredCookie> {
    let first = header.split(';').next()?;
    let (name, value) = first.split_once('=')?;
    Some(StoredCookie {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
    })
}

/// The app-message XML envelope for file sends.
fn appmsg_xml(file_name: &str, file_size: u64, media_id: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    format!(
        "<appmsg appid='wxeb7ec651dd0aefa9' sdkver=''><title>{file_name}</title>\
         <des></des><action></action><type>6</type><content></content><url></url>\
         <lowurl></lowurl><appattach><totallen>{file_size}</totallen>\
         <attachid>{media_id}</attachid><fileext>{ext}</fileext></appattach>\
         <extinfo></extinfo></appmsg>"
    )
}

fn guess_mime(file_name: &str) -> &'static str {
    match Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

fn unescape_html(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn generate_msg_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{}{}", now_ms(), rng.gen_range(100..1000))
}

fn random_string(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn hex_md5(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
