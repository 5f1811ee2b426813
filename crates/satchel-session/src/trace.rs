// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remote-protocol trace recorder.
//!
//! Appends one JSON line per request/response to `trace.jsonl` in the
//! configured directory. Bodies are clipped to `max_body` bytes and run
//! through credential redaction unless redaction is disabled. Writes are
//! buffered and flushed on an interval, so recording never blocks a
//! protocol call on disk I/O.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use satchel_config::model::TraceConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FLUSH_INTERVAL_SECS: u64 = 2;

pub struct TraceRecorder {
    enabled: bool,
    redact: bool,
    max_body: usize,
    file_path: PathBuf,
    buffer: Mutex<Vec<String>>,
    seq: AtomicU64,
}

impl TraceRecorder {
    pub fn new(config: &TraceConfig) -> Self {
        let dir = PathBuf::from(&config.dir);
        if config.enabled
            && let Err(e) = std::fs::create_dir_all(&dir)
        {
            warn!(error = %e, dir = %dir.display(), "cannot create trace directory");
        }
        Self {
            enabled: config.enabled,
            redact: config.redact,
            max_body: config.max_body,
            file_path: dir.join("trace.jsonl"),
            buffer: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// A recorder that drops everything. Used in tests.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            redact: true,
            max_body: 0,
            file_path: PathBuf::from("/dev/null"),
            buffer: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }

    /// Sequence number correlating a request with its response record.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_request(&self, seq: u64, method: &str, url: &str) {
        if !self.enabled {
            return;
        }
        self.push(serde_json::json!({
            "event": "request",
            "seq": seq,
            "ts": Utc::now().timestamp_millis(),
            "method": method,
            "url": self.sanitize(url),
        }));
    }

    pub fn record_response(
        &self,
        seq: u64,
        method: &str,
        url: &str,
        status: u16,
        duration_ms: u64,
        body: &str,
    ) {
        if !self.enabled {
            return;
        }
        self.push(serde_json::json!({
            "event": "response",
            "seq": seq,
            "ts": Utc::now().timestamp_millis(),
            "method": method,
            "url": self.sanitize(url),
            "status": status,
            "duration_ms": duration_ms,
            "body_preview": self.sanitize(&clip(body, self.max_body)),
        }));
    }

    pub fn record_error(&self, seq: u64, method: &str, url: &str, error: &str) {
        if !self.enabled {
            return;
        }
        self.push(serde_json::json!({
            "event": "error",
            "seq": seq,
            "ts": Utc::now().timestamp_millis(),
            "method": method,
            "url": self.sanitize(url),
            "error": self.sanitize(error),
        }));
    }

    fn sanitize(&self, text: &str) -> String {
        if self.redact {
            satchel_security::redact(text)
        } else {
            text.to_string()
        }
    }

    fn push(&self, value: serde_json::Value) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push(value.to_string());
        }
    }

    /// Write all buffered lines to the trace file.
    pub fn flush(&self) {
        let lines: Vec<String> = match self.buffer.lock() {
            Ok(mut buffer) => buffer.drain(..).collect(),
            Err(_) => return,
        };
        if lines.is_empty() {
            return;
        }

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .and_then(|mut file| writeln!(file, "{}", lines.join("\n")));
        if let Err(e) = result {
            warn!(error = %e, "trace flush failed");
        }
    }

    /// Background flusher: drains the buffer on an interval, with a final
    /// flush when the token is cancelled.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) {
        if !self.enabled {
            return;
        }
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => recorder.flush(),
                    _ = cancel.cancelled() => {
                        recorder.flush();
                        debug!("trace flusher stopped");
                        break;
                    }
                }
            }
        });
    }
}

/// Clip to at most `max` bytes on a char boundary, noting the cut.
fn clip(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{} ...<truncated {} bytes>", &body[..end], body.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn recorder(dir: &std::path::Path, redact: bool) -> TraceRecorder {
        TraceRecorder::new(&TraceConfig {
            enabled: true,
            redact,
            max_body: 64,
            dir: dir.to_str().unwrap().to_string(),
        })
    }

    #[test]
    fn records_and_flushes_jsonl() {
        let dir = tempdir().unwrap();
        let recorder = recorder(dir.path(), true);

        let seq = recorder.next_seq();
        recorder.record_request(seq, "GET", "https://host/login?skey=SECRET123");
        recorder.record_response(seq, "GET", "https://host/login?skey=SECRET123", 200, 12, "ok");
        recorder.flush();

        let raw = std::fs::read_to_string(recorder.file_path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(!raw.contains("SECRET123"), "credentials must be redacted");

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "request");
        assert_eq!(first["seq"], 1);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["status"], 200);
    }

    #[test]
    fn redaction_can_be_disabled() {
        let dir = tempdir().unwrap();
        let recorder = recorder(dir.path(), false);
        let seq = recorder.next_seq();
        recorder.record_response(seq, "GET", "https://host/x?skey=SECRET123", 200, 1, "");
        recorder.flush();
        let raw = std::fs::read_to_string(recorder.file_path()).unwrap();
        assert!(raw.contains("SECRET123"));
    }

    #[test]
    fn body_is_clipped_at_max() {
        let long = "x".repeat(200);
        let clipped = clip(&long, 64);
        assert!(clipped.starts_with(&"x".repeat(64)));
        assert!(clipped.contains("truncated 136 bytes"));
    }

    #[test]
    fn disabled_recorder_writes_nothing() {
        let recorder = TraceRecorder::disabled();
        recorder.record_request(1, "GET", "https://host/x");
        recorder.flush();
        assert!(!recorder.enabled());
    }
}
