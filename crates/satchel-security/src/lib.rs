// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Security helpers: credential redaction for trace/webhook output and
//! URL allowlisting for outbound proxying.

pub mod allowlist;
pub mod redact;

pub use allowlist::url_allowed;
pub use redact::{redact, redact_headers};
