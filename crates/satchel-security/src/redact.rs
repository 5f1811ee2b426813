// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Credential redaction for trace records and webhook payloads.
//!
//! The remote protocol carries its auth material in query strings and JSON
//! bodies. Two pattern families cover both forms; `Cookie` and
//! `Authorization` headers are always masked wholesale.

use std::sync::LazyLock;

use regex::Regex;

/// The redaction placeholder.
const REDACTED: &str = "***";

/// Credential fields that appear as `key=value` or `key: value` pairs.
static QUERY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        "pass_ticket",
        "webwx_data_ticket",
        "skey",
        "wxsid",
        "sid",
        "uin",
        "deviceid",
        "ticket",
    ]
    .iter()
    .map(|key| {
        Regex::new(&format!(r#"(?i)({key}\s*[=:]\s*)([^&\s"',;]+)"#))
            .expect("static redaction pattern")
    })
    .collect()
});

/// The same fields in JSON form: `"Skey": "..."`.
static JSON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        "pass_ticket",
        "webwx_data_ticket",
        "skey",
        "sid",
        "uin",
        "deviceid",
        "ticket",
    ]
    .iter()
    .map(|key| {
        Regex::new(&format!(r#"(?i)("{key}"\s*:\s*")[^"]*(")"#))
            .expect("static redaction pattern")
    })
    .collect()
});

/// Headers that are masked in full rather than pattern-matched.
const SENSITIVE_HEADERS: &[&str] = &["cookie", "set-cookie", "authorization"];

/// Redact credential material from a string.
pub fn redact(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in QUERY_PATTERNS.iter() {
        result = pattern.replace_all(&result, format!("${{1}}{REDACTED}")).to_string();
    }
    for pattern in JSON_PATTERNS.iter() {
        result = pattern
            .replace_all(&result, format!("${{1}}{REDACTED}${{2}}"))
            .to_string();
    }
    result
}

/// Redact a header map, masking sensitive headers entirely and running the
/// pattern set over the rest.
pub fn redact_headers<'a, I>(headers: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                (name.to_string(), REDACTED.to_string())
            } else {
                (name.to_string(), redact(value))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_query_string_credentials() {
        let input = "https://host/sync?skey=%40crypt_abc123&sid=XYZ999&r=17";
        let result = redact(input);
        assert!(!result.contains("crypt_abc123"));
        assert!(!result.contains("XYZ999"));
        assert!(result.contains("skey=***"));
        assert!(result.contains("r=17"));
    }

    #[test]
    fn redacts_json_credentials() {
        let input = r#"{"Skey":"@crypt_abc","Sid":"s-1","DeviceID":"e123","Uin":42}"#;
        let result = redact(input);
        assert!(!result.contains("@crypt_abc"));
        assert!(!result.contains("s-1"));
        assert!(!result.contains("e123"));
    }

    #[test]
    fn passes_through_innocuous_text() {
        let input = "hello world, nothing to hide";
        assert_eq!(redact(input), input);
    }

    #[test]
    fn masks_cookie_header_entirely() {
        let headers = vec![
            ("Cookie", "webwx_data_ticket=abc; wxuin=1"),
            ("Content-Type", "application/json"),
        ];
        let redacted = redact_headers(headers);
        assert_eq!(redacted[0].1, "***");
        assert_eq!(redacted[1].1, "application/json");
    }

    #[test]
    fn pass_ticket_in_form_body() {
        let input = "pass_ticket=SECRETVALUE&name=report.pdf";
        let result = redact(input);
        assert!(!result.contains("SECRETVALUE"));
        assert!(result.contains("name=report.pdf"));
    }
}
