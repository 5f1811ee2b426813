// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbound-URL allowlisting for plugin-initiated HTTP proxying.
//!
//! With a configured allowlist only those hosts pass. With an empty
//! allowlist, only loopback and private-range hosts are permitted, so a
//! misconfigured deployment cannot be used to reach arbitrary origins.

use url::Url;

/// Returns true when `raw` is an http(s) URL whose host the configuration
/// permits as a proxy target.
pub fn url_allowed(raw: &str, allowlist: &[String]) -> bool {
    let Ok(parsed) = Url::parse(raw) else {
        return false;
    };

    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }

    let Some(host) = parsed.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    if !allowlist.is_empty() {
        return allowlist.iter().any(|allowed| allowed.eq_ignore_ascii_case(&host));
    }

    is_private_host(&host)
}

fn is_private_host(host: &str) -> bool {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return true;
    }
    if host.ends_with(".local") {
        return true;
    }
    if let Ok(addr) = host.parse::<std::net::Ipv4Addr>() {
        let octets = addr.octets();
        return octets[0] == 10
            || (octets[0] == 192 && octets[1] == 168)
            || (octets[0] == 172 && (16..=31).contains(&octets[1]));
    }
    false
}
