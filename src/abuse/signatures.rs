// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! Known attack-signature detection.
//!
//! Cheap substring screening of the request line and client identification
//! against patterns no legitimate client produces. A match is conclusive
//! evidence of probing and triggers a long-duration block upstream.

/// A named attack pattern.
struct Signature {
    name: &'static str,
    needle: &'static str,
}

/// Patterns matched against the (lowercased) request path and query.
const PATH_SIGNATURES: &[Signature] = &[
    Signature { name: "sql-injection", needle: "' or 1=1" },
    Signature { name: "sql-injection", needle: "union select" },
    Signature { name: "sql-injection", needle: "; drop table" },
    Signature { name: "xss-probe", needle: "<script" },
    Signature { name: "xss-probe", needle: "javascript:" },
    Signature { name: "path-traversal", needle: "../" },
    Signature { name: "path-traversal", needle: "..%2f" },
    Signature { name: "path-traversal", needle: "%2e%2e" },
    Signature { name: "null-byte", needle: "%00" },
];

/// Patterns matched against the (lowercased) user-agent header.
const AGENT_SIGNATURES: &[Signature] = &[
    Signature { name: "scanner", needle: "sqlmap" },
    Signature { name: "scanner", needle: "nikto" },
    Signature { name: "scanner", needle: "masscan" },
    Signature { name: "scanner", needle: "nmap" },
    Signature { name: "scanner", needle: "dirbuster" },
    Signature { name: "scanner", needle: "gobuster" },
    Signature { name: "scanner", needle: "wpscan" },
];

/// Screen a request. Returns the matched signature name, if any.
pub fn detect(endpoint: &str, user_agent: Option<&str>) -> Option<&'static str> {
    let endpoint = endpoint.to_lowercase();
    for sig in PATH_SIGNATURES {
        if endpoint.contains(sig.needle) {
            return Some(sig.name);
        }
    }

    if let Some(agent) = user_agent {
        let agent = agent.to_lowercase();
        for sig in AGENT_SIGNATURES {
            if agent.contains(sig.needle) {
                return Some(sig.name);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_requests_pass() {
        assert!(detect("/v1/sessions", Some("Mozilla/5.0")).is_none());
        assert!(detect("/v1/fields/encrypt", None).is_none());
    }

    #[test]
    fn injection_patterns_match() {
        assert_eq!(
            detect("/v1/records?id=1' OR 1=1--", None),
            Some("sql-injection")
        );
        assert_eq!(
            detect("/v1/search?q=UNION SELECT password", None),
            Some("sql-injection")
        );
    }

    #[test]
    fn traversal_and_xss_match() {
        assert_eq!(detect("/v1/files/../../etc/passwd", None), Some("path-traversal"));
        assert_eq!(detect("/v1/notes?body=<script>alert(1)</script>", None), Some("xss-probe"));
    }

    #[test]
    fn scanner_user_agents_match() {
        assert_eq!(detect("/v1/sessions", Some("sqlmap/1.7")), Some("scanner"));
        assert_eq!(detect("/", Some("Mozilla Nikto/2.1.6")), Some("scanner"));
    }
}
