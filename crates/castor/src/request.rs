use std::fmt::Write as _;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use tracing::debug;

use crate::Error;

pub const CLIENT_NTRIP_VERSION: &str = "Ntrip/2.0";
pub const CLIENT_USER_AGENT: &str = concat!("NTRIP castor/", env!("CARGO_PKG_VERSION"));

/// One upstream credential. Host match is case-insensitive; the first
/// matching entry wins.
#[derive(Debug, Clone)]
pub struct Credential {
    pub host: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: Vec<Credential>,
}

impl CredentialStore {
    pub fn new(entries: Vec<Credential>) -> Self {
        Self { entries }
    }

    pub fn lookup(&self, host: &str) -> Option<&Credential> {
        self.entries.iter().find(|c| c.host.eq_ignore_ascii_case(host))
    }
}

/// Metadata of a request body the caller writes separately (a single
/// item, or a bulk batch joined by newlines).
#[derive(Debug, Clone, Copy)]
pub struct BodyMeta<'a> {
    pub len: usize,
    pub content_type: &'a str,
}

/// Formats the request head: request line, the fixed header set in
/// order, optional authorization, the task's extra headers, final
/// CR LF. No I/O; body bytes are the caller's concern.
pub fn build_request(
    method: &str,
    host: &str,
    port: u16,
    uri: &str,
    version: u8,
    creds: &CredentialStore,
    extra_headers: &[(String, String)],
    body: Option<BodyMeta<'_>>,
) -> Result<Bytes, Error> {
    let mut headers: Vec<(&str, String)> = Vec::new();
    headers.try_reserve(7 + extra_headers.len())?;
    headers.push(("Host", format!("{host}:{port}")));
    headers.push(("User-Agent", CLIENT_USER_AGENT.to_string()));
    headers.push(("Connection", "close".to_string()));
    headers.push(("Content-Length", body.map_or(0, |b| b.len).to_string()));
    if let Some(body) = body {
        headers.push(("Content-Type", body.content_type.to_string()));
    }
    if version == 2 {
        headers.push(("Ntrip-Version", CLIENT_NTRIP_VERSION.to_string()));
    }
    if let Some(cred) = creds.lookup(host) {
        let token = STANDARD.encode(format!("{}:{}", cred.user, cred.password));
        headers.push(("Authorization", format!("Basic {token}")));
    }

    let mut needed = method.len() + uri.len() + 13;
    for (key, value) in &headers {
        needed += key.len() + value.len() + 4;
    }
    for (key, value) in extra_headers {
        needed += key.len() + value.len() + 4;
    }

    let mut out = String::new();
    out.try_reserve(needed)?;
    let _ = write!(out, "{method} {uri} HTTP/1.1\r\n");
    debug!(method, uri, "request line");
    for (key, value) in &headers {
        debug!("request header {key}: {}", display_header_value(key, value));
        let _ = write!(out, "{key}: {value}\r\n");
    }
    for (key, value) in extra_headers {
        debug!("request header {key}: {}", display_header_value(key, value));
        let _ = write!(out, "{key}: {value}\r\n");
    }
    out.push_str("\r\n");
    Ok(Bytes::from(out))
}

/// Header value as it may appear in logs; authorization material is
/// elided.
pub fn display_header_value<'a>(key: &str, value: &'a str) -> &'a str {
    if key.eq_ignore_ascii_case("authorization") { "*****" } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_headers_in_order() {
        let req =
            build_request("GET", "ntrip.example.com", 2101, "/", 2, &CredentialStore::default(), &[], None)
                .unwrap();
        let expected = format!(
            "GET / HTTP/1.1\r\n\
             Host: ntrip.example.com:2101\r\n\
             User-Agent: {CLIENT_USER_AGENT}\r\n\
             Connection: close\r\n\
             Content-Length: 0\r\n\
             Ntrip-Version: {CLIENT_NTRIP_VERSION}\r\n\r\n"
        );
        assert_eq!(&req[..], expected.as_bytes());
    }

    #[test]
    fn body_adds_length_and_type() {
        let req = build_request(
            "POST",
            "h",
            80,
            "/push",
            2,
            &CredentialStore::default(),
            &[],
            Some(BodyMeta { len: 62, content_type: "application/json" }),
        )
        .unwrap();
        let text = std::str::from_utf8(&req).unwrap();
        assert!(text.contains("Content-Length: 62\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        // Content-Length precedes Content-Type
        assert!(text.find("Content-Length").unwrap() < text.find("Content-Type").unwrap());
    }

    #[test]
    fn ntrip_version_header_only_for_v2() {
        let req =
            build_request("GET", "h", 80, "/", 1, &CredentialStore::default(), &[], None).unwrap();
        assert!(!std::str::from_utf8(&req).unwrap().contains("Ntrip-Version"));
    }

    #[test]
    fn first_matching_credential_wins_case_insensitively() {
        let creds = CredentialStore::new(vec![
            Credential {
                host: "Other.example.com".into(),
                user: "nope".into(),
                password: "nope".into(),
            },
            Credential {
                host: "NTRIP.example.com".into(),
                user: "user".into(),
                password: "pass".into(),
            },
            Credential {
                host: "ntrip.example.com".into(),
                user: "shadowed".into(),
                password: "shadowed".into(),
            },
        ]);
        let req = build_request("GET", "ntrip.example.com", 2101, "/", 2, &creds, &[], None).unwrap();
        let text = std::str::from_utf8(&req).unwrap();
        // base64("user:pass")
        assert!(text.contains("Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(!text.contains("shadowed"));
    }

    #[test]
    fn extra_headers_follow_in_insertion_order() {
        let extra = vec![
            ("X-First".to_string(), "1".to_string()),
            ("X-Second".to_string(), "2".to_string()),
        ];
        let req =
            build_request("GET", "h", 80, "/", 2, &CredentialStore::default(), &extra, None).unwrap();
        let text = std::str::from_utf8(&req).unwrap();
        assert!(text.find("X-First: 1").unwrap() < text.find("X-Second: 2").unwrap());
        assert!(text.ends_with("X-Second: 2\r\n\r\n"));
    }

    #[test]
    fn authorization_is_elided_in_logs() {
        assert_eq!(display_header_value("Authorization", "Basic abc"), "*****");
        assert_eq!(display_header_value("authorization", "Basic abc"), "*****");
        assert_eq!(display_header_value("Host", "h:80"), "h:80");
    }
}
