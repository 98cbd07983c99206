//! Request-side extraction: client address, credentials, content
//! negotiation.

use std::net::{IpAddr, SocketAddr};

use axum::http::{header, HeaderMap};
use truthgate_core::auth::{verify_admin_key, Session, SESSION_COOKIE};

use crate::server::AppState;

/// The peer address is authoritative; forwarding headers are honored only
/// from loopback peers (local dev and tests behind a front proxy).
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let peer_ip = peer.ip();
    if !peer_ip.is_loopback() {
        return peer_ip;
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    peer_ip
}

/// Candidate API key, in submission-priority order: `X-API-Key` header,
/// `api_key`/`key` query parameters, then a bearer token.
pub fn candidate_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    if let Some(query) = query {
        for wanted in ["api_key", "key"] {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if name == wanted && !value.is_empty() {
                    return Some(value.into_owned());
                }
            }
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// The session attached to the request's cookie, if still live.
pub fn session_from_headers(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let Some((name, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if name == SESSION_COOKIE {
            return state.sessions.validate(value);
        }
    }
    None
}

/// How a request authenticated, if at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    InternalKey,
    StoredKey(String),
    Session(String),
}

/// Check every accepted credential source for this request.
pub fn authenticate(state: &AppState, headers: &HeaderMap, query: Option<&str>) -> Option<Credential> {
    if let Some(key) = candidate_key(headers, query) {
        if state.internal_key.verify(&key) {
            return Some(Credential::InternalKey);
        }
        let config = state.config.current();
        if let Some(id) = verify_admin_key(&config.admin_keys, &key) {
            return Some(Credential::StoredKey(id));
        }
    }
    session_from_headers(state, headers).map(|session| Credential::Session(session.username))
}

pub fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|accept| accept.contains("text/html") || accept.contains("*/*"))
        .unwrap_or(false)
}

/// Navigational requests get the SPA index treatment: browser-facing GETs
/// with no file extension in the last path segment.
pub fn has_file_extension(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .map(|leaf| leaf.rfind('.').map(|at| at > 0).unwrap_or(false))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn key_extraction_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("from-header"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(
            candidate_key(&headers, Some("api_key=from-query")).as_deref(),
            Some("from-header")
        );

        headers.remove("x-api-key");
        assert_eq!(
            candidate_key(&headers, Some("api_key=from-query")).as_deref(),
            Some("from-query")
        );
        assert_eq!(
            candidate_key(&headers, Some("key=alt-query")).as_deref(),
            Some("alt-query")
        );
        assert_eq!(candidate_key(&headers, None).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn forwarding_headers_only_count_from_loopback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));

        let loopback: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let remote: SocketAddr = "198.51.100.1:9999".parse().unwrap();
        assert_eq!(
            client_ip(&headers, loopback),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip(&headers, remote),
            "198.51.100.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn extension_detection_ignores_directories_and_dotfiles() {
        assert!(has_file_extension("app.js"));
        assert!(has_file_extension("deep/link/file.css"));
        assert!(!has_file_extension("deep/link"));
        assert!(!has_file_extension(""));
        assert!(!has_file_extension("path/.hidden"));
    }
}
