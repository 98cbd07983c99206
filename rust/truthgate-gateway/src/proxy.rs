//! The streaming reverse proxy: one forward, no buffering beyond the copy
//! stream, errors always classified rather than thrown.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use url::Url;

/// Hop-by-hop headers never copied in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Conditional headers stripped when the caller wants a fresh fetch.
const CONDITIONAL: &[&str] = &["if-none-match", "if-modified-since"];

/// Rebase instructions for index HTML served away from its site root.
#[derive(Clone, Debug)]
pub struct RewriteIndex {
    /// Prefix for root-absolute URLs, e.g. `/ipfs/<cid>/`.
    pub base_prefix: String,
    /// The logical request path, used to decide index-likeness.
    pub logical_path: String,
}

/// Which surface a forward serves, carrying its target and per-surface
/// options.
#[derive(Clone, Debug)]
pub enum ProxyTarget {
    /// Admin RPC passthrough.
    Api { url: Url },
    /// A mapped domain serving its site content byte-for-byte.
    Gateway { url: Url },
    /// Direct `/ipfs/...` access; index-like HTML optionally gets its
    /// root-absolute URLs rebased so the SPA resolves under the gateway.
    Ipfs {
        url: Url,
        rewrite: Option<RewriteIndex>,
    },
    /// Direct `/ipns/...` content access.
    Ipns { url: Url },
}

impl ProxyTarget {
    pub fn url(&self) -> &Url {
        match self {
            ProxyTarget::Api { url } => url,
            ProxyTarget::Gateway { url } => url,
            ProxyTarget::Ipfs { url, .. } => url,
            ProxyTarget::Ipns { url } => url,
        }
    }

    fn rewrite(&self) -> Option<(&str, &str)> {
        match self {
            ProxyTarget::Ipfs {
                rewrite: Some(rewrite),
                ..
            } => Some((rewrite.base_prefix.as_str(), rewrite.logical_path.as_str())),
            _ => None,
        }
    }
}

/// The classified result of one forward. `ok` is false for any non-2xx
/// upstream status; the dispatcher reads 400/404/410 as possibly-stale
/// cache.
pub struct ProxyOutcome {
    pub ok: bool,
    pub status: StatusCode,
    pub response: Response,
}

impl ProxyOutcome {
    /// Statuses that trigger the single stale-cache retry.
    pub fn smells_stale(&self) -> bool {
        !self.ok
            && matches!(
                self.status,
                StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::GONE
            )
    }
}

/// Forward `req` to `target`, streaming both bodies. Never returns an
/// error: upstream connection failures become a classified 502.
pub async fn forward(
    client: &reqwest::Client,
    target: ProxyTarget,
    req: Request,
    fresh: bool,
) -> ProxyOutcome {
    let (parts, body) = req.into_parts();
    let query = parts.uri.query().map(str::to_owned);

    let mut url = target.url().clone();
    if url.query().is_none() {
        url.set_query(query.as_deref());
    }

    let mut outbound = client.request(parts.method.clone(), url);
    for (name, value) in parts.headers.iter() {
        if !copies_inbound(name, fresh) {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    if !matches!(parts.method, Method::GET | Method::HEAD) {
        outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = match outbound.send().await {
        Ok(upstream) => upstream,
        Err(error) => {
            warn!("proxy forward failed: {}", error);
            return ProxyOutcome {
                ok: false,
                status: StatusCode::BAD_GATEWAY,
                response: plain_response(StatusCode::BAD_GATEWAY, "Upstream failure."),
            };
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();

    let rewrite = target
        .rewrite()
        .filter(|(_, logical)| is_index_like(logical))
        .filter(|_| is_html(&upstream_headers));

    let response = if let Some((base_prefix, _)) = rewrite {
        match upstream.bytes().await {
            Ok(bytes) => {
                let rewritten = match std::str::from_utf8(&bytes) {
                    Ok(html) => rewrite_root_absolute(html, base_prefix).into_bytes(),
                    Err(_) => bytes.to_vec(),
                };
                let mut response = copy_response_headers(status, &upstream_headers, true);
                *response.body_mut() = Body::from(rewritten);
                response
            }
            Err(error) => {
                warn!("proxy body read failed: {}", error);
                plain_response(StatusCode::BAD_GATEWAY, "Upstream failure.")
            }
        }
    } else {
        let mut response = copy_response_headers(status, &upstream_headers, false);
        *response.body_mut() = Body::from_stream(upstream.bytes_stream());
        response
    };

    ProxyOutcome {
        ok: status.is_success(),
        status,
        response,
    }
}

fn copies_inbound(name: &HeaderName, fresh: bool) -> bool {
    let lowered = name.as_str();
    if lowered == "host" || lowered == "content-length" {
        return false;
    }
    if HOP_BY_HOP.contains(&lowered) {
        return false;
    }
    if fresh && CONDITIONAL.contains(&lowered) {
        return false;
    }
    true
}

fn copy_response_headers(status: StatusCode, upstream: &HeaderMap, rewritten: bool) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream.iter() {
        let lowered = name.as_str();
        if HOP_BY_HOP.contains(&lowered) {
            continue;
        }
        if rewritten && lowered == "content-length" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    response
}

fn plain_response(status: StatusCode, body: &'static str) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/html"))
        .unwrap_or(false)
}

/// A logical path reads as an index when it is the site root, a directory,
/// or an explicit `index.html`.
pub fn is_index_like(logical_path: &str) -> bool {
    logical_path.is_empty()
        || logical_path.ends_with('/')
        || logical_path
            .rsplit('/')
            .next()
            .map(|leaf| leaf.eq_ignore_ascii_case("index.html"))
            .unwrap_or(false)
}

/// Rebase root-absolute `href`/`src`/`action` attributes under
/// `base_prefix` (which ends with `/`), leaving protocol-relative `//`
/// URLs alone.
pub fn rewrite_root_absolute(html: &str, base_prefix: &str) -> String {
    let mut output = html.to_string();
    for attribute in ["href", "src", "action"] {
        for quote in ['"', '\''] {
            let pattern = format!("{}={}/", attribute, quote);
            let replacement = format!("{}={}{}", attribute, quote, base_prefix);
            output = replace_unless_double_slash(&output, &pattern, &replacement);
        }
    }
    output
}

fn replace_unless_double_slash(input: &str, pattern: &str, replacement: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(index) = rest.find(pattern) {
        let after = index + pattern.len();
        output.push_str(&rest[..index]);
        if rest[after..].starts_with('/') {
            // Protocol-relative URL: copy through untouched.
            output.push_str(pattern);
        } else {
            output.push_str(replacement);
        }
        rest = &rest[after..];
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_like_paths() {
        assert!(is_index_like(""));
        assert!(is_index_like("docs/"));
        assert!(is_index_like("index.html"));
        assert!(is_index_like("deep/Index.HTML"));
        assert!(!is_index_like("app.js"));
        assert!(!is_index_like("deep/link"));
    }

    #[test]
    fn root_absolute_urls_get_the_base_prefix() {
        let html = r#"<a href="/about"><img src='/logo.png'><form action="/submit">"#;
        let rewritten = rewrite_root_absolute(html, "/ipfs/QmAAA/");
        assert_eq!(
            rewritten,
            r#"<a href="/ipfs/QmAAA/about"><img src='/ipfs/QmAAA/logo.png'><form action="/ipfs/QmAAA/submit">"#
        );
    }

    #[test]
    fn protocol_relative_and_relative_urls_are_untouched() {
        let html = r#"<script src="//cdn.example.com/x.js"></script><a href="about.html">"#;
        assert_eq!(rewrite_root_absolute(html, "/ipfs/QmAAA/"), html);
    }

    #[test]
    fn stale_smell_covers_exactly_400_404_410() {
        for (status, smells) in [
            (StatusCode::BAD_REQUEST, true),
            (StatusCode::NOT_FOUND, true),
            (StatusCode::GONE, true),
            (StatusCode::INTERNAL_SERVER_ERROR, false),
            (StatusCode::BAD_GATEWAY, false),
        ] {
            let outcome = ProxyOutcome {
                ok: false,
                status,
                response: plain_response(status, ""),
            };
            assert_eq!(outcome.smells_stale(), smells, "{}", status);
        }
        let ok = ProxyOutcome {
            ok: true,
            status: StatusCode::OK,
            response: plain_response(StatusCode::OK, ""),
        };
        assert!(!ok.smells_stale());
    }
}
