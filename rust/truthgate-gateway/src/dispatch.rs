//! Request classification and per-surface policy. Every path that no
//! explicit route claims lands here and is classified in a fixed order:
//! ACME challenge, API proxy, content proxy, mapped-domain gateway, then
//! the authenticated catch-all.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, request::Parts, Method, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use cid::Cid;
use truthgate_ipfs::{format_cid, CidBase, CidVersion, NodeError};

use crate::error::GateError;
use crate::extract::{accepts_html, authenticate, client_ip, has_file_extension};
use crate::host::{effective_host, resolve_host, HostTarget};
use crate::limiter::{AdminGate, Decision};
use crate::proxy::{forward, ProxyTarget, RewriteIndex};
use crate::server::AppState;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let ip = client_ip(req.headers(), peer);
    state.limiter.note_request(ip);

    let path = req.uri().path().to_string();

    // 1. ACME challenges are served in cleartext, never redirected.
    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        return match state.challenges.get(token) {
            Some(key_authorization) => key_authorization.into_response(),
            None => (StatusCode::NOT_FOUND, "Unknown challenge.").into_response(),
        };
    }

    let query = req.uri().query().map(str::to_owned);
    let host = effective_host(&state.config.current(), req.headers(), query.as_deref());

    // 2. Node RPC surface.
    if path.starts_with("/api/v0/") || path == "/api/v0" {
        return handle_api_proxy(&state, ip, host.as_deref(), req).await;
    }

    // 4. Content proxy surfaces.
    if path.starts_with("/ipfs/") || path.starts_with("/ipns/") || path == "/webui" {
        return handle_content(&state, ip, host.as_deref(), req).await;
    }

    // 5. Anything else on a mapped host is the domain gateway.
    if let Some(host) = host.as_deref() {
        if let Some(target) = resolve_host(&state.config.current(), host) {
            return handle_gateway(&state, ip, target, req).await;
        }
    }

    // 6. Unmapped host, unclaimed path: authenticated users only.
    if authenticate(&state, req.headers(), query.as_deref()).is_some() {
        return (StatusCode::NOT_FOUND, "Not found.").into_response();
    }
    if accepts_html(req.headers()) {
        let return_url = urlencode(&path);
        Redirect::temporary(&format!("/login?returnUrl={}", return_url)).into_response()
    } else {
        GateError::Unauthorized.into_response()
    }
}

/// Node RPC passthrough: key first, then session; hidden behind 404 on
/// mapped-domain hosts; oracle-proof 401 otherwise.
async fn handle_api_proxy(
    state: &Arc<AppState>,
    ip: IpAddr,
    host: Option<&str>,
    req: Request,
) -> Response {
    if let Some(host) = host {
        if resolve_host(&state.config.current(), host).is_some() {
            // The API surface does not exist as far as mapped domains are
            // concerned.
            return (StatusCode::NOT_FOUND, "Not found.").into_response();
        }
    }

    let query = req.uri().query();
    let credential = authenticate(state, req.headers(), query);
    let key_id = match &credential {
        Some(crate::extract::Credential::StoredKey(id)) => Some(id.as_str()),
        _ => None,
    };

    match state.limiter.check_admin(ip, credential.is_some(), key_id) {
        AdminGate::Banned => return GateError::Forbidden.into_response(),
        AdminGate::Unauthorized => return GateError::Unauthorized.into_response(),
        AdminGate::Allowed => {}
    }

    let mut url = state.rpc_url.clone();
    url.set_path(req.uri().path());
    let outcome = forward(&state.http_client, ProxyTarget::Api { url }, req, false).await;
    outcome.response
}

/// Content surfaces: `/ipfs`, `/ipns` and `/webui`. Unauthenticated
/// callers may only reach the CID their host maps to.
async fn handle_content(
    state: &Arc<AppState>,
    ip: IpAddr,
    host: Option<&str>,
    req: Request,
) -> Response {
    let query = req.uri().query().map(str::to_owned);
    let credential = authenticate(state, req.headers(), query.as_deref());
    let authed = credential.is_some();

    match state.limiter.check_gateway(ip, authed) {
        Decision::Banned => return GateError::Forbidden.into_response(),
        Decision::RateLimited { retry_after_secs } => {
            return GateError::RateLimited { retry_after_secs }.into_response()
        }
        Decision::Allowed => {}
    }

    let path = req.uri().path().to_string();

    if path == "/webui" {
        let is_session = matches!(credential, Some(crate::extract::Credential::Session(_)));
        if !is_session {
            return if accepts_html(req.headers()) {
                Redirect::temporary("/login?returnUrl=%2Fwebui").into_response()
            } else {
                GateError::Unauthorized.into_response()
            };
        }
        match state.node.webui_cid().await {
            Ok(Some(cid)) => {
                return Redirect::temporary(&format!("/ipfs/{}/", cid)).into_response()
            }
            Ok(None) | Err(_) => {
                let mut url = state.rpc_url.clone();
                url.set_path("/webui");
                let outcome =
                    forward(&state.http_client, ProxyTarget::Ipfs { url, rewrite: None }, req, false)
                        .await;
                return outcome.response;
            }
        }
    }

    // Only the unauthenticated scope check needs the host's own CID.
    let host_cid = if authed {
        None
    } else {
        match host {
            Some(host) => match mapped_cid(state, host).await {
                Ok(cid) => cid,
                Err(error) => return error.into_response(),
            },
            None => None,
        }
    };

    if let Some(rest) = path.strip_prefix("/ipfs/") {
        let mut rest = rest.to_string();
        let first = rest.split('/').next().unwrap_or_default().to_string();

        if Cid::try_from(first.as_str()).is_err() {
            // Not a CID: an authenticated user's SPA may be fetching
            // relative to a referenced CID.
            if authed {
                if let Some(referer_cid) = cid_from_referer(req.headers()) {
                    rest = format!("{}/{}", referer_cid, rest);
                } else {
                    return GateError::NotFoundContent.into_response();
                }
            } else {
                return reject_cross_cid(req.headers());
            }
        } else if !authed {
            let allowed = host_cid
                .as_deref()
                .map(|mapped| cids_equal(mapped, &first))
                .unwrap_or(false);
            if !allowed {
                return reject_cross_cid(req.headers());
            }
        }

        let cid_prefix = rest.split('/').next().unwrap_or_default().to_string();
        let logical = rest
            .splitn(2, '/')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        let mut url = state.gateway_url.clone();
        url.set_path(&format!("/ipfs/{}", rest));
        let rewrite = Some(RewriteIndex {
            base_prefix: format!("/ipfs/{}/", cid_prefix),
            logical_path: logical,
        });
        let outcome = forward(
            &state.http_client,
            ProxyTarget::Ipfs { url, rewrite },
            req,
            false,
        )
        .await;
        return outcome.response;
    }

    if let Some(rest) = path.strip_prefix("/ipns/") {
        let name = rest.split('/').next().unwrap_or_default().to_string();
        if name.is_empty() {
            return GateError::NotFoundContent.into_response();
        }
        if !authed {
            let resolved = match state.node.name_resolve(&name).await {
                Ok(path) => path,
                Err(NodeError::NotFound) => return GateError::NotFoundContent.into_response(),
                Err(_) => return GateError::UpstreamTransient.into_response(),
            };
            let resolved_cid = resolved.trim_start_matches("/ipfs/");
            let resolved_cid = resolved_cid.split('/').next().unwrap_or_default();
            let allowed = host_cid
                .as_deref()
                .map(|mapped| cids_equal(mapped, resolved_cid))
                .unwrap_or(false);
            if !allowed {
                return reject_cross_cid(req.headers());
            }
        }
        let mut url = state.gateway_url.clone();
        url.set_path(&format!("/ipns/{}", rest));
        let outcome =
            forward(&state.http_client, ProxyTarget::Ipns { url }, req, false).await;
        return outcome.response;
    }

    (StatusCode::NOT_FOUND, "Not found.").into_response()
}

/// The mapped-domain gateway: SPA index policy plus one stale-cache
/// retry.
async fn handle_gateway(
    state: &Arc<AppState>,
    ip: IpAddr,
    target: HostTarget,
    req: Request,
) -> Response {
    let query = req.uri().query().map(str::to_owned);
    let authed = authenticate(state, req.headers(), query.as_deref()).is_some();

    match state.limiter.check_gateway(ip, authed) {
        Decision::Banned => return GateError::Forbidden.into_response(),
        Decision::RateLimited { retry_after_secs } => {
            return GateError::RateLimited { retry_after_secs }.into_response()
        }
        Decision::Allowed => {}
    }

    // Wildcard hosts address content through the name, not a folder.
    if let HostTarget::IpnsWildcard { name, .. } = &target {
        let rest = req.uri().path().trim_start_matches('/');
        let url = state.probe.ipns_url(name, rest);
        let outcome = forward(&state.http_client, ProxyTarget::Ipns { url }, req, false).await;
        return outcome.response;
    }

    let HostTarget::Mapped { mfs_path, .. } = &target else {
        unreachable!("wildcard handled above");
    };
    let mfs_path = mfs_path.clone();

    let (mut parts, body) = req.into_parts();
    let retryable = matches!(parts.method, Method::GET | Method::HEAD);
    let mut original: Option<Body> = Some(body);

    let (cid, outcome) = match gateway_attempt(state, &mfs_path, &mut parts, &mut original).await {
        Err(error) => return error.into_response(),
        Ok(attempted) => attempted,
    };
    if !(outcome.smells_stale() && retryable) {
        return outcome.response;
    }

    // Possibly-stale cache: expire both tags and repeat the attempt
    // exactly once. A second failure is returned as-is.
    debug!(
        "stale-cache suspicion for {} ({}): invalidating and retrying",
        mfs_path, outcome.status
    );
    state.cache.invalidate_cid(&cid);
    state.cache.invalidate_mfs(&mfs_path);
    match gateway_attempt(state, &mfs_path, &mut parts, &mut original).await {
        Err(error) => error.into_response(),
        Ok((_, retried)) => retried.response,
    }
}

/// One full gateway attempt. Returns the resolved CID alongside the proxy
/// outcome so the caller can invalidate on failure.
async fn gateway_attempt(
    state: &Arc<AppState>,
    mfs_path: &str,
    parts: &mut Parts,
    original_body: &mut Option<Body>,
) -> Result<(String, crate::proxy::ProxyOutcome), GateError> {
    let cid = match state.cache.resolve_mfs_folder_to_cid(mfs_path).await {
        Ok(Some(cid)) => cid,
        Ok(None) => return Err(GateError::SiteNotFound),
        Err(error) => return Err(map_node_error(error)),
    };

    match state.cache.is_cid_local(&cid).await {
        Ok(true) => {}
        Ok(false) => return Err(GateError::NotFoundLocal),
        Err(error) => return Err(map_node_error(error)),
    }

    let rest = parts.uri.path().trim_matches('/').to_string();
    let navigational = parts.method == Method::GET
        && accepts_html(&parts.headers)
        && !has_file_extension(&rest);

    // SPA index policy: navigational requests prefer the directory index
    // (the site root's own index.html for the bare `/`).
    let mut chosen: Option<String> = None;
    if navigational {
        let probe = if rest.is_empty() {
            "index.html".to_string()
        } else {
            format!("{}/index.html", rest)
        };
        if let (true, Some(canonical)) = state
            .cache
            .path_exists_in_ipfs(&cid, &probe)
            .await
            .map_err(map_node_error)?
        {
            chosen = Some(canonical);
        }
    }

    if chosen.is_none() {
        if let (true, Some(canonical)) = state
            .cache
            .path_exists_in_ipfs(&cid, &rest)
            .await
            .map_err(map_node_error)?
        {
            chosen = Some(canonical);
        }
    }

    if chosen.is_none() {
        if navigational {
            for fallback in ["index.html", "200.html"] {
                if let (true, Some(canonical)) = state
                    .cache
                    .path_exists_in_ipfs(&cid, fallback)
                    .await
                    .map_err(map_node_error)?
                {
                    chosen = Some(canonical);
                    break;
                }
            }
        }
        if chosen.is_none() {
            return Err(GateError::NotFoundContent);
        }
    }

    let canonical = chosen.unwrap_or_default();
    let mut url = state.probe.ipfs_url(&cid, &canonical);
    url.set_query(parts.uri.query());

    let body = match original_body.take() {
        Some(body) => body,
        None => Body::empty(),
    };
    let request = Request::from_parts(parts.clone(), body);
    let outcome = forward(
        &state.http_client,
        ProxyTarget::Gateway { url },
        request,
        false,
    )
    .await;
    Ok((cid, outcome))
}

/// The current CID mapped to `host`, when the host is configured.
async fn mapped_cid(state: &Arc<AppState>, host: &str) -> Result<Option<String>, GateError> {
    let Some(target) = resolve_host(&state.config.current(), host) else {
        return Ok(None);
    };
    match target {
        HostTarget::Mapped { mfs_path, .. } => {
            match state.cache.resolve_mfs_folder_to_cid(&mfs_path).await {
                Ok(cid) => Ok(cid),
                Err(error) => Err(map_node_error(error)),
            }
        }
        HostTarget::IpnsWildcard { name, .. } => match state.node.name_resolve(&name).await {
            Ok(path) => Ok(path
                .trim_start_matches("/ipfs/")
                .split('/')
                .next()
                .map(str::to_owned)),
            Err(NodeError::NotFound) => Ok(None),
            Err(_) => Err(GateError::UpstreamTransient),
        },
    }
}

/// Compare two CID spellings, tolerating v0/v1 and base differences.
fn cids_equal(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let canon = |input: &str| {
        format_cid(input, CidVersion::V1, CidBase::Base32Lower)
            .ok()
            .unwrap_or_else(|| input.to_string())
    };
    canon(a) == canon(b)
}

fn cid_from_referer(headers: &axum::http::HeaderMap) -> Option<String> {
    let referer = headers.get(header::REFERER)?.to_str().ok()?;
    let after = referer.split("/ipfs/").nth(1)?;
    let cid = after.split(['/', '?']).next()?;
    Cid::try_from(cid).ok()?;
    Some(cid.to_string())
}

/// Unauthenticated reach beyond the host's own CID: invisible to
/// browsers, explicit to API callers.
fn reject_cross_cid(headers: &axum::http::HeaderMap) -> Response {
    if accepts_html(headers) {
        GateError::NotFoundContent.into_response()
    } else {
        GateError::Forbidden.into_response()
    }
}

fn map_node_error(error: NodeError) -> GateError {
    match error {
        NodeError::NotFound => GateError::NotFoundContent,
        NodeError::Transient(_) | NodeError::Protocol(_) => GateError::UpstreamTransient,
    }
}

fn urlencode(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn referer_cids_are_extracted_and_validated() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_static(
                "https://gate.example/ipfs/QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n/app/",
            ),
        );
        assert_eq!(
            cid_from_referer(&headers).as_deref(),
            Some("QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n")
        );

        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://gate.example/ipfs/not-a-cid/"),
        );
        assert!(cid_from_referer(&headers).is_none());
    }

    #[test]
    fn cid_equality_spans_versions() {
        let v0 = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";
        let v1 = "bafybeihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku";
        assert!(cids_equal(v0, v1));
        assert!(cids_equal(v0, v0));
        assert!(!cids_equal(v0, "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy"));
    }
}
