//! Explicitly routed endpoints: auth, the TruthGate admin API, the public
//! host-scoped lookups and certificate administration.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Multipart, Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::json;
use truthgate_core::auth::{verify_user, SESSION_COOKIE};
use truthgate_core::DomainBackup;
use truthgate_ipfs::{v0_and_v1, NodeError, TgpPointer};

use crate::dispatch;
use crate::error::GateError;
use crate::extract::{authenticate, client_ip, session_from_headers, Credential};
use crate::host::{effective_host, resolve_host, HostTarget};
use crate::limiter::{AdminGate, Decision};
use crate::publish::{build_backup, import_backup};
use crate::server::AppState;

const LOGIN_PAGE: &str = r#"<!doctype html>
<html><head><title>TruthGate</title></head>
<body>
<form method="post" action="/auth/login">
  <input type="hidden" name="returnUrl" value="" />
  <label>Username <input name="username" autocomplete="username" /></label>
  <label>Password <input name="password" type="password" autocomplete="current-password" /></label>
  <button type="submit">Sign in</button>
</form>
</body></html>
"#;

pub async fn login_page() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginSubmission {
    username: String,
    password: String,
    #[serde(rename = "returnUrl")]
    return_url: Option<String>,
}

/// POST /auth/login: form or JSON body; sets the session cookie on a
/// password-hash match.
pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    body: String,
) -> Response {
    let ip = client_ip(&headers, peer);
    match state.limiter.check_public(ip) {
        Decision::Allowed => {}
        Decision::RateLimited { retry_after_secs } => {
            return GateError::RateLimited { retry_after_secs }.into_response()
        }
        Decision::Banned => return GateError::Forbidden.into_response(),
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false);
    let submission: LoginSubmission = if is_json {
        match serde_json::from_str(&body) {
            Ok(submission) => submission,
            Err(error) => return GateError::BadRequest(error.to_string()).into_response(),
        }
    } else {
        let mut submission = LoginSubmission::default();
        for (name, value) in url::form_urlencoded::parse(body.as_bytes()) {
            match name.as_ref() {
                "username" => submission.username = value.into_owned(),
                "password" => submission.password = value.into_owned(),
                "returnUrl" => submission.return_url = Some(value.into_owned()),
                _ => {}
            }
        }
        submission
    };

    let config = state.config.current();
    if !verify_user(&config.users, &submission.username, &submission.password) {
        warn!("failed login for {:?} from {}", submission.username, ip);
        return GateError::Unauthorized.into_response();
    }

    let token = state.sessions.create(&submission.username);
    let cookie = Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .secure(true)
        .http_only(true)
        .same_site(SameSite::None)
        .build();
    let jar = jar.add(cookie);

    if is_json {
        (jar, Json(json!({ "ok": true }))).into_response()
    } else {
        let target = submission
            .return_url
            .filter(|url| url.starts_with('/'))
            .unwrap_or_else(|| "/".to_string());
        (jar, Redirect::to(&target)).into_response()
    }
}

/// POST /auth/logout: clears the session.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    if session_from_headers(&state, &headers).is_none() {
        return GateError::Unauthorized.into_response();
    }
    if let Some(cookies) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == SESSION_COOKIE {
                    state.sessions.remove(value);
                }
            }
        }
    }
    let jar = jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/").build());
    (jar, Json(json!({ "ok": true }))).into_response()
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Shared gate for the admin surface: any accepted credential passes;
/// refusals are oracle-proof.
fn require_admin(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    query: Option<&str>,
    peer: SocketAddr,
) -> Result<String, Response> {
    let ip = client_ip(headers, peer);
    let credential = authenticate(state, headers, query);
    let key_id = match &credential {
        Some(Credential::StoredKey(id)) => Some(id.as_str()),
        _ => None,
    };
    match state.limiter.check_admin(ip, credential.is_some(), key_id) {
        AdminGate::Allowed => Ok(match credential {
            Some(Credential::StoredKey(id)) => id,
            Some(Credential::Session(user)) => user,
            _ => "internal".to_string(),
        }),
        AdminGate::Unauthorized => Err(GateError::Unauthorized.into_response()),
        AdminGate::Banned => Err(GateError::Forbidden.into_response()),
    }
}

/// POST /api/truthgate/v1/admin/:domain/publish: multipart site upload.
pub async fn publish_site(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(domain): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }

    let config = state.config.current();
    let Some(record) = config.find_domain(&domain) else {
        return GateError::BadRequest(format!("domain {} is not configured", domain))
            .into_response();
    };

    let note = query
        .as_deref()
        .and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(name, _)| name == "note")
                .map(|(_, value)| value.into_owned())
        });

    match state.publish.ingest(record, &mut multipart, note).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(json!({ "job": job_id }))).into_response(),
        Err(error) => error.into_response(),
    }
}

/// GET /api/truthgate/v1/admin/publish/:job/status
pub async fn publish_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(job): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    match state.publish.outcome(&job) {
        Some(outcome) => Json(outcome).into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown job.").into_response(),
    }
}

/// GET /api/truthgate/v1/admin/:domain/backup?passphrase=…
pub async fn backup_domain(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(domain): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    let Some(passphrase) = query_param(query.as_deref(), "passphrase") else {
        return GateError::BadRequest("passphrase is required".into()).into_response();
    };

    let config = state.config.current();
    let Some(record) = config.find_domain(&domain) else {
        return GateError::BadRequest(format!("domain {} is not configured", domain))
            .into_response();
    };

    match build_backup(&state.node, record, &passphrase).await {
        Ok(backup) => Json(backup).into_response(),
        Err(error) => {
            error!("backup failed for {}: {:#}", domain, error);
            GateError::BadRequest(error.to_string()).into_response()
        }
    }
}

/// POST /api/truthgate/v1/admin/import?passphrase=…[&restore_content=1]
pub async fn import_domain(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    Json(backup): Json<DomainBackup>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    let Some(passphrase) = query_param(query.as_deref(), "passphrase") else {
        return GateError::BadRequest("passphrase is required".into()).into_response();
    };
    let restore_content = query_param(query.as_deref(), "restore_content")
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    match import_backup(
        &state.node,
        &state.config_store,
        &backup,
        &passphrase,
        restore_content,
    )
    .await
    {
        Ok(record) => Json(json!({
            "domain": record.domain,
            "ipns_key_name": record.ipns_key_name,
            "ipns_peer_id": record.ipns_peer_id,
        }))
        .into_response(),
        Err(error) => {
            error!("import failed: {:#}", error);
            GateError::BadRequest(error.to_string()).into_response()
        }
    }
}

/// GET /api/truthgate/v1/admin/metrics
pub async fn metrics_snapshot(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    Json(state.metrics.snapshot()).into_response()
}

/// GET /api/truthgate/v1/admin/rate/status
pub async fn rate_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    Json(state.limiter.snapshot()).into_response()
}

/// POST /api/truthgate/v1/admin/rate/unban?ip=…
pub async fn rate_unban(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let actor = match require_admin(&state, &headers, query.as_deref(), peer) {
        Ok(actor) => actor,
        Err(denied) => return denied,
    };
    let Some(ip) = query_param(query.as_deref(), "ip").and_then(|raw| raw.parse().ok()) else {
        return GateError::BadRequest("a valid ip is required".into()).into_response();
    };
    let removed = state.limiter.unban(ip, &actor);
    Json(json!({ "removed": removed })).into_response()
}

/// POST (add) and DELETE (remove) /api/truthgate/v1/admin/rate/whitelist
pub async fn whitelist_add(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let actor = match require_admin(&state, &headers, query.as_deref(), peer) {
        Ok(actor) => actor,
        Err(denied) => return denied,
    };
    let Some(ip) = query_param(query.as_deref(), "ip").and_then(|raw| raw.parse().ok()) else {
        return GateError::BadRequest("a valid ip is required".into()).into_response();
    };
    let days = query_param(query.as_deref(), "days").and_then(|raw| raw.parse().ok());
    let by_prefix = query_param(query.as_deref(), "prefix64")
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    if by_prefix {
        if !state.limiter.add_whitelist_prefix(ip, days, &actor) {
            return GateError::BadRequest("prefix64 requires an IPv6 address".into())
                .into_response();
        }
    } else {
        state.limiter.add_whitelist(ip, days, false, &actor, None);
    }
    Json(json!({ "ok": true })).into_response()
}

pub async fn whitelist_remove(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let actor = match require_admin(&state, &headers, query.as_deref(), peer) {
        Ok(actor) => actor,
        Err(denied) => return denied,
    };
    let Some(ip) = query_param(query.as_deref(), "ip").and_then(|raw| raw.parse().ok()) else {
        return GateError::BadRequest("a valid ip is required".into()).into_response();
    };
    let removed = state.limiter.remove_whitelist(ip, &actor);
    Json(json!({ "removed": removed })).into_response()
}

/// GET /api/truthgate/v1/admin/domains: configured domains with live CID
/// and pin state.
pub async fn list_domains(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }

    let config = state.config.current();
    let mut domains = Vec::new();
    for record in config.domains.iter() {
        let cid = state
            .cache
            .resolve_mfs_folder_to_cid(&record.site_mfs_path())
            .await
            .ok()
            .flatten();
        let local = match cid.as_deref() {
            Some(cid) => state.cache.is_cid_local(cid).await.unwrap_or(false),
            None => false,
        };
        domains.push(json!({
            "domain": record.domain,
            "use_tls": record.use_tls,
            "cid": cid,
            "local": local,
            "ipns_key_name": record.ipns_key_name,
            "ipns_peer_id": record.ipns_peer_id,
            "last_published_cid": record.last_published_cid,
        }));
    }
    Json(json!({ "domains": domains })).into_response()
}

/// GET /api/truthgate/v1/GetDomainCid: host-scoped, public.
pub async fn get_domain_cid(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    match state.limiter.check_public(ip) {
        Decision::Allowed => {}
        Decision::RateLimited { retry_after_secs } => {
            return GateError::RateLimited { retry_after_secs }.into_response()
        }
        Decision::Banned => return GateError::Forbidden.into_response(),
    }

    let config = state.config.current();
    let Some(host) = effective_host(&config, &headers, query.as_deref()) else {
        return GateError::BadRequest("no host".into()).into_response();
    };
    let Some(HostTarget::Mapped { record, mfs_path }) = resolve_host(&config, &host) else {
        return (StatusCode::NOT_FOUND, "Not found.").into_response();
    };

    match state.cache.resolve_mfs_folder_to_cid(&mfs_path).await {
        Ok(Some(cid)) => {
            let (cidv0, cidv1) = v0_and_v1(&cid);
            Json(json!({
                "domain": record.domain,
                "cidv0": cidv0,
                "cidv1": cidv1,
            }))
            .into_response()
        }
        Ok(None) => GateError::SiteNotFound.into_response(),
        Err(_) => GateError::UpstreamTransient.into_response(),
    }
}

/// GET /api/truthgate/v1/GetDomainIpns: current TGP pointer and published
/// CID.
pub async fn get_domain_ipns(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    match state.limiter.check_public(ip) {
        Decision::Allowed => {}
        Decision::RateLimited { retry_after_secs } => {
            return GateError::RateLimited { retry_after_secs }.into_response()
        }
        Decision::Banned => return GateError::Forbidden.into_response(),
    }

    let config = state.config.current();
    let Some(host) = effective_host(&config, &headers, query.as_deref()) else {
        return GateError::BadRequest("no host".into()).into_response();
    };
    let Some(record) = config.find_domain(&host) else {
        return (StatusCode::NOT_FOUND, "Not found.").into_response();
    };

    let pointer_path = format!("{}/tgp.json", record.tgp_mfs_path());
    let pointer = match state.node.files_read(&pointer_path).await {
        Ok(bytes) => serde_json::from_slice::<TgpPointer>(&bytes).ok(),
        Err(NodeError::NotFound) => None,
        Err(_) => return GateError::UpstreamTransient.into_response(),
    };

    Json(json!({
        "domain": record.domain,
        "ipns_peer_id": record.ipns_peer_id,
        "last_published_cid": record.last_published_cid,
        "tgp": pointer,
    }))
    .into_response()
}

/// POST /_acme/issue/:host: queue an issuance.
pub async fn acme_issue(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(host): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    let host = host.to_ascii_lowercase();
    if state.config.current().find_domain(&host).is_none() {
        return GateError::BadRequest(format!("host {} is not configured", host)).into_response();
    }
    let _ = state.acme_issue_tx.send(host);
    StatusCode::ACCEPTED.into_response()
}

/// GET /_acme/status/:host
pub async fn acme_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(host): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers, query.as_deref(), peer) {
        return denied;
    }
    let host = host.to_ascii_lowercase();
    match state.certs.meta(&host) {
        Some(meta) => Json(json!({
            "host": host,
            "exists": true,
            "notAfter": meta.not_after.to_rfc3339(),
            "staging": meta.staging,
        }))
        .into_response(),
        None => Json(json!({
            "host": host,
            "exists": false,
            "notAfter": null,
        }))
        .into_response(),
    }
}

/// Plain-HTTP front door: ACME challenges answered in place, everything
/// else redirected to TLS.
pub async fn http_entry(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> Response {
    let path = req.uri().path();
    if path.starts_with("/.well-known/acme-challenge/") {
        return dispatch::dispatch(State(state), ConnectInfo(peer), req).await;
    }
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(':').next().unwrap_or(value).to_string())
        .unwrap_or_default();
    let https_port = state.config.current().server.https_port;
    let authority = if https_port == 443 {
        host
    } else {
        format!("{}:{}", host, https_port)
    };
    let target = format!("https://{}{}", authority, req.uri());
    Redirect::permanent(&target).into_response()
}

fn query_param(query: Option<&str>, wanted: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == wanted)
        .map(|(_, value)| value.into_owned())
}
