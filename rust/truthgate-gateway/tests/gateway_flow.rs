//! End-to-end dispatcher flows against an in-process stub node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, head, post};
use axum::{Json, Router};
use tower::ServiceExt;
use truthgate_core::{ConfigStore, EdgeDomain, TruthGateConfig};
use truthgate_gateway::{build_router, build_state};

const SITE_CID: &str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";
const INDEX_BODY: &str = "<h1>hello from index</h1>";

struct StubNode {
    rpc_port: u16,
    gateway_port: u16,
    stat_calls: Arc<AtomicUsize>,
}

/// A stub node: RPC on one port (files/stat, pin/ls, ls) and a gateway on
/// another that serves a site containing only `index.html`.
async fn start_stub_node(fail_first_index_get: bool) -> StubNode {
    let stat_calls = Arc::new(AtomicUsize::new(0));
    let gets_failed = Arc::new(AtomicUsize::new(0));

    let stat_counter = stat_calls.clone();
    let rpc = Router::new()
        .route(
            "/api/v0/files/stat",
            post(move || {
                stat_counter.fetch_add(1, Ordering::SeqCst);
                async move { Json(serde_json::json!({ "Hash": SITE_CID, "Size": 0 })) }
            }),
        )
        .route(
            "/api/v0/pin/ls",
            post(|| async {
                Json(serde_json::json!({ "Keys": { SITE_CID: { "Type": "recursive" } } }))
            }),
        )
        .route(
            "/api/v0/ls",
            post(|| async {
                Json(serde_json::json!({
                    "Objects": [{
                        "Hash": SITE_CID,
                        "Links": [
                            { "Name": "index.html", "Hash": "Qm1", "Size": 1, "Type": 2 },
                        ],
                    }]
                }))
            }),
        );

    let index_path = format!("/ipfs/{}/index.html", SITE_CID);
    let failures = gets_failed.clone();
    let gateway = Router::new()
        .route(
            &index_path,
            get(move || {
                let failures = failures.clone();
                async move {
                    if fail_first_index_get && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                        return (StatusCode::NOT_FOUND, "gone").into_response();
                    }
                    (
                        [(header::CONTENT_TYPE, "text/html")],
                        INDEX_BODY,
                    )
                        .into_response()
                }
            })
            .head(|| async { StatusCode::OK }),
        )
        .fallback(|req: Request<Body>| async move {
            // Every other path inside the CID is absent.
            let _ = req;
            StatusCode::NOT_FOUND
        });
    // Index directory listing URL (trailing slash) also answers.
    let root_path = format!("/ipfs/{}/", SITE_CID);
    let gateway = gateway.route(&root_path, head(|| async { StatusCode::OK }));

    let rpc_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let rpc_port = rpc_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(rpc_listener, rpc).await.unwrap();
    });

    let gateway_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_port = gateway_listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(gateway_listener, gateway).await.unwrap();
    });

    StubNode {
        rpc_port,
        gateway_port,
        stat_calls,
    }
}

async fn app_for(stub: &StubNode) -> Router {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TruthGateConfig {
        production: true,
        data_dir: dir.path().join("data"),
        ..Default::default()
    };
    config.acme.cert_dir = dir.path().join("certs");
    config.node.rpc_port = stub.rpc_port;
    config.node.gateway_port = stub.gateway_port;
    let mut domain = EdgeDomain::new("example.com");
    // No TLS in these tests: keeps the issuance worker quiet.
    domain.use_tls = false;
    config.domains.push(domain);
    // Generous limits so flow tests never trip the limiter.
    config.rate_limit.gateway_free_per_minute = 10_000;
    config.rate_limit.public_per_minute = 10_000;

    let store = ConfigStore::in_memory(config, dir.path().join("truthgate.toml"));
    let state = build_state(store).await.unwrap();
    // The tempdir's lifetime ends with this function; leak it so sled and
    // cert files survive the test body.
    std::mem::forget(dir);
    build_router(state)
}

fn request(method: Method, host: &str, path: &str, html: bool) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, host);
    if html {
        builder = builder.header(header::ACCEPT, "text/html");
    }
    let mut req = builder.body(Body::empty()).unwrap();
    let peer: SocketAddr = "198.51.100.23:4711".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(peer));
    req
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn root_navigation_serves_the_site_index() {
    let stub = start_stub_node(false).await;
    let app = app_for(&stub).await;

    let response = app
        .oneshot(request(Method::GET, "example.com", "/", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, INDEX_BODY);
}

#[tokio::test]
async fn missing_deep_links_fall_back_to_the_index() {
    let stub = start_stub_node(false).await;
    let app = app_for(&stub).await;

    let response = app
        .oneshot(request(Method::GET, "example.com", "/deep/link", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, INDEX_BODY);
}

#[tokio::test]
async fn non_navigational_misses_are_404s() {
    let stub = start_stub_node(false).await;
    let app = app_for(&stub).await;

    let response = app
        .oneshot(request(Method::GET, "example.com", "/missing.js", false))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn one_stale_cache_retry_recovers_a_fresh_site() {
    let stub = start_stub_node(true).await;
    let app = app_for(&stub).await;

    // First forward 404s; the dispatcher invalidates both tags and
    // retries exactly once, which re-resolves and succeeds.
    let response = app
        .oneshot(request(Method::GET, "example.com", "/", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, INDEX_BODY);
    // The retry re-ran files/stat after invalidation.
    assert!(stub.stat_calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn admin_401_is_oracle_proof() {
    let stub = start_stub_node(false).await;
    let app = app_for(&stub).await;

    let missing = app
        .clone()
        .oneshot(request(Method::GET, "admin.example.net", "/api/v0/add", false))
        .await
        .unwrap();

    let mut with_bad_key = request(Method::GET, "admin.example.net", "/api/v0/add", false);
    with_bad_key
        .headers_mut()
        .insert("x-api-key", header::HeaderValue::from_static("NOPE"));
    let invalid = app.oneshot(with_bad_key).await.unwrap();

    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        missing.headers().get(header::WWW_AUTHENTICATE),
        invalid.headers().get(header::WWW_AUTHENTICATE),
    );
    assert_eq!(
        missing.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        r#"ApiKey realm="/api""#
    );
    assert_eq!(body_string(missing).await, body_string(invalid).await);
}

#[tokio::test]
async fn unmapped_hosts_redirect_browsers_to_login() {
    let stub = start_stub_node(false).await;
    let app = app_for(&stub).await;

    let response = app
        .clone()
        .oneshot(request(Method::GET, "other.example.net", "/dashboard", true))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(location.starts_with("/login?returnUrl="));

    let api_response = app
        .oneshot(request(Method::GET, "other.example.net", "/dashboard", false))
        .await
        .unwrap();
    assert_eq!(api_response.status(), StatusCode::UNAUTHORIZED);
}
