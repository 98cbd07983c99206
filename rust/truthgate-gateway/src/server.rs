//! Wires every component together and runs the listeners: HTTPS with
//! SNI-selected certificates on one port, cleartext ACME/redirect on the
//! other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tower_http::trace::TraceLayer;
use truthgate_core::{ConfigHandle, ConfigStore, RotatingKey, SessionStore};
use truthgate_ipfs::{NodeClient, ProbeClient};
use url::Url;

use crate::acme::renewal::AcmeService;
use crate::acme::{CertStore, ChallengeStore, SniSelect};
use crate::cache::SiteCache;
use crate::dispatch;
use crate::handlers;
use crate::ipns::IpnsUpdater;
use crate::limiter::store::LimiterStore;
use crate::limiter::RateLimiter;
use crate::metrics::{spawn_sampler, MetricsRing};
use crate::publish::PublishService;

const BODY_LIMIT: usize = 512 * 1024 * 1024;
const CONFIG_POLL: Duration = Duration::from_secs(2);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct AppState {
    pub config_store: Arc<ConfigStore>,
    pub config: ConfigHandle,
    pub sessions: Arc<SessionStore>,
    pub internal_key: Arc<RotatingKey>,
    pub node: NodeClient,
    pub probe: ProbeClient,
    pub cache: SiteCache,
    pub limiter: Arc<RateLimiter>,
    pub publish: Arc<PublishService>,
    pub ipns: Arc<IpnsUpdater>,
    pub challenges: Arc<ChallengeStore>,
    pub certs: Arc<CertStore>,
    pub acme_issue_tx: UnboundedSender<String>,
    pub metrics: Arc<MetricsRing>,
    pub http_client: reqwest::Client,
    pub rpc_url: Url,
    pub gateway_url: Url,
}

/// TLS acceptor that reports every new connection to the churn detector
/// before handing the stream to rustls.
#[derive(Clone)]
pub struct ChurnAcceptor {
    inner: RustlsAcceptor,
    limiter: Arc<RateLimiter>,
}

impl<S> Accept<TcpStream, S> for ChurnAcceptor
where
    RustlsAcceptor: Accept<TcpStream, S>,
{
    type Stream = <RustlsAcceptor as Accept<TcpStream, S>>::Stream;
    type Service = <RustlsAcceptor as Accept<TcpStream, S>>::Service;
    type Future = <RustlsAcceptor as Accept<TcpStream, S>>::Future;

    fn accept(&self, stream: TcpStream, service: S) -> Self::Future {
        if let Ok(peer) = stream.peer_addr() {
            self.limiter.note_tls_connection(peer.ip());
        }
        self.inner.accept(stream, service)
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/login", get(handlers::login_page))
        .route("/auth/login", post(handlers::login))
        .route("/auth/logout", post(handlers::logout))
        .route("/healthz", get(handlers::healthz))
        .route(
            "/api/truthgate/v1/GetDomainCid",
            get(handlers::get_domain_cid),
        )
        .route(
            "/api/truthgate/v1/GetDomainIpns",
            get(handlers::get_domain_ipns),
        )
        .route(
            "/api/truthgate/v1/admin/import",
            post(handlers::import_domain),
        )
        .route(
            "/api/truthgate/v1/admin/metrics",
            get(handlers::metrics_snapshot),
        )
        .route(
            "/api/truthgate/v1/admin/rate/status",
            get(handlers::rate_status),
        )
        .route(
            "/api/truthgate/v1/admin/rate/unban",
            post(handlers::rate_unban),
        )
        .route(
            "/api/truthgate/v1/admin/rate/whitelist",
            post(handlers::whitelist_add).delete(handlers::whitelist_remove),
        )
        .route(
            "/api/truthgate/v1/admin/domains",
            get(handlers::list_domains),
        )
        .route(
            "/api/truthgate/v1/admin/publish/:job/status",
            get(handlers::publish_status),
        )
        .route(
            "/api/truthgate/v1/admin/:domain/publish",
            post(handlers::publish_site),
        )
        .route(
            "/api/truthgate/v1/admin/:domain/backup",
            get(handlers::backup_domain),
        )
        .route("/_acme/issue/:host", post(handlers::acme_issue))
        .route("/_acme/status/:host", get(handlers::acme_status))
        .fallback(dispatch::dispatch)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the full application state from loaded configuration.
pub async fn build_state(config_store: Arc<ConfigStore>) -> Result<Arc<AppState>> {
    let config = config_store.handle();
    let current = config.current();

    let internal_key = Arc::new(RotatingKey::new());
    let rpc_url = Url::parse(&format!("http://127.0.0.1:{}", current.node.rpc_port))?;
    let gateway_url = Url::parse(&format!("http://127.0.0.1:{}", current.node.gateway_port))?;

    let node = NodeClient::new(&rpc_url, internal_key.clone())
        .map_err(|error| anyhow::anyhow!("failed to build node client: {}", error))?;
    let probe = ProbeClient::new(&gateway_url)
        .map_err(|error| anyhow::anyhow!("failed to build probe client: {}", error))?;
    let cache = SiteCache::new(node.clone(), probe.clone());

    let limiter_store = match LimiterStore::open(current.data_dir.join("limits")) {
        Ok(store) => Some(store),
        Err(error) => {
            warn!("limiter persistence unavailable, running from memory: {:#}", error);
            None
        }
    };
    let limiter = Arc::new(RateLimiter::new(config.clone(), limiter_store));

    let ipns = Arc::new(IpnsUpdater::start(node.clone())?);
    let publish = Arc::new(PublishService::start(
        node.clone(),
        config_store.clone(),
        cache.clone(),
        ipns.clone(),
    )?);

    let certs = Arc::new(CertStore::open(
        &current.acme.cert_dir,
        current.acme.self_signed_ip.as_deref(),
    )?);
    let challenges = Arc::new(ChallengeStore::new());
    let acme = AcmeService::start(config.clone(), certs.clone(), challenges.clone())?;

    let metrics = Arc::new(MetricsRing::new(current.metrics.window));
    spawn_sampler(metrics.clone(), current.metrics.clone());

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(16)
        .build()
        .context("failed to build proxy client")?;

    Ok(Arc::new(AppState {
        config_store,
        config,
        sessions: Arc::new(SessionStore::new()),
        internal_key,
        node,
        probe,
        cache,
        limiter,
        publish,
        ipns,
        challenges,
        certs,
        acme_issue_tx: acme.issue_tx.clone(),
        metrics,
        http_client,
        rpc_url,
        gateway_url,
    }))
}

/// Start the gateway and serve until interrupted.
pub async fn run(config_store: Arc<ConfigStore>) -> Result<()> {
    let state = build_state(config_store.clone()).await?;
    let current = state.config.current();

    config_store.spawn_watcher(CONFIG_POLL);
    state.limiter.spawn_background();

    // Housekeeping: cache expiry and session purging.
    {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MAINTENANCE_INTERVAL).await;
                state.cache.inner().purge_expired();
                state.sessions.purge_expired();
            }
        });
    }

    let router = build_router(state.clone());

    // TLS listener with SNI selection.
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniSelect {
            certs: state.certs.clone(),
            config: state.config.clone(),
            issue_tx: state.acme_issue_tx.clone(),
        }));
    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));

    let https_addr = SocketAddr::from(([0, 0, 0, 0], current.server.https_port));
    let acceptor = ChurnAcceptor {
        inner: RustlsAcceptor::new(rustls_config),
        limiter: state.limiter.clone(),
    };
    let https = axum_server::bind(https_addr)
        .acceptor(acceptor)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>());

    // Cleartext listener: ACME challenges plus the HTTPS redirect.
    let http_addr = SocketAddr::from(([0, 0, 0, 0], current.server.http_port));
    let http_router = Router::new()
        .fallback(handlers::http_entry)
        .with_state(state.clone());
    let http = axum_server::bind(http_addr)
        .serve(http_router.into_make_service_with_connect_info::<SocketAddr>());

    info!(
        "TruthGate listening on :{} (tls) and :{} (acme/redirect)",
        current.server.https_port, current.server.http_port
    );

    tokio::select! {
        result = https => result.context("https listener failed")?,
        result = http => result.context("http listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested; draining publishers");
            state.ipns.drain(SHUTDOWN_GRACE).await;
            state.limiter.flush_now().await;
        }
    }

    Ok(())
}
