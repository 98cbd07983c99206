//! The IPNS updater: a bounded pool publishing name records with per-key
//! cooldown and at-most-one-in-flight-per-name semantics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use truthgate_ipfs::{NodeClient, NodeError};

use crate::worker_queue::{Processor, WorkerQueue};

/// Workers in the publish pool.
pub const DEFAULT_WORKERS: usize = 4;
/// Minimum spacing between successful publishes of one key.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10 * 60);

const MAX_ATTEMPTS: usize = 5;

#[derive(Clone, Debug)]
pub struct PublishRequest {
    pub key_name: String,
    pub cid: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { name: String, value: String },
    Failed(String),
}

/// Subscribers watch this; `None` means still in flight.
pub type OutcomeReceiver = watch::Receiver<Option<PublishOutcome>>;

struct IpnsShared {
    node: NodeClient,
    cooldown: Duration,
    last_success: DashMap<String, Instant>,
    inflight: DashMap<String, (watch::Sender<Option<PublishOutcome>>, OutcomeReceiver)>,
}

impl IpnsShared {
    fn finish(&self, key_name: &str, outcome: PublishOutcome) {
        if let Some((_, (tx, _))) = self.inflight.remove(key_name) {
            let _ = tx.send(Some(outcome));
        }
    }
}

#[derive(Clone)]
struct PublishProcessor;

#[async_trait]
impl Processor for PublishProcessor {
    type Context = Arc<IpnsShared>;
    type Job = PublishRequest;

    async fn process(context: Self::Context, job: Self::Job) -> Result<Option<Self::Job>> {
        // Honor the per-key cooldown before touching the node.
        if let Some(success_at) = context
            .last_success
            .get(&job.key_name)
            .map(|entry| *entry.value())
        {
            let elapsed = success_at.elapsed();
            if elapsed < context.cooldown {
                let wait = context.cooldown - elapsed;
                debug!(
                    "cooldown for key {}: waiting {:?} before publish",
                    job.key_name, wait
                );
                tokio::time::sleep(wait).await;
            }
        }

        let mut backoff = Duration::from_secs(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match context.node.name_publish(&job.key_name, &job.cid).await {
                Ok((name, value)) => {
                    context
                        .last_success
                        .insert(job.key_name.clone(), Instant::now());
                    info!("published {} -> {}", name, value);
                    break PublishOutcome::Published { name, value };
                }
                Err(NodeError::Transient(message)) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "transient publish failure for {} (attempt {}): {}",
                        job.key_name, attempt, message
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(context.cooldown);
                }
                Err(error) => {
                    error!("publish failed for {}: {}", job.key_name, error);
                    break PublishOutcome::Failed(error.to_string());
                }
            }
        };

        context.finish(&job.key_name, outcome);
        Ok(None)
    }
}

/// Handle to the updater. Dropping it stops the pool.
pub struct IpnsUpdater {
    queue: WorkerQueue<PublishProcessor>,
    shared: Arc<IpnsShared>,
}

impl IpnsUpdater {
    pub fn start(node: NodeClient) -> Result<Self> {
        Self::start_with(node, DEFAULT_WORKERS, DEFAULT_COOLDOWN)
    }

    pub fn start_with(node: NodeClient, workers: usize, cooldown: Duration) -> Result<Self> {
        let shared = Arc::new(IpnsShared {
            node,
            cooldown,
            last_success: DashMap::new(),
            inflight: DashMap::new(),
        });
        // A job may sleep out a full cooldown inside its worker before the
        // publish attempts even start, so the pool's hang-timeout must sit
        // above cooldown + the backoff schedule. Cycling a worker mid-sleep
        // would strand the key's in-flight entry and wedge that name.
        let timeout = cooldown + Duration::from_secs(60 * 5);
        let queue =
            WorkerQueue::<PublishProcessor>::spawn(workers, shared.clone(), None, Some(timeout))?;
        Ok(IpnsUpdater { queue, shared })
    }

    /// Request a publish. A publish already in flight for the same key is
    /// joined rather than duplicated: every caller sees the same outcome.
    pub fn submit(&self, key_name: &str, cid: &str) -> OutcomeReceiver {
        use dashmap::mapref::entry::Entry;

        match self.shared.inflight.entry(key_name.to_string()) {
            Entry::Occupied(entry) => entry.get().1.clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert((tx, rx.clone()));
                let request = PublishRequest {
                    key_name: key_name.to_string(),
                    cid: cid.to_string(),
                };
                if self.queue.submit(request).is_err() {
                    self.shared.finish(
                        key_name,
                        PublishOutcome::Failed("publish queue is shut down".into()),
                    );
                }
                rx
            }
        }
    }

    /// Wait for in-flight publishes to settle, up to `grace`.
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.shared.inflight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for a submitted publish to reach a terminal outcome.
    pub async fn wait(mut rx: OutcomeReceiver) -> PublishOutcome {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return PublishOutcome::Failed("publisher dropped".into());
            }
        }
    }
}

/// Look up the peer ids of existing keys, used by import to detect
/// collisions.
pub async fn peer_id_of_key(
    node: &NodeClient,
    name: &str,
) -> Result<Option<String>, NodeError> {
    let keys = node.key_list().await?;
    Ok(keys
        .into_iter()
        .find(|key| key.name == name)
        .map(|key| key.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use truthgate_core::RotatingKey;
    use url::Url;

    async fn stub_node(publish_count: Arc<AtomicUsize>, delay: Duration) -> NodeClient {
        let router = Router::new().route(
            "/api/v0/name/publish",
            post(move || {
                let publish_count = publish_count.clone();
                async move {
                    tokio::time::sleep(delay).await;
                    publish_count.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "Name": "k51qzi5uqu5dExample",
                        "Value": "/ipfs/QmAAA",
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        let url = Url::parse(&format!("http://{}", addr)).unwrap();
        NodeClient::new(&url, Arc::new(RotatingKey::new())).unwrap()
    }

    #[tokio::test]
    async fn publish_resolves_to_an_outcome() {
        let count = Arc::new(AtomicUsize::new(0));
        let node = stub_node(count.clone(), Duration::ZERO).await;
        let updater = IpnsUpdater::start_with(node, 2, Duration::ZERO).unwrap();

        let rx = updater.submit("example-key", "QmAAA");
        let outcome = IpnsUpdater::wait(rx).await;
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                name: "k51qzi5uqu5dExample".into(),
                value: "/ipfs/QmAAA".into(),
            }
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn republish_during_cooldown_still_resolves() {
        let count = Arc::new(AtomicUsize::new(0));
        let node = stub_node(count.clone(), Duration::ZERO).await;
        let updater = IpnsUpdater::start_with(node, 1, Duration::from_millis(300)).unwrap();

        let first = IpnsUpdater::wait(updater.submit("example-key", "QmAAA")).await;
        assert!(matches!(first, PublishOutcome::Published { .. }));

        // The second publish lands inside the key's cooldown: the worker
        // waits the cooldown out and must not be cycled mid-sleep, or the
        // in-flight entry would never clear and the key would wedge.
        let second = IpnsUpdater::wait(updater.submit("example-key", "QmBBB")).await;
        assert!(matches!(second, PublishOutcome::Published { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        updater.drain(Duration::from_millis(100)).await;
        assert!(updater.shared.inflight.is_empty());
    }

    #[tokio::test]
    async fn concurrent_submits_for_one_key_coalesce() {
        let count = Arc::new(AtomicUsize::new(0));
        // The stub answers slowly so the second submit lands while the
        // first publish is still in flight.
        let node = stub_node(count.clone(), Duration::from_millis(300)).await;
        let updater = IpnsUpdater::start_with(node, 1, Duration::ZERO).unwrap();

        let first = updater.submit("example-key", "QmAAA");
        let second = updater.submit("example-key", "QmAAA");

        let outcome_a = IpnsUpdater::wait(first).await;
        let outcome_b = IpnsUpdater::wait(second).await;
        assert_eq!(outcome_a, outcome_b);
        // Coalesced: one node call despite two submissions.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
