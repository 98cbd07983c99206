//! The publish pipeline: multipart ingest into staging MFS, atomic
//! production swap, pinning, TGP pointer update and IPNS submission.

pub mod normalize;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::extract::Multipart;
use chrono::Utc;
use dashmap::DashMap;
use rand::RngCore;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use truthgate_core::{ConfigStore, DomainBackup, EdgeDomain};
use truthgate_ipfs::{NodeClient, NodeError, TgpPointer};

use crate::cache::SiteCache;
use crate::error::GateError;
use crate::ipns::IpnsUpdater;
use crate::worker_queue::{Processor, WorkerQueue};
use normalize::{normalize_file_set, normalize_relative_path, SetFold};

const STAGING_ROOT: &str = "/staging/sites";
const PRODUCTION_SITES: &str = "/production/sites";
const PRODUCTION_PINNED: &str = "/production/pinned";

/// One accepted upload, owned by the queue until terminal.
#[derive(Clone, Debug)]
pub struct PublishJob {
    pub id: String,
    pub domain: String,
    pub site_leaf: String,
    pub tgp_leaf: String,
    pub staging_root: String,
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Succeeded,
    Failed,
}

struct PublishShared {
    node: NodeClient,
    config: Arc<ConfigStore>,
    cache: SiteCache,
    ipns: Arc<IpnsUpdater>,
    site_locks: DashMap<String, Arc<Mutex<()>>>,
    outcomes: DashMap<String, JobOutcome>,
}

#[derive(Clone)]
struct SitePublishProcessor;

#[async_trait]
impl Processor for SitePublishProcessor {
    type Context = Arc<PublishShared>;
    type Job = PublishJob;

    async fn process(context: Self::Context, job: Self::Job) -> Result<Option<Self::Job>> {
        let id = job.id.clone();
        match run_publish(&context, &job).await {
            Ok(cid) => {
                context.outcomes.insert(
                    id,
                    JobOutcome {
                        status: JobStatus::Succeeded,
                        detail: cid,
                    },
                );
            }
            Err(error) => {
                error!("publish job {} failed: {:#}", job.id, error);
                context.outcomes.insert(
                    id,
                    JobOutcome {
                        status: JobStatus::Failed,
                        detail: error.to_string(),
                    },
                );
            }
        }
        Ok(None)
    }
}

/// Stage → swap → pin → pointer → publish. Returns the new site CID.
async fn run_publish(shared: &PublishShared, job: &PublishJob) -> Result<String> {
    let node = &shared.node;
    let new_cid = node
        .resolve_mfs_folder_to_cid(&job.staging_root)
        .await
        .context("staging folder vanished before swap")?;

    let production = format!("{}/{}", PRODUCTION_SITES, job.site_leaf);
    let old_aside = format!("{}.old-{}", production, Utc::now().timestamp());

    // Swaps of one site folder never interleave.
    let lock = shared
        .site_locks
        .entry(job.site_leaf.clone())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _guard = lock.lock().await;

    node.files_mkdir(PRODUCTION_SITES, true)
        .await
        .context("failed to ensure production parent")?;

    let prior_cid = match node.resolve_mfs_folder_to_cid(&production).await {
        Ok(cid) => Some(cid),
        Err(NodeError::NotFound) => None,
        Err(error) => return Err(error).context("failed to stat production site"),
    };

    if prior_cid.is_some() {
        node.files_mv(&production, &old_aside)
            .await
            .context("failed to move prior site aside")?;
    }

    if let Err(error) = node.files_mv(&job.staging_root, &production).await {
        if prior_cid.is_some() {
            if let Err(rollback) = node.files_mv(&old_aside, &production).await {
                error!("rollback after failed swap also failed: {}", rollback);
            }
        }
        return Err(error).context("failed to move staging into production");
    }

    if let Err(error) = node.pin_add(&new_cid, true).await {
        // All-or-nothing: restore the previous site, leave the new root
        // unpinned.
        if let Err(rollback) = node.files_mv(&production, &job.staging_root).await {
            error!("rollback of unpinnable site failed: {}", rollback);
        }
        if prior_cid.is_some() {
            if let Err(rollback) = node.files_mv(&old_aside, &production).await {
                error!("restore of prior site failed: {}", rollback);
            }
        }
        return Err(error).context("failed to pin new site root");
    }

    if prior_cid.is_some() {
        if let Err(error) = node.files_rm(&old_aside, true).await {
            warn!("failed to remove {}: {}", old_aside, error);
        }
    }

    // Tombstone pointer for the domain.
    let pointer = TgpPointer {
        current: format!("/ipfs/{}", new_cid),
        previous: prior_cid.as_ref().map(|cid| format!("/ipfs/{}", cid)),
        ts: Utc::now().to_rfc3339(),
    };
    let pointer_path = format!("{}/{}/tgp.json", PRODUCTION_PINNED, job.tgp_leaf);
    let payload = serde_json::to_vec(&pointer)?;
    node.files_write(&pointer_path, payload.into(), "application/json")
        .await
        .context("failed to write tgp pointer")?;

    // Resolve or create the name key and hand off to the updater.
    let record = shared
        .config
        .current()
        .find_domain(&job.domain)
        .cloned()
        .ok_or_else(|| anyhow!("domain {} disappeared from configuration", job.domain))?;
    let key_name = match record.ipns_key_name.clone() {
        Some(name) => name,
        None => job.site_leaf.replace('.', "-"),
    };
    let existing = shared
        .node
        .key_list()
        .await?
        .into_iter()
        .find(|key| key.name == key_name);
    let key = match existing {
        Some(key) => key,
        None => node
            .key_gen(&key_name)
            .await
            .context("failed to generate ipns key")?,
    };
    if record.ipns_key_name.as_deref() != Some(key_name.as_str())
        || record.ipns_peer_id.as_deref() != Some(key.id.as_str())
    {
        shared
            .config
            .set_ipns_identity(&job.domain, &key_name, &key.id)
            .await?;
    }
    shared.ipns.submit(&key_name, &new_cid);

    shared
        .config
        .set_last_published_cid(&job.domain, &new_cid)
        .await?;

    // The old content is dead: expire everything derived from it.
    shared.cache.invalidate_mfs(&production);
    if let Some(prior) = prior_cid.as_ref() {
        shared.cache.invalidate_cid(prior);
    }

    info!("published {} -> {}", job.domain, new_cid);
    Ok(new_cid)
}

/// Handle to the publish queue.
pub struct PublishService {
    queue: WorkerQueue<SitePublishProcessor>,
    shared: Arc<PublishShared>,
}

impl PublishService {
    pub fn start(
        node: NodeClient,
        config: Arc<ConfigStore>,
        cache: SiteCache,
        ipns: Arc<IpnsUpdater>,
    ) -> Result<Self> {
        let shared = Arc::new(PublishShared {
            node,
            config,
            cache,
            ipns,
            site_locks: DashMap::new(),
            outcomes: DashMap::new(),
        });
        let queue = WorkerQueue::<SitePublishProcessor>::spawn(2, shared.clone(), None, None)?;
        Ok(PublishService { queue, shared })
    }

    pub fn outcome(&self, job_id: &str) -> Option<JobOutcome> {
        self.shared.outcomes.get(job_id).map(|o| o.clone())
    }

    /// Consume a multipart upload into staging MFS and enqueue the swap.
    /// Each part's field name (falling back to its file name) is the
    /// file's relative path in the site.
    pub async fn ingest(
        &self,
        record: &EdgeDomain,
        multipart: &mut Multipart,
        note: Option<String>,
    ) -> Result<String, GateError> {
        let job_id = new_job_id();
        let staging_root = format!("{}/{}/{}", STAGING_ROOT, record.site_folder_leaf, job_id);
        let mut keys: Vec<String> = Vec::new();

        let ingest_result = self
            .stream_parts(multipart, &staging_root, &mut keys)
            .await;
        if let Err(error) = ingest_result {
            let _ = self.shared.node.files_rm(&staging_root, true).await;
            return Err(error);
        }

        let (final_keys, fold) = match normalize_file_set(&keys) {
            Ok(result) => result,
            Err(error) => {
                let _ = self.shared.node.files_rm(&staging_root, true).await;
                return Err(GateError::BadRequest(error.to_string()));
            }
        };
        if let Err(error) = self.apply_fold(&staging_root, &fold).await {
            let _ = self.shared.node.files_rm(&staging_root, true).await;
            return Err(GateError::BadRequest(format!(
                "failed to arrange upload: {}",
                error
            )));
        }
        debug!(
            "staged {} files for {} under {}",
            final_keys.len(),
            record.domain,
            staging_root
        );

        let job = PublishJob {
            id: job_id.clone(),
            domain: record.domain.clone(),
            site_leaf: record.site_folder_leaf.clone(),
            tgp_leaf: record.tgp_folder_leaf.clone(),
            staging_root,
            note,
        };
        self.shared.outcomes.insert(
            job_id.clone(),
            JobOutcome {
                status: JobStatus::Queued,
                detail: String::new(),
            },
        );
        self.queue
            .submit(job)
            .map_err(|error| GateError::BadRequest(error.to_string()))?;
        Ok(job_id)
    }

    async fn stream_parts(
        &self,
        multipart: &mut Multipart,
        staging_root: &str,
        keys: &mut Vec<String>,
    ) -> Result<(), GateError> {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|error| GateError::BadRequest(error.to_string()))?
        {
            let raw_name = field
                .name()
                .filter(|name| !name.is_empty())
                .or_else(|| field.file_name())
                .ok_or_else(|| GateError::BadRequest("file part without a name".into()))?
                .to_string();
            let rel_path = normalize_relative_path(&raw_name)
                .map_err(|error| GateError::BadRequest(error.to_string()))?;
            let mime = field
                .content_type()
                .map(str::to_owned)
                .unwrap_or_else(|| mime_guess::from_path(&rel_path).first_or_octet_stream().to_string());

            let target = format!("{}/{}", staging_root, rel_path);
            let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(8);
            let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
            let node = self.shared.node.clone();
            let write = tokio::spawn(async move { node.files_write(&target, body, &mime).await });

            loop {
                match field.chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        drop(tx);
                        write.abort();
                        return Err(GateError::BadRequest(error.to_string()));
                    }
                }
            }
            drop(tx);
            match write.await {
                Ok(Ok(())) => keys.push(rel_path),
                Ok(Err(error)) => {
                    return Err(GateError::BadRequest(format!(
                        "failed to stage {}: {}",
                        rel_path, error
                    )))
                }
                Err(join_error) => {
                    return Err(GateError::BadRequest(join_error.to_string()));
                }
            }
        }

        if keys.is_empty() {
            return Err(GateError::BadRequest("upload contained no files".into()));
        }
        Ok(())
    }

    /// Mirror the set-level fold onto the staged MFS tree.
    async fn apply_fold(&self, staging_root: &str, fold: &SetFold) -> Result<(), NodeError> {
        let node = &self.shared.node;
        match fold {
            SetFold::None => Ok(()),
            SetFold::StripCommon(folder) => {
                let hoisted = format!("{}.fold", staging_root);
                node.files_mv(&format!("{}/{}", staging_root, folder), &hoisted)
                    .await?;
                node.files_rm(staging_root, true).await?;
                node.files_mv(&hoisted, staging_root).await
            }
            SetFold::HoistFolder(folder) => {
                let folder_path = format!("{}/{}", staging_root, folder);
                let children = node.files_ls(&folder_path).await?;
                for actual in children.values() {
                    node.files_mv(
                        &format!("{}/{}", folder_path, actual),
                        &format!("{}/{}", staging_root, actual),
                    )
                    .await?;
                }
                node.files_rm(&folder_path, true).await
            }
        }
    }
}

/// Seal a domain's IPNS key and wrap it with the record for transport.
pub async fn build_backup(
    node: &NodeClient,
    record: &EdgeDomain,
    passphrase: &str,
) -> Result<DomainBackup> {
    let key_name = record
        .ipns_key_name
        .as_deref()
        .ok_or_else(|| anyhow!("domain {} has no ipns key to back up", record.domain))?;
    let armored = node
        .key_export(key_name)
        .await
        .context("failed to export ipns key")?;
    DomainBackup::seal(record, &armored, passphrase)
}

/// Restore a backup: reuse an existing key when the peer id already lives
/// on this node, import under a `-import` suffix on a name collision, and
/// optionally copy the published content back into the production folder.
pub async fn import_backup(
    node: &NodeClient,
    config: &ConfigStore,
    backup: &DomainBackup,
    passphrase: &str,
    restore_content: bool,
) -> Result<EdgeDomain> {
    let mut record = backup.to_domain();
    let armored = backup.open_key(passphrase)?;

    if let Some(wanted_name) = record.ipns_key_name.clone() {
        let keys = node.key_list().await?;
        let by_peer = backup
            .ipns_peer_id
            .as_deref()
            .and_then(|peer| keys.iter().find(|key| key.id == peer));

        match by_peer {
            Some(existing) => {
                // The key material is already here; leave it untouched.
                record.ipns_key_name = Some(existing.name.clone());
                record.ipns_peer_id = Some(existing.id.clone());
            }
            None => {
                let name_taken = keys.iter().any(|key| key.name == wanted_name);
                let import_name = if name_taken {
                    format!("{}-import", wanted_name)
                } else {
                    wanted_name
                };
                let imported = node
                    .key_import(&import_name, &armored)
                    .await
                    .context("failed to import ipns key")?;
                record.ipns_key_name = Some(imported.name);
                record.ipns_peer_id = Some(imported.id);
            }
        }
    }

    config.upsert_domain(&record).await?;

    if restore_content {
        if let Some(cid) = record.last_published_cid.as_deref() {
            let production = record.site_mfs_path();
            match node.resolve_mfs_folder_to_cid(&production).await {
                Ok(_) => debug!("production folder {} already present; not restoring", production),
                Err(NodeError::NotFound) => {
                    node.files_mkdir(PRODUCTION_SITES, true).await?;
                    node.files_cp_from_ipfs(cid, &production)
                        .await
                        .context("failed to restore site content")?;
                    node.pin_add(cid, true).await?;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    Ok(record)
}

fn new_job_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}
