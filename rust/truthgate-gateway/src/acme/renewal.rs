//! Issuance worker and renewal scheduler.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use truthgate_core::ConfigHandle;

use super::client::{account_key_path, directory_url, AcmeClient};
use super::{CertStore, ChallengeStore};

/// Re-issue when a certificate is within this many days of expiry.
const RENEW_WITHIN_DAYS: i64 = 30;

/// How often the scheduler re-examines configured hosts.
const SCHEDULER_INTERVAL_SECS: u64 = 12 * 60 * 60;

pub struct AcmeService {
    pub issue_tx: UnboundedSender<String>,
    pub handles: Vec<JoinHandle<()>>,
}

impl AcmeService {
    /// Start the issuance worker (at most one issuance in flight per
    /// host) and the renewal scheduler.
    pub fn start(
        config: ConfigHandle,
        certs: Arc<CertStore>,
        challenges: Arc<ChallengeStore>,
    ) -> Result<Self> {
        let (issue_tx, issue_rx) = unbounded_channel::<String>();

        let mut handles = Vec::new();
        handles.push(tokio::spawn(issuance_worker(
            config.clone(),
            certs.clone(),
            challenges,
            issue_rx,
        )));
        handles.push(tokio::spawn(renewal_scheduler(
            config,
            certs,
            issue_tx.clone(),
        )));

        Ok(AcmeService { issue_tx, handles })
    }
}

async fn issuance_worker(
    config: ConfigHandle,
    certs: Arc<CertStore>,
    challenges: Arc<ChallengeStore>,
    mut issue_rx: UnboundedReceiver<String>,
) {
    // Hosts with an issuance currently in flight; repeats are dropped.
    let in_flight: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    while let Some(host) = issue_rx.recv().await {
        {
            let mut guard = in_flight.lock().await;
            if !guard.insert(host.clone()) {
                continue;
            }
        }

        let current = config.current();
        let eligible = current
            .find_domain(&host)
            .map(|record| record.use_tls)
            .unwrap_or(false);
        if !eligible {
            in_flight.lock().await.remove(&host);
            continue;
        }

        let staging = current.acme.staging;
        let key_path = account_key_path(&current.acme.cert_dir, staging);
        let contact = current.acme.contact_email.clone();
        let certs = certs.clone();
        let challenges = challenges.clone();
        let in_flight = in_flight.clone();

        tokio::spawn(async move {
            let result = async {
                let client = AcmeClient::new(directory_url(staging), contact, &key_path)?;
                let issued = client.issue(&host, &challenges).await?;
                certs.store(&host, &issued.chain_pem, &issued.key_pem, staging)?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            match result {
                Ok(()) => info!("certificate ready for {}", host),
                Err(error) => warn!("issuance failed for {}: {:#}", host, error),
            }
            in_flight.lock().await.remove(&host);
        });
    }
}

async fn renewal_scheduler(
    config: ConfigHandle,
    certs: Arc<CertStore>,
    issue_tx: UnboundedSender<String>,
) {
    loop {
        let current = config.current();
        let horizon = Utc::now() + Duration::days(RENEW_WITHIN_DAYS);
        for record in current.domains.iter().filter(|record| record.use_tls) {
            let due = match certs.meta(&record.domain) {
                None => true,
                Some(meta) => meta.not_after <= horizon || meta.staging != current.acme.staging,
            };
            if due {
                debug!("queueing certificate issuance for {}", record.domain);
                let _ = issue_tx.send(record.domain.clone());
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(SCHEDULER_INTERVAL_SECS)).await;
    }
}
