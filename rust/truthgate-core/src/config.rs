//! Process-wide configuration: a TOML file read into [TruthGateConfig],
//! watched for changes, and mutated in place (preserving formatting) for
//! the handful of fields the gateway writes back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use toml_edit::{value, Document};

use crate::domain::{EdgeDomain, SealedIpnsKey};

pub const ENV_CONFIG_PATH: &str = "TRUTHGATE_CONFIG";
pub const ENV_CERT_DIR: &str = "TRUTHGATE_CERT_DIR";
pub const ENV_ACME_STAGING: &str = "TRUTHGATE_ACME_STAGING";
pub const ENV_SELF_SIGNED_IP: &str = "TRUTHGATE_SELF_SIGNED_IP";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub https_port: u16,
    pub http_port: u16,
    /// Query parameter honored as a host override outside production.
    pub dev_host_param: String,
    /// Header honored as a host override outside production.
    pub dev_host_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            https_port: 443,
            http_port: 80,
            dev_host_param: "dev_host".into(),
            dev_host_header: "x-truthgate-host".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local RPC port of the content node (`/api/v0`).
    pub rpc_port: u16,
    /// Local HTTP gateway port of the content node (`/ipfs`, `/ipns`).
    pub gateway_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            rpc_port: 5001,
            gateway_port: 8080,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeConfig {
    /// Contact address registered with the ACME account.
    pub contact_email: Option<String>,
    /// Directory holding issued certificates and account keys.
    pub cert_dir: PathBuf,
    /// Use the staging directory endpoint instead of production.
    pub staging: bool,
    /// IP literal placed in the self-signed fallback certificate.
    pub self_signed_ip: Option<String>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        AcmeConfig {
            contact_email: None,
            cert_dir: PathBuf::from("./certs"),
            staging: false,
            self_signed_ip: None,
        }
    }
}

/// One tier of the adaptive public budget: once the global per-minute total
/// crosses `threshold`, fresh IPs get `new_per_minute` instead of the base
/// budget. Tiers are kept sorted ascending by threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicTier {
    pub threshold: u64,
    pub new_per_minute: u64,
}

/// Sibling-escalation schedule for repeat offenders. Present for schema
/// completeness; disabled by default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    pub four_x_multiplier: u32,
    pub ten_x_multiplier: u32,
    pub promote_to_true_ban: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        EscalationConfig {
            enabled: false,
            four_x_multiplier: 4,
            ten_x_multiplier: 10,
            promote_to_true_ban: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChurnConfig {
    pub window_secs: u64,
    /// New TLS connections per second above which churn is suspected.
    pub new_connections_per_sec: f64,
    /// Average requests-per-connection below which churn is confirmed.
    pub min_avg_requests_per_conn: f64,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        ChurnConfig {
            window_secs: 30,
            new_connections_per_sec: 8.0,
            min_avg_requests_per_conn: 1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Write-behind cadence for counter persistence, seconds.
    pub flush_secs: u64,
    /// Persisted counters older than this are purged.
    pub counter_retention_hours: u64,
    /// Bad admin-key attempts per IP per 24h before a soft admin ban.
    pub admin_bad_key_threshold: u64,
    pub admin_ban_minutes: i64,
    pub escalation: EscalationConfig,
    /// Base per-IP public budget per minute.
    pub public_per_minute: u64,
    /// Adaptive tiers, ascending by global threshold.
    pub public_tiers: Vec<PublicTier>,
    pub public_ban_minutes: i64,
    /// Free gateway calls per IP per minute.
    pub gateway_free_per_minute: u64,
    /// Additional gateway calls per IP per sliding hour.
    pub gateway_overage_per_hour: u64,
    pub gateway_ban_minutes: i64,
    /// Whitelist the source IP for 7 days after an authenticated gateway
    /// call, exempting it from gateway limits.
    pub auto_whitelist_on_auth: bool,
    pub auto_whitelist_days: i64,
    pub churn: ChurnConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            flush_secs: 15,
            counter_retention_hours: 48,
            admin_bad_key_threshold: 25,
            admin_ban_minutes: 60,
            escalation: EscalationConfig::default(),
            public_per_minute: 120,
            public_tiers: vec![
                PublicTier {
                    threshold: 3_000,
                    new_per_minute: 60,
                },
                PublicTier {
                    threshold: 10_000,
                    new_per_minute: 20,
                },
            ],
            public_ban_minutes: 10,
            gateway_free_per_minute: 300,
            gateway_overage_per_hour: 1_200,
            gateway_ban_minutes: 10,
            auto_whitelist_on_auth: true,
            auto_whitelist_days: 7,
            churn: ChurnConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub sample_interval_secs: u64,
    /// Ring capacity, in samples.
    pub window: usize,
    /// Collect the hottest threads by CPU delta (Linux only).
    pub per_thread: bool,
    pub per_thread_top: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            sample_interval_secs: 1,
            window: 600,
            per_thread: false,
            per_thread_top: 5,
        }
    }
}

/// A stored admin API key: only the bcrypt hash is kept.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminKey {
    pub id: String,
    pub key_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalUser {
    pub username: String,
    pub password_hash: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TruthGateConfig {
    pub production: bool,
    /// Base host under which `<label>.<base>` resolves labels against
    /// configured IPNS peer ids and key names.
    pub ipns_wildcard_base: Option<String>,
    pub server: ServerConfig,
    pub node: NodeConfig,
    pub acme: AcmeConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
    pub domains: Vec<EdgeDomain>,
    pub admin_keys: Vec<AdminKey>,
    pub users: Vec<LocalUser>,
    /// Persistence directory for limiter state.
    pub data_dir: PathBuf,
}

impl TruthGateConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: TruthGateConfig =
            toml_edit::easy::from_str(contents).context("failed to parse configuration")?;
        config.normalize();
        Ok(config)
    }

    /// Apply derived fields, ordering constraints and environment
    /// overrides. Idempotent.
    pub fn normalize(&mut self) {
        for domain in self.domains.iter_mut() {
            domain.normalize();
        }
        self.rate_limit
            .public_tiers
            .sort_by_key(|tier| tier.threshold);

        if let Ok(dir) = std::env::var(ENV_CERT_DIR) {
            self.acme.cert_dir = PathBuf::from(dir);
        }
        if let Ok(staging) = std::env::var(ENV_ACME_STAGING) {
            self.acme.staging = matches!(staging.as_str(), "1" | "true" | "yes");
        }
        if let Ok(ip) = std::env::var(ENV_SELF_SIGNED_IP) {
            self.acme.self_signed_ip = Some(ip);
        }
    }

    pub fn find_domain(&self, host: &str) -> Option<&EdgeDomain> {
        self.domains
            .iter()
            .find(|record| record.domain.eq_ignore_ascii_case(host))
    }
}

/// A cheap, always-current view of the configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    rx: watch::Receiver<Arc<TruthGateConfig>>,
}

impl ConfigHandle {
    pub fn current(&self) -> Arc<TruthGateConfig> {
        self.rx.borrow().clone()
    }
}

/// Owner of the configuration file: loads it, watches it for edits, and
/// performs the gateway's own write-backs (formatting-preserving, via the
/// TOML document model).
pub struct ConfigStore {
    path: PathBuf,
    tx: watch::Sender<Arc<TruthGateConfig>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    pub async fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read configuration at {:?}", path))?;
        let config = TruthGateConfig::from_toml(&contents)?;
        let (tx, _) = watch::channel(Arc::new(config));
        Ok(Arc::new(ConfigStore {
            path,
            tx,
            write_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// A config whose file does not exist yet; used by tests and first-run.
    pub fn in_memory(config: TruthGateConfig, path: impl AsRef<Path>) -> Arc<Self> {
        let (tx, _) = watch::channel(Arc::new(config));
        Arc::new(ConfigStore {
            path: path.as_ref().to_path_buf(),
            tx,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> Arc<TruthGateConfig> {
        self.tx.borrow().clone()
    }

    pub async fn reload(&self) -> Result<()> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let config = TruthGateConfig::from_toml(&contents)?;
        self.tx.send_replace(Arc::new(config));
        debug!("configuration reloaded from {:?}", self.path);
        Ok(())
    }

    /// Poll the file's mtime and hot-reload on change.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut last_modified: Option<SystemTime> = None;
            loop {
                tokio::time::sleep(interval).await;
                let modified = match tokio::fs::metadata(&store.path).await {
                    Ok(meta) => meta.modified().ok(),
                    Err(_) => None,
                };
                if modified.is_some() && modified != last_modified {
                    if last_modified.is_some() {
                        if let Err(error) = store.reload().await {
                            warn!("configuration reload failed: {}", error);
                        }
                    }
                    last_modified = modified;
                }
            }
        })
    }

    /// Record the CID most recently published for `domain`.
    pub async fn set_last_published_cid(&self, domain: &str, cid: &str) -> Result<()> {
        self.mutate_domain(domain, |table| {
            table["last_published_cid"] = value(cid);
        })
        .await
    }

    pub async fn set_ipns_identity(
        &self,
        domain: &str,
        key_name: &str,
        peer_id: &str,
    ) -> Result<()> {
        self.mutate_domain(domain, |table| {
            table["ipns_key_name"] = value(key_name);
            table["ipns_peer_id"] = value(peer_id);
        })
        .await
    }

    pub async fn set_sealed_ipns_key(&self, domain: &str, sealed: &SealedIpnsKey) -> Result<()> {
        let sealed = sealed.clone();
        self.mutate_domain(domain, move |table| {
            table["sealed_ipns_key"]["version"] = value(sealed.version as i64);
            table["sealed_ipns_key"]["salt_b64"] = value(sealed.salt_b64.as_str());
            table["sealed_ipns_key"]["cipher_b64"] = value(sealed.cipher_b64.as_str());
        })
        .await
    }

    /// Insert or replace a whole domain record (used by import).
    pub async fn upsert_domain(&self, record: &EdgeDomain) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;

        let rendered = toml_edit::easy::to_string(record)?;
        let parsed: Document = rendered.parse()?;
        let table = parsed.as_table().clone();

        let domains = doc["domains"]
            .or_insert(toml_edit::Item::ArrayOfTables(
                toml_edit::ArrayOfTables::new(),
            ))
            .as_array_of_tables_mut()
            .ok_or_else(|| anyhow!("`domains` is not an array of tables"))?;

        let position = domains
            .iter()
            .position(|entry| entry.get("domain").and_then(|v| v.as_str()) == Some(&record.domain));
        match position {
            Some(index) => {
                if let Some(entry) = domains.get_mut(index) {
                    *entry = table;
                }
            }
            None => domains.push(table),
        }

        self.write_document(doc).await
    }

    async fn mutate_domain<F>(&self, domain: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut toml_edit::Table),
    {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_document().await?;
        let domains = doc["domains"]
            .as_array_of_tables_mut()
            .ok_or_else(|| anyhow!("no `domains` configured"))?;
        let table = domains
            .iter_mut()
            .find(|entry| entry.get("domain").and_then(|v| v.as_str()) == Some(domain))
            .ok_or_else(|| anyhow!("domain {} is not configured", domain))?;
        apply(table);
        self.write_document(doc).await
    }

    async fn read_document(&self) -> Result<Document> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .unwrap_or_default();
        Ok(contents.parse()?)
    }

    async fn write_document(&self, doc: Document) -> Result<()> {
        tokio::fs::write(&self.path, doc.to_string()).await?;
        let config = TruthGateConfig::from_toml(&doc.to_string())?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
production = true

[server]
https_port = 8443
http_port = 8080

[[domains]]
domain = "Example.com"
use_tls = true

[[admin_keys]]
id = "ops"
key_hash = "$2b$12$abcdefghijklmnopqrstuv"

[rate_limit]
public_per_minute = 60

[[rate_limit.public_tiers]]
threshold = 500
new_per_minute = 10

[[rate_limit.public_tiers]]
threshold = 100
new_per_minute = 30
"#;

    #[test]
    fn it_parses_and_normalizes_configuration() {
        let config = TruthGateConfig::from_toml(SAMPLE).unwrap();
        assert!(config.production);
        assert_eq!(config.server.https_port, 8443);
        assert_eq!(config.domains[0].domain, "example.com");
        assert_eq!(config.domains[0].site_folder_leaf, "example.com");
        assert_eq!(config.rate_limit.public_per_minute, 60);
        // Tiers get sorted ascending regardless of file order.
        assert_eq!(config.rate_limit.public_tiers[0].threshold, 100);
        assert_eq!(config.rate_limit.public_tiers[1].threshold, 500);
        assert!(!config.rate_limit.escalation.enabled);
    }

    #[test]
    fn find_domain_is_case_insensitive() {
        let config = TruthGateConfig::from_toml(SAMPLE).unwrap();
        assert!(config.find_domain("EXAMPLE.COM").is_some());
        assert!(config.find_domain("other.org").is_none());
    }

    #[tokio::test]
    async fn write_backs_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truthgate.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        store
            .set_last_published_cid("example.com", "QmNEW")
            .await
            .unwrap();

        let current = store.current();
        assert_eq!(
            current.domains[0].last_published_cid.as_deref(),
            Some("QmNEW")
        );

        // The file itself carries the change.
        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(
            reloaded.current().domains[0].last_published_cid.as_deref(),
            Some("QmNEW")
        );
    }

    #[tokio::test]
    async fn upsert_inserts_new_domains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truthgate.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        let record = EdgeDomain::new("imported.org");
        store.upsert_domain(&record).await.unwrap();

        let current = store.current();
        assert!(current.find_domain("imported.org").is_some());
        assert!(current.find_domain("example.com").is_some());
    }
}
