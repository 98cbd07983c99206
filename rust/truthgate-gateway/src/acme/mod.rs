//! Certificate lifecycle: on-disk cert store, SNI selection with a
//! self-signed fallback, HTTP-01 challenge store, issuance and renewal.

pub mod client;
pub mod renewal;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::mpsc::UnboundedSender;
use truthgate_core::ConfigHandle;

/// Served by the dispatcher at `/.well-known/acme-challenge/<token>`,
/// in cleartext, never redirected.
#[derive(Default)]
pub struct ChallengeStore {
    tokens: DashMap<String, String>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: &str, key_authorization: &str) {
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, token: &str) {
        self.tokens.remove(token);
    }
}

#[derive(Clone, Debug)]
pub struct CertMeta {
    pub not_after: DateTime<Utc>,
    pub staging: bool,
}

/// Issued certificates, in memory for the SNI path and as PEM pairs under
/// `<cert_dir>/<host>/` on disk.
pub struct CertStore {
    dir: PathBuf,
    certs: DashMap<String, Arc<CertifiedKey>>,
    meta: DashMap<String, CertMeta>,
    fallback: Arc<CertifiedKey>,
}

impl CertStore {
    /// Open the store, loading every certificate already on disk and
    /// minting the self-signed fallback.
    pub fn open(dir: impl AsRef<Path>, self_signed_ip: Option<&str>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cert dir {:?}", dir))?;

        let store = CertStore {
            fallback: Arc::new(self_signed_fallback(self_signed_ip)?),
            certs: DashMap::new(),
            meta: DashMap::new(),
            dir,
        };
        store.load_all();
        Ok(store)
    }

    fn load_all(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let host = entry.file_name().to_string_lossy().to_string();
            match self.load_host(&host) {
                Ok(()) => debug!("loaded certificate for {}", host),
                Err(error) => warn!("skipping certificate for {}: {}", host, error),
            }
        }
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.dir.join(host)
    }

    fn load_host(&self, host: &str) -> Result<()> {
        let dir = self.host_dir(host);
        let chain_pem = std::fs::read_to_string(dir.join("fullchain.pem"))?;
        let key_pem = std::fs::read_to_string(dir.join("privkey.pem"))?;
        let staging = dir.join("staging").exists();
        self.install(host, &chain_pem, &key_pem, staging)
    }

    /// Persist and activate a certificate for `host`.
    pub fn store(&self, host: &str, chain_pem: &str, key_pem: &str, staging: bool) -> Result<()> {
        let dir = self.host_dir(host);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("fullchain.pem"), chain_pem)?;
        std::fs::write(dir.join("privkey.pem"), key_pem)?;
        let marker = dir.join("staging");
        if staging {
            std::fs::write(&marker, b"1")?;
        } else if marker.exists() {
            let _ = std::fs::remove_file(&marker);
        }
        self.install(host, chain_pem, key_pem, staging)
    }

    fn install(&self, host: &str, chain_pem: &str, key_pem: &str, staging: bool) -> Result<()> {
        let (certified, not_after) = certified_key_from_pem(chain_pem, key_pem)?;
        self.certs.insert(host.to_string(), Arc::new(certified));
        self.meta
            .insert(host.to_string(), CertMeta { not_after, staging });
        Ok(())
    }

    /// The certificate for `host`, if present and not expired.
    pub fn fresh(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        let meta = self.meta.get(host)?;
        if meta.not_after <= Utc::now() {
            return None;
        }
        self.certs.get(host).map(|entry| entry.value().clone())
    }

    pub fn meta(&self, host: &str) -> Option<CertMeta> {
        self.meta.get(host).map(|entry| entry.value().clone())
    }

    pub fn fallback(&self) -> Arc<CertifiedKey> {
        self.fallback.clone()
    }
}

/// Build a [CertifiedKey] and expiry from PEM material.
fn certified_key_from_pem(chain_pem: &str, key_pem: &str) -> Result<(CertifiedKey, DateTime<Utc>)> {
    let chain: Vec<CertificateDer<'static>> = pem::parse_many(chain_pem)?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if chain.is_empty() {
        return Err(anyhow!("no certificates in chain"));
    }

    let not_after = {
        let (_, parsed) = x509_parser::parse_x509_certificate(chain[0].as_ref())
            .map_err(|error| anyhow!("unparseable leaf certificate: {}", error))?;
        Utc.timestamp_opt(parsed.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| anyhow!("certificate notAfter out of range"))?
    };

    let key_block = pem::parse_many(key_pem)?
        .into_iter()
        .find(|block| block.tag().ends_with("PRIVATE KEY"))
        .ok_or_else(|| anyhow!("no private key in pem"))?;
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_block.into_contents()));
    let signing_key =
        any_supported_type(&key_der).map_err(|error| anyhow!("unusable key: {}", error))?;

    Ok((CertifiedKey::new(chain, signing_key), not_after))
}

/// The `notAfter` of the leaf certificate in a PEM chain.
pub fn certified_not_after(chain_pem: &str) -> Result<DateTime<Utc>> {
    let leaf = pem::parse_many(chain_pem)?
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| anyhow!("no certificates in chain"))?;
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.contents())
        .map_err(|error| anyhow!("unparseable certificate: {}", error))?;
    Utc.timestamp_opt(parsed.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| anyhow!("certificate notAfter out of range"))
}

/// Mint the self-signed fallback presented when no real certificate
/// applies.
fn self_signed_fallback(self_signed_ip: Option<&str>) -> Result<CertifiedKey> {
    let mut names = vec!["truthgate.local".to_string()];
    if let Some(ip) = self_signed_ip {
        names.push(ip.to_string());
    }
    let key_pair = rcgen::KeyPair::generate()?;
    let params = rcgen::CertificateParams::new(names)?;
    let cert = params.self_signed(&key_pair)?;

    let (certified, _) = certified_key_from_pem(&cert.pem(), &key_pair.serialize_pem())?;
    Ok(certified)
}

/// The SNI callback: real certificate when the host is configured for TLS
/// and one is on disk; otherwise the self-signed fallback, queueing an
/// issuance for configured hosts that lack one.
pub struct SniSelect {
    pub certs: Arc<CertStore>,
    pub config: ConfigHandle,
    pub issue_tx: UnboundedSender<String>,
}

impl std::fmt::Debug for SniSelect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniSelect").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniSelect {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            return Some(self.certs.fallback());
        };
        let host = name.to_ascii_lowercase();
        if host.parse::<std::net::IpAddr>().is_ok() {
            return Some(self.certs.fallback());
        }

        let config = self.config.current();
        let configured = config
            .find_domain(&host)
            .map(|record| record.use_tls)
            .unwrap_or(false);
        if !configured {
            return Some(self.certs.fallback());
        }

        if let Some(certified) = self.certs.fresh(&host) {
            return Some(certified);
        }
        // Queue an issuance; the deduplicating worker ignores repeats.
        let _ = self.issue_tx.send(host);
        Some(self.certs.fallback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_store_roundtrip() {
        let store = ChallengeStore::new();
        store.put("tok", "tok.thumb");
        assert_eq!(store.get("tok").as_deref(), Some("tok.thumb"));
        store.remove("tok");
        assert!(store.get("tok").is_none());
    }

    #[test]
    fn self_signed_material_parses_and_installs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::open(dir.path(), Some("192.0.2.7")).unwrap();

        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        store
            .store("example.com", &cert.pem(), &key_pair.serialize_pem(), true)
            .unwrap();

        assert!(store.fresh("example.com").is_some());
        let meta = store.meta("example.com").unwrap();
        assert!(meta.staging);
        assert!(meta.not_after > Utc::now());

        // A second store instance picks the files up from disk.
        let reopened = CertStore::open(dir.path(), None).unwrap();
        assert!(reopened.fresh("example.com").is_some());
        assert!(reopened.fresh("other.org").is_none());
    }
}
