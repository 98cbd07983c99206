//! Durable limiter state. Counters are written behind on a cadence; bans,
//! whitelists and audit entries are written through on mutation.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bans::{BanRecord, WhitelistRecord};
use super::counters::{bucket_time, IpMinuteSnapshot};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub details: Option<serde_json::Value>,
}

pub struct LimiterStore {
    db: sled::Db,
    counters: sled::Tree,
    global: sled::Tree,
    bans: sled::Tree,
    whitelists: sled::Tree,
    audit: sled::Tree,
}

impl LimiterStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .with_context(|| format!("failed to open limiter store at {:?}", path.as_ref()))?;
        Ok(LimiterStore {
            counters: db.open_tree("counters")?,
            global: db.open_tree("global")?,
            bans: db.open_tree("bans")?,
            whitelists: db.open_tree("whitelists")?,
            audit: db.open_tree("audit")?,
            db,
        })
    }

    pub fn save_ban(&self, record: &BanRecord) -> Result<()> {
        self.bans
            .insert(record.id.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn delete_ban(&self, id: &str) -> Result<()> {
        self.bans.remove(id.as_bytes())?;
        Ok(())
    }

    pub fn save_whitelist(&self, record: &WhitelistRecord) -> Result<()> {
        self.whitelists
            .insert(record.id.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn delete_whitelist(&self, id: &str) -> Result<()> {
        self.whitelists.remove(id.as_bytes())?;
        Ok(())
    }

    pub fn load_bans(&self) -> Result<Vec<BanRecord>> {
        let mut records = Vec::new();
        for entry in self.bans.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(record) => records.push(record),
                Err(error) => warn!("skipping unreadable ban record: {}", error),
            }
        }
        Ok(records)
    }

    pub fn load_whitelists(&self) -> Result<Vec<WhitelistRecord>> {
        let mut records = Vec::new();
        for entry in self.whitelists.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(record) => records.push(record),
                Err(error) => warn!("skipping unreadable whitelist record: {}", error),
            }
        }
        Ok(records)
    }

    /// Write absolute counter snapshots. Deterministic keys and absolute
    /// values make the flush idempotent: flushing the same state twice
    /// leaves the trees bit-identical.
    pub fn flush_counters(
        &self,
        per_ip: &[(IpAddr, String, IpMinuteSnapshot)],
        global: &[(String, u64)],
    ) -> Result<()> {
        for (ip, bucket, snapshot) in per_ip {
            let key = format!("{}|{}", bucket, ip);
            self.counters
                .insert(key.as_bytes(), serde_json::to_vec(snapshot)?)?;
        }
        for (bucket, total) in global {
            self.global
                .insert(bucket.as_bytes(), &total.to_be_bytes())?;
        }
        Ok(())
    }

    /// Remove persisted counters for buckets older than `cutoff`.
    pub fn purge_counters(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for entry in self.counters.iter() {
            let (key, _) = entry?;
            let key_str = String::from_utf8_lossy(&key);
            let bucket = key_str.split('|').next().unwrap_or_default();
            if bucket_time(bucket).map(|time| time < cutoff).unwrap_or(true) {
                self.counters.remove(&key)?;
                removed += 1;
            }
        }
        for entry in self.global.iter() {
            let (key, _) = entry?;
            let bucket = String::from_utf8_lossy(&key).to_string();
            if bucket_time(&bucket)
                .map(|time| time < cutoff)
                .unwrap_or(true)
            {
                self.global.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn append_audit(&self, record: &mut AuditRecord) -> Result<()> {
        record.id = self.db.generate_id()?;
        self.audit
            .insert(record.id.to_be_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut records = Vec::new();
        for entry in self.audit.iter().rev().take(limit) {
            let (_, value) = entry?;
            if let Ok(record) = serde_json::from_slice(&value) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// A stable digest of the persisted counter state, used by tests to
    /// assert flush idempotency.
    pub fn counter_digest(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for entry in self.counters.iter().chain(self.global.iter()) {
            let (key, value) = entry?;
            pairs.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        pairs.sort();
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::bans::{BanScope, BanType};
    use chrono::Duration;

    fn store() -> (tempfile::TempDir, LimiterStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LimiterStore::open(dir.path().join("limits")).unwrap();
        (dir, store)
    }

    #[test]
    fn bans_roundtrip_through_the_store() {
        let (_dir, store) = store();
        let record = BanRecord {
            id: "b1".into(),
            ip: Some("10.0.0.1".parse().unwrap()),
            ipv6_prefix: None,
            scope: BanScope::Public,
            ban_type: BanType::Soft,
            reason_code: "public_tier".into(),
            created_utc: Utc::now(),
            expires_utc: Utc::now() + Duration::minutes(10),
        };
        store.save_ban(&record).unwrap();

        let loaded = store.load_bans().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "b1");
        assert_eq!(loaded[0].scope, BanScope::Public);

        store.delete_ban("b1").unwrap();
        assert!(store.load_bans().unwrap().is_empty());
    }

    #[test]
    fn counter_flush_is_idempotent() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let snapshot = IpMinuteSnapshot {
            public_calls: 5,
            gateway_calls: 2,
            ..Default::default()
        };
        let per_ip = vec![(ip, "202403091407".to_string(), snapshot)];
        let global = vec![("202403091407".to_string(), 42u64)];

        store.flush_counters(&per_ip, &global).unwrap();
        let first = store.counter_digest().unwrap();
        store.flush_counters(&per_ip, &global).unwrap();
        let second = store.counter_digest().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn old_counters_are_purged() {
        let (_dir, store) = store();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let old = vec![(ip, "202001010000".to_string(), IpMinuteSnapshot::default())];
        let fresh_bucket = super::super::counters::minute_bucket(Utc::now());
        let fresh = vec![(ip, fresh_bucket, IpMinuteSnapshot::default())];
        store.flush_counters(&old, &[]).unwrap();
        store.flush_counters(&fresh, &[]).unwrap();

        let removed = store.purge_counters(Utc::now() - Duration::hours(48)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.counter_digest().unwrap().len(), 1);
    }

    #[test]
    fn audit_entries_accumulate_in_order() {
        let (_dir, store) = store();
        for action in ["unban", "whitelist_add"] {
            let mut record = AuditRecord {
                id: 0,
                ts: Utc::now(),
                actor: "admin".into(),
                action: action.into(),
                target: "10.0.0.1".into(),
                details: None,
            };
            store.append_audit(&mut record).unwrap();
        }
        let recent = store.recent_audit(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "whitelist_add");
    }
}
