//! Lock-free minute accumulators, sharded by `(ip, minute bucket)`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// UTC minute bucket, `yyyyMMddHHmm`.
pub fn minute_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M").to_string()
}

pub fn bucket_time(bucket: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(&format!("{}00", bucket), "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Per-IP accumulator for one minute. Mutated with atomics only.
#[derive(Default)]
pub struct IpMinute {
    pub public_calls: AtomicU64,
    pub admin_bad_key_calls: AtomicU64,
    pub admin_good_key_calls: AtomicU64,
    pub gateway_calls: AtomicU64,
    pub gateway_overage_used: AtomicU64,
}

/// The snapshot shape persisted by the flusher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpMinuteSnapshot {
    pub public_calls: u64,
    pub admin_bad_key_calls: u64,
    pub admin_good_key_calls: u64,
    pub gateway_calls: u64,
    pub gateway_overage_used: u64,
}

impl IpMinute {
    pub fn snapshot(&self) -> IpMinuteSnapshot {
        IpMinuteSnapshot {
            public_calls: self.public_calls.load(Ordering::Relaxed),
            admin_bad_key_calls: self.admin_bad_key_calls.load(Ordering::Relaxed),
            admin_good_key_calls: self.admin_good_key_calls.load(Ordering::Relaxed),
            gateway_calls: self.gateway_calls.load(Ordering::Relaxed),
            gateway_overage_used: self.gateway_overage_used.load(Ordering::Relaxed),
        }
    }
}

/// All live accumulators. Entries age out via [CounterShards::prune].
#[derive(Default)]
pub struct CounterShards {
    per_ip: DashMap<(IpAddr, String), Arc<IpMinute>>,
    global: DashMap<String, Arc<AtomicU64>>,
}

impl CounterShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ip_minute(&self, ip: IpAddr, bucket: &str) -> Arc<IpMinute> {
        self.per_ip
            .entry((ip, bucket.to_string()))
            .or_default()
            .clone()
    }

    pub fn global_minute(&self, bucket: &str) -> Arc<AtomicU64> {
        self.global.entry(bucket.to_string()).or_default().clone()
    }

    pub fn global_total(&self, bucket: &str) -> u64 {
        self.global
            .get(bucket)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of bad admin-key calls from `ip` over the trailing 24 hours.
    pub fn admin_bad_key_calls_24h(&self, ip: IpAddr, now: DateTime<Utc>) -> u64 {
        self.sum_since(ip, now - Duration::hours(24), |minute| {
            minute.admin_bad_key_calls.load(Ordering::Relaxed)
        })
    }

    /// Sum of gateway overage used from `ip` over the trailing hour.
    pub fn gateway_overage_used_1h(&self, ip: IpAddr, now: DateTime<Utc>) -> u64 {
        self.sum_since(ip, now - Duration::hours(1), |minute| {
            minute.gateway_overage_used.load(Ordering::Relaxed)
        })
    }

    fn sum_since<F>(&self, ip: IpAddr, since: DateTime<Utc>, read: F) -> u64
    where
        F: Fn(&IpMinute) -> u64,
    {
        self.per_ip
            .iter()
            .filter(|entry| {
                let (entry_ip, bucket) = entry.key();
                *entry_ip == ip
                    && bucket_time(bucket)
                        .map(|time| time >= since)
                        .unwrap_or(false)
            })
            .map(|entry| read(entry.value()))
            .sum()
    }

    /// Reset the live window for an IP (used by unban).
    pub fn reset_ip(&self, ip: IpAddr) {
        self.per_ip.retain(|(entry_ip, _), _| *entry_ip != ip);
    }

    /// Snapshot every live accumulator for the flusher.
    pub fn snapshot_all(&self) -> (Vec<(IpAddr, String, IpMinuteSnapshot)>, Vec<(String, u64)>) {
        let per_ip = self
            .per_ip
            .iter()
            .map(|entry| {
                let (ip, bucket) = entry.key();
                (*ip, bucket.clone(), entry.value().snapshot())
            })
            .collect();
        let global = self
            .global
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        (per_ip, global)
    }

    /// Drop accumulators older than `keep`, measured from `now`.
    pub fn prune(&self, now: DateTime<Utc>, keep: Duration) {
        let cutoff = now - keep;
        let stale = |bucket: &str| {
            bucket_time(bucket)
                .map(|time| time < cutoff)
                .unwrap_or(true)
        };
        self.per_ip.retain(|(_, bucket), _| !stale(bucket));
        self.global.retain(|bucket, _| !stale(bucket));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn buckets_format_and_parse() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 7, 31).unwrap();
        let bucket = minute_bucket(at);
        assert_eq!(bucket, "202403091407");
        assert_eq!(
            bucket_time(&bucket),
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 14, 7, 0).unwrap())
        );
    }

    #[test]
    fn trailing_sums_only_cover_their_window() {
        let shards = CounterShards::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap();

        let fresh = minute_bucket(now - Duration::minutes(30));
        let stale = minute_bucket(now - Duration::hours(25));
        shards
            .ip_minute(ip, &fresh)
            .admin_bad_key_calls
            .store(3, Ordering::Relaxed);
        shards
            .ip_minute(ip, &stale)
            .admin_bad_key_calls
            .store(9, Ordering::Relaxed);

        assert_eq!(shards.admin_bad_key_calls_24h(ip, now), 3);
    }

    #[test]
    fn prune_drops_old_buckets() {
        let shards = CounterShards::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let now = Utc::now();

        shards.ip_minute(ip, &minute_bucket(now));
        shards.ip_minute(ip, &minute_bucket(now - Duration::hours(3)));
        shards.global_minute(&minute_bucket(now - Duration::hours(3)));

        shards.prune(now, Duration::hours(2));
        let (per_ip, global) = shards.snapshot_all();
        assert_eq!(per_ip.len(), 1);
        assert!(global.is_empty());
    }

    #[test]
    fn reset_ip_clears_only_that_ip() {
        let shards = CounterShards::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let bucket = minute_bucket(Utc::now());
        shards.ip_minute(a, &bucket);
        shards.ip_minute(b, &bucket);

        shards.reset_ip(a);
        let (per_ip, _) = shards.snapshot_all();
        assert_eq!(per_ip.len(), 1);
        assert_eq!(per_ip[0].0, b);
    }
}
