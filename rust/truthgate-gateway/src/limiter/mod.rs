//! The adaptive rate limiter: minute-bucket accounting in the request
//! path, write-behind persistence, bans, whitelists and churn detection.
//!
//! Decision order on every surface: whitelist, then ban, then limit.
//! Counters only observe admitted requests; the increment that crosses a
//! budget is the same atomic operation that installs the resulting ban.

pub mod bans;
pub mod churn;
pub mod counters;
pub mod store;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;
use tokio::task::JoinHandle;
use truthgate_core::config::RateLimitConfig;
use truthgate_core::ConfigHandle;

use bans::{v6_prefix64, BanRecord, BanScope, BanTables, BanType, WhitelistRecord};
use churn::ChurnDetector;
use counters::{minute_bucket, CounterShards};
use store::{AuditRecord, LimiterStore};

/// How long a good admin key keeps its grace record.
const GRACE_LIFETIME_HOURS: i64 = 1;

/// Outcome for public and gateway surfaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Budget crossed this request; 429 with `Retry-After`.
    RateLimited { retry_after_secs: u64 },
    /// An active ban applies; 403.
    Banned,
}

/// Outcome for admin-protected surfaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminGate {
    Allowed,
    /// Missing or invalid credential; the caller responds with the
    /// oracle-proof 401.
    Unauthorized,
    Banned,
}

#[derive(Clone, Debug, Serialize)]
pub struct LimiterSnapshot {
    pub minute: String,
    pub global_calls_this_minute: u64,
    pub bans: Vec<BanRecord>,
    pub whitelists: Vec<WhitelistRecord>,
}

pub struct RateLimiter {
    config: ConfigHandle,
    counters: CounterShards,
    tables: BanTables,
    churn: ChurnDetector,
    grace: DashMap<(IpAddr, String), DateTime<Utc>>,
    store: Option<LimiterStore>,
}

impl RateLimiter {
    pub fn new(config: ConfigHandle, store: Option<LimiterStore>) -> Self {
        let tables = BanTables::new();
        if let Some(store) = store.as_ref() {
            let now = Utc::now();
            match store.load_bans() {
                Ok(records) => {
                    for record in records {
                        if !record.expired(now) || record.is_true_ban() {
                            tables.insert_ban(record);
                        }
                    }
                }
                Err(error) => warn!("failed to load bans: {}", error),
            }
            match store.load_whitelists() {
                Ok(records) => {
                    for record in records {
                        if !record.expired(now) {
                            tables.insert_whitelist(record);
                        }
                    }
                }
                Err(error) => warn!("failed to load whitelists: {}", error),
            }
        }
        RateLimiter {
            config,
            counters: CounterShards::new(),
            tables,
            churn: ChurnDetector::new(),
            grace: DashMap::new(),
            store,
        }
    }

    fn limits(&self) -> RateLimitConfig {
        self.config.current().rate_limit.clone()
    }

    /// Admin-protected surface. `authorized` reflects key or session
    /// verification done by the caller; `key_id` names the matching stored
    /// key, when one did.
    pub fn check_admin(&self, ip: IpAddr, authorized: bool, key_id: Option<&str>) -> AdminGate {
        self.check_admin_at(ip, authorized, key_id, Utc::now())
    }

    pub(crate) fn check_admin_at(
        &self,
        ip: IpAddr,
        authorized: bool,
        key_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> AdminGate {
        let limits = self.limits();
        let bucket = minute_bucket(now);
        let whitelisted = self.tables.is_whitelisted(ip, now);

        if !whitelisted && self.tables.active_ban(ip, BanScope::Admin, now).is_some() {
            return AdminGate::Banned;
        }

        let minute = self.counters.ip_minute(ip, &bucket);
        if authorized {
            minute
                .admin_good_key_calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if let Some(key_id) = key_id {
                self.grace.insert(
                    (ip, key_id.to_string()),
                    now + Duration::hours(GRACE_LIFETIME_HOURS),
                );
            }
            return AdminGate::Allowed;
        }

        minute
            .admin_bad_key_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        if !whitelisted {
            let bad_24h = self.counters.admin_bad_key_calls_24h(ip, now);
            if bad_24h == limits.admin_bad_key_threshold {
                self.install_ban(
                    ip,
                    BanScope::Admin,
                    "admin_bad_key",
                    limits.admin_ban_minutes,
                    &limits,
                    now,
                );
            }
        }
        AdminGate::Unauthorized
    }

    /// Public-limited surface with the adaptive tier schedule.
    pub fn check_public(&self, ip: IpAddr) -> Decision {
        self.check_public_at(ip, Utc::now())
    }

    pub(crate) fn check_public_at(&self, ip: IpAddr, now: DateTime<Utc>) -> Decision {
        let limits = self.limits();
        let bucket = minute_bucket(now);

        if self.tables.is_whitelisted(ip, now) {
            self.admit_public(ip, &bucket);
            return Decision::Allowed;
        }
        if self.tables.active_ban(ip, BanScope::Public, now).is_some() {
            return Decision::Banned;
        }

        let global_total = self.counters.global_total(&bucket);
        let mut budget = limits.public_per_minute;
        for tier in limits.public_tiers.iter() {
            if global_total >= tier.threshold {
                budget = tier.new_per_minute;
            }
        }

        let minute = self.counters.ip_minute(ip, &bucket);
        let count = minute
            .public_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if count <= budget {
            self.counters
                .global_minute(&bucket)
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Decision::Allowed;
        }

        if count == budget + 1 {
            self.install_ban(
                ip,
                BanScope::Public,
                "public_tier",
                limits.public_ban_minutes,
                &limits,
                now,
            );
        }
        Decision::RateLimited {
            retry_after_secs: (limits.public_ban_minutes.max(0) as u64) * 60,
        }
    }

    fn admit_public(&self, ip: IpAddr, bucket: &str) {
        self.counters
            .ip_minute(ip, bucket)
            .public_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.counters
            .global_minute(bucket)
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Gateway (content proxy) surface: free minute budget plus a sliding
    /// hourly overage. Authenticated callers are exempt and optionally
    /// auto-whitelisted.
    pub fn check_gateway(&self, ip: IpAddr, authenticated: bool) -> Decision {
        self.check_gateway_at(ip, authenticated, Utc::now())
    }

    pub(crate) fn check_gateway_at(
        &self,
        ip: IpAddr,
        authenticated: bool,
        now: DateTime<Utc>,
    ) -> Decision {
        let limits = self.limits();
        let bucket = minute_bucket(now);

        if authenticated {
            if limits.auto_whitelist_on_auth && !self.tables.has_whitelist_for(ip, now) {
                self.add_whitelist(ip, Some(limits.auto_whitelist_days), true, "system", None);
            }
            return Decision::Allowed;
        }
        if self.tables.is_whitelisted(ip, now) {
            return Decision::Allowed;
        }
        if self.tables.active_ban(ip, BanScope::Gateway, now).is_some() {
            return Decision::Banned;
        }

        let minute = self.counters.ip_minute(ip, &bucket);
        let count = minute
            .gateway_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if count <= limits.gateway_free_per_minute {
            return Decision::Allowed;
        }

        // Free budget spent: draw on the sliding hourly overage.
        minute
            .gateway_overage_used
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let used_1h = self.counters.gateway_overage_used_1h(ip, now);
        if used_1h <= limits.gateway_overage_per_hour {
            return Decision::Allowed;
        }
        if used_1h == limits.gateway_overage_per_hour + 1 {
            self.install_ban(
                ip,
                BanScope::Gateway,
                "gateway_overage",
                limits.gateway_ban_minutes,
                &limits,
                now,
            );
        }
        Decision::Banned
    }

    /// Fed by the TLS acceptor for every new connection.
    pub fn note_tls_connection(&self, ip: IpAddr) {
        let limits = self.limits();
        if self.tables.is_whitelisted(ip, Utc::now()) {
            return;
        }
        if self.churn.note_connection(ip, &limits.churn) {
            warn!("TLS churn detected from {}", ip);
            self.install_ban(
                ip,
                BanScope::Gateway,
                "tls_churn",
                limits.gateway_ban_minutes,
                &limits,
                Utc::now(),
            );
        }
    }

    /// Fed once per request, pairing with [Self::note_tls_connection].
    pub fn note_request(&self, ip: IpAddr) {
        self.churn.note_request(ip);
    }

    fn install_ban(
        &self,
        ip: IpAddr,
        scope: BanScope,
        reason: &str,
        base_minutes: i64,
        limits: &RateLimitConfig,
        now: DateTime<Utc>,
    ) {
        let mut minutes = base_minutes.max(1);
        let mut ban_type = BanType::Soft;

        if limits.escalation.enabled {
            let prior = self.tables.bans_since(ip, scope, now - Duration::hours(24));
            let strikes = prior + 1;
            if strikes >= 10 {
                minutes *= limits.escalation.ten_x_multiplier.max(1) as i64;
                if limits.escalation.promote_to_true_ban {
                    ban_type = BanType::True;
                }
            } else if strikes >= 4 {
                minutes *= limits.escalation.four_x_multiplier.max(1) as i64;
            }
        }

        let record = BanRecord {
            id: random_id(),
            ip: Some(ip),
            ipv6_prefix: None,
            scope,
            ban_type,
            reason_code: reason.to_string(),
            created_utc: now,
            expires_utc: now + Duration::minutes(minutes),
        };
        info!(
            "{}-banning {} on {} for {}m ({})",
            record.ban_type, ip, scope, minutes, reason
        );
        if let Some(store) = self.store.as_ref() {
            if let Err(error) = store.save_ban(&record) {
                warn!("failed to persist ban: {}", error);
            }
        }
        self.tables.insert_ban(record);
        self.audit("system", "ban_add", &ip.to_string(), Some(reason));
    }

    /// Clear every ban for `ip` across scopes and reset its live window.
    pub fn unban(&self, ip: IpAddr, actor: &str) -> usize {
        let removed = self.tables.remove_bans_for(ip);
        if let Some(store) = self.store.as_ref() {
            for id in removed.iter() {
                if let Err(error) = store.delete_ban(id) {
                    warn!("failed to delete persisted ban {}: {}", id, error);
                }
            }
        }
        self.counters.reset_ip(ip);
        self.audit(actor, "unban", &ip.to_string(), None);
        removed.len()
    }

    pub fn add_whitelist(
        &self,
        ip: IpAddr,
        days: Option<i64>,
        auto: bool,
        actor: &str,
        reason: Option<&str>,
    ) {
        let now = Utc::now();
        let record = WhitelistRecord {
            id: random_id(),
            ip: Some(ip),
            ipv6_prefix: None,
            reason: reason.map(str::to_owned),
            created_utc: now,
            expires_utc: days.map(|days| now + Duration::days(days)),
            auto,
        };
        if let Some(store) = self.store.as_ref() {
            if let Err(error) = store.save_whitelist(&record) {
                warn!("failed to persist whitelist: {}", error);
            }
        }
        self.tables.insert_whitelist(record);
        self.audit(actor, "whitelist_add", &ip.to_string(), reason);
    }

    /// Whitelist a whole IPv6 /64, for operators dealing with rotating
    /// suffixes.
    pub fn add_whitelist_prefix(&self, ip: IpAddr, days: Option<i64>, actor: &str) -> bool {
        let Some(prefix) = v6_prefix64(ip) else {
            return false;
        };
        let now = Utc::now();
        let record = WhitelistRecord {
            id: random_id(),
            ip: None,
            ipv6_prefix: Some(prefix),
            reason: None,
            created_utc: now,
            expires_utc: days.map(|days| now + Duration::days(days)),
            auto: false,
        };
        if let Some(store) = self.store.as_ref() {
            if let Err(error) = store.save_whitelist(&record) {
                warn!("failed to persist whitelist: {}", error);
            }
        }
        self.tables.insert_whitelist(record);
        self.audit(actor, "whitelist_add_prefix", &prefix.to_string(), None);
        true
    }

    pub fn remove_whitelist(&self, ip: IpAddr, actor: &str) -> usize {
        let removed = self.tables.remove_whitelists_for(ip);
        if let Some(store) = self.store.as_ref() {
            for id in removed.iter() {
                if let Err(error) = store.delete_whitelist(id) {
                    warn!("failed to delete persisted whitelist {}: {}", id, error);
                }
            }
        }
        self.audit(actor, "whitelist_remove", &ip.to_string(), None);
        removed.len()
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let bucket = minute_bucket(Utc::now());
        LimiterSnapshot {
            global_calls_this_minute: self.counters.global_total(&bucket),
            minute: bucket,
            bans: self.tables.bans(),
            whitelists: self.tables.whitelists(),
        }
    }

    fn audit(&self, actor: &str, action: &str, target: &str, details: Option<&str>) {
        if let Some(store) = self.store.as_ref() {
            let mut record = AuditRecord {
                id: 0,
                ts: Utc::now(),
                actor: actor.to_string(),
                action: action.to_string(),
                target: target.to_string(),
                details: details.map(|d| serde_json::Value::String(d.to_string())),
            };
            if let Err(error) = store.append_audit(&mut record) {
                warn!("failed to append audit record: {}", error);
            }
        }
    }

    /// Persist current counters. Failures log and fall open: requests keep
    /// flowing on memory alone.
    pub async fn flush_now(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let (per_ip, global) = self.counters.snapshot_all();
        if let Err(error) = store.flush_counters(&per_ip, &global) {
            warn!("counter flush failed (continuing from memory): {}", error);
            return;
        }
        if let Err(error) = store.flush().await {
            warn!("counter flush sync failed: {}", error);
        }
    }

    /// Start the write-behind flusher and the purge worker.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let limiter = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let interval = limiter.limits().flush_secs.max(1);
                tokio::time::sleep(StdDuration::from_secs(interval)).await;
                limiter.flush_now().await;
            }
        }));

        let limiter = self.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(StdDuration::from_secs(60)).await;
                limiter.purge();
            }
        }));

        handles
    }

    /// One purge pass: expired bans/whitelists, aged counters, idle churn
    /// windows.
    pub fn purge(&self) {
        let now = Utc::now();
        let limits = self.limits();

        let (dead_bans, dead_whitelists) = self.tables.purge_expired(now);
        if let Some(store) = self.store.as_ref() {
            for id in dead_bans.iter() {
                let _ = store.delete_ban(id);
            }
            for id in dead_whitelists.iter() {
                let _ = store.delete_whitelist(id);
            }
            match store.purge_counters(now - Duration::hours(limits.counter_retention_hours as i64))
            {
                Ok(removed) if removed > 0 => {
                    debug!("purged {} persisted counter buckets", removed)
                }
                Ok(_) => {}
                Err(error) => warn!("counter purge failed: {}", error),
            }
        }

        // The admin bad-key sum needs a full day of live buckets.
        self.counters.prune(now, Duration::hours(25));
        self.churn.prune(&limits.churn);
        self.grace.retain(|_, expires| *expires > now);
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use truthgate_core::config::PublicTier;
    use truthgate_core::{ConfigStore, TruthGateConfig};

    fn limiter_with(mutate: impl FnOnce(&mut RateLimitConfig)) -> RateLimiter {
        let mut config = TruthGateConfig::default();
        mutate(&mut config.rate_limit);
        let store = ConfigStore::in_memory(config, "/tmp/unused.toml");
        RateLimiter::new(store.handle(), None)
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 7, 0).unwrap()
    }

    #[test]
    fn public_budget_crossing_rate_limits_then_bans() {
        let limiter = limiter_with(|limits| {
            limits.public_per_minute = 3;
            limits.public_tiers.clear();
            limits.public_ban_minutes = 10;
        });
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        let now = at();

        for _ in 0..3 {
            assert_eq!(limiter.check_public_at(ip, now), Decision::Allowed);
        }
        assert_eq!(
            limiter.check_public_at(ip, now),
            Decision::RateLimited {
                retry_after_secs: 600
            }
        );
        // The crossing installed a soft ban: subsequent calls are 403s.
        assert_eq!(limiter.check_public_at(ip, now), Decision::Banned);
    }

    #[test]
    fn tiers_shrink_the_budget_as_global_load_rises() {
        let limiter = limiter_with(|limits| {
            limits.public_per_minute = 100;
            limits.public_tiers = vec![PublicTier {
                threshold: 50,
                new_per_minute: 1,
            }];
        });
        let now = at();
        let bucket = minute_bucket(now);
        limiter
            .counters
            .global_minute(&bucket)
            .store(50, std::sync::atomic::Ordering::Relaxed);

        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(limiter.check_public_at(ip, now), Decision::Allowed);
        assert!(matches!(
            limiter.check_public_at(ip, now),
            Decision::RateLimited { .. }
        ));
    }

    #[test]
    fn admin_bad_keys_ban_at_the_threshold() {
        let limiter = limiter_with(|limits| {
            limits.admin_bad_key_threshold = 4;
        });
        let ip: IpAddr = "127.0.1.1".parse().unwrap();
        let now = at();

        for _ in 0..4 {
            assert_eq!(
                limiter.check_admin_at(ip, false, None, now),
                AdminGate::Unauthorized
            );
        }
        // Threshold crossed on the 4th bad attempt; the 5th sees the ban.
        assert_eq!(
            limiter.check_admin_at(ip, false, None, now),
            AdminGate::Banned
        );
        // A valid key from a different IP is unaffected.
        let other: IpAddr = "127.0.1.2".parse().unwrap();
        assert_eq!(
            limiter.check_admin_at(other, true, Some("ops"), now),
            AdminGate::Allowed
        );
    }

    #[test]
    fn whitelists_bypass_bans_and_limits() {
        let limiter = limiter_with(|limits| {
            limits.public_per_minute = 1;
        });
        let ip: IpAddr = "203.0.113.77".parse().unwrap();
        let now = at();

        limiter.add_whitelist(ip, Some(7), false, "admin", Some("testing"));
        for _ in 0..10 {
            assert_eq!(limiter.check_public_at(ip, now), Decision::Allowed);
        }

        limiter.remove_whitelist(ip, "admin");
        // Budget of 1 was long since burned by the counted calls above.
        assert_ne!(limiter.check_public_at(ip, now), Decision::Allowed);
    }

    #[test]
    fn gateway_overage_extends_the_free_budget_then_bans() {
        let limiter = limiter_with(|limits| {
            limits.gateway_free_per_minute = 2;
            limits.gateway_overage_per_hour = 2;
            limits.auto_whitelist_on_auth = false;
        });
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        let now = at();

        for _ in 0..2 {
            assert_eq!(limiter.check_gateway_at(ip, false, now), Decision::Allowed);
        }
        for _ in 0..2 {
            assert_eq!(limiter.check_gateway_at(ip, false, now), Decision::Allowed);
        }
        assert_eq!(limiter.check_gateway_at(ip, false, now), Decision::Banned);
        assert_eq!(limiter.check_gateway_at(ip, false, now), Decision::Banned);
    }

    #[test]
    fn authenticated_gateway_calls_auto_whitelist() {
        let limiter = limiter_with(|limits| {
            limits.auto_whitelist_on_auth = true;
            limits.auto_whitelist_days = 7;
        });
        let ip: IpAddr = "198.51.100.9".parse().unwrap();
        let now = at();

        assert_eq!(limiter.check_gateway_at(ip, true, now), Decision::Allowed);
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.whitelists.len(), 1);
        assert!(snapshot.whitelists[0].auto);
    }

    #[test]
    fn unban_clears_scopes_and_resets_the_window() {
        let limiter = limiter_with(|limits| {
            limits.public_per_minute = 2;
        });
        let ip: IpAddr = "203.0.113.50".parse().unwrap();
        let now = at();

        for _ in 0..3 {
            limiter.check_public_at(ip, now);
        }
        assert_eq!(limiter.check_public_at(ip, now), Decision::Banned);

        assert!(limiter.unban(ip, "admin") > 0);
        assert_eq!(limiter.check_public_at(ip, now), Decision::Allowed);
    }

    #[tokio::test]
    async fn flush_without_a_store_is_a_no_op() {
        let limiter = limiter_with(|_| {});
        limiter.flush_now().await;
    }
}
