//! Ban and whitelist records, in memory. Persistence is write-through and
//! handled by the owning [super::RateLimiter].

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnet::Ipv6Net;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BanScope {
    Global,
    Public,
    Admin,
    Gateway,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BanType {
    /// Bounded and auto-expiring.
    Soft,
    /// Long-lived; cleared only by administrative action.
    True,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanRecord {
    pub id: String,
    pub ip: Option<IpAddr>,
    pub ipv6_prefix: Option<Ipv6Net>,
    pub scope: BanScope,
    pub ban_type: BanType,
    pub reason_code: String,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

impl BanRecord {
    pub fn is_true_ban(&self) -> bool {
        self.ban_type == BanType::True
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }

    fn covers(&self, ip: IpAddr) -> bool {
        if self.ip == Some(ip) {
            return true;
        }
        match (self.ipv6_prefix, ip) {
            (Some(prefix), IpAddr::V6(v6)) => prefix.contains(&v6),
            _ => false,
        }
    }

    /// Whether this ban applies to a request on `scope`. Global bans apply
    /// everywhere.
    fn applies_to(&self, scope: BanScope) -> bool {
        self.scope == BanScope::Global || self.scope == scope
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WhitelistRecord {
    pub id: String,
    pub ip: Option<IpAddr>,
    pub ipv6_prefix: Option<Ipv6Net>,
    pub reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub auto: bool,
}

impl WhitelistRecord {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc
            .map(|expires| expires <= now)
            .unwrap_or(false)
    }

    fn covers(&self, ip: IpAddr) -> bool {
        if self.ip == Some(ip) {
            return true;
        }
        match (self.ipv6_prefix, ip) {
            (Some(prefix), IpAddr::V6(v6)) => prefix.contains(&v6),
            _ => false,
        }
    }
}

/// The /64 containing an IPv6 address, for prefix-keyed records.
pub fn v6_prefix64(ip: IpAddr) -> Option<Ipv6Net> {
    match ip {
        IpAddr::V6(v6) => Ipv6Net::new(v6, 64).ok().map(|net| net.trunc()),
        IpAddr::V4(_) => None,
    }
}

/// In-memory tables, keyed by record id.
#[derive(Default)]
pub struct BanTables {
    bans: DashMap<String, BanRecord>,
    whitelists: DashMap<String, WhitelistRecord>,
}

impl BanTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_ban(&self, record: BanRecord) {
        self.bans.insert(record.id.clone(), record);
    }

    pub fn insert_whitelist(&self, record: WhitelistRecord) {
        self.whitelists.insert(record.id.clone(), record);
    }

    /// The first live ban covering `ip` on `scope`, if any.
    pub fn active_ban(&self, ip: IpAddr, scope: BanScope, now: DateTime<Utc>) -> Option<BanRecord> {
        self.bans
            .iter()
            .find(|entry| {
                let ban = entry.value();
                !ban.expired(now) && ban.applies_to(scope) && ban.covers(ip)
            })
            .map(|entry| entry.value().clone())
    }

    pub fn is_whitelisted(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        self.whitelists
            .iter()
            .any(|entry| !entry.value().expired(now) && entry.value().covers(ip))
    }

    /// Whether any whitelist record (live or not) targets exactly `ip`.
    pub fn has_whitelist_for(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        self.whitelists
            .iter()
            .any(|entry| !entry.value().expired(now) && entry.value().ip == Some(ip))
    }

    /// Remove every ban covering `ip`, across all scopes; returns the
    /// removed ids.
    pub fn remove_bans_for(&self, ip: IpAddr) -> Vec<String> {
        let ids: Vec<String> = self
            .bans
            .iter()
            .filter(|entry| entry.value().covers(ip))
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids.iter() {
            self.bans.remove(id);
        }
        ids
    }

    pub fn remove_whitelists_for(&self, ip: IpAddr) -> Vec<String> {
        let ids: Vec<String> = self
            .whitelists
            .iter()
            .filter(|entry| entry.value().covers(ip))
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids.iter() {
            self.whitelists.remove(id);
        }
        ids
    }

    /// Count bans for `ip` on `scope` created since `since`, for the
    /// escalation schedule.
    pub fn bans_since(&self, ip: IpAddr, scope: BanScope, since: DateTime<Utc>) -> usize {
        self.bans
            .iter()
            .filter(|entry| {
                let ban = entry.value();
                ban.scope == scope && ban.covers(ip) && ban.created_utc >= since
            })
            .count()
    }

    /// Drop expired records; returns the ids removed (for persistence).
    pub fn purge_expired(&self, now: DateTime<Utc>) -> (Vec<String>, Vec<String>) {
        let dead_bans: Vec<String> = self
            .bans
            .iter()
            .filter(|entry| entry.value().expired(now) && !entry.value().is_true_ban())
            .map(|entry| entry.key().clone())
            .collect();
        for id in dead_bans.iter() {
            self.bans.remove(id);
        }
        let dead_whitelists: Vec<String> = self
            .whitelists
            .iter()
            .filter(|entry| entry.value().expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for id in dead_whitelists.iter() {
            self.whitelists.remove(id);
        }
        (dead_bans, dead_whitelists)
    }

    pub fn bans(&self) -> Vec<BanRecord> {
        self.bans.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn whitelists(&self) -> Vec<WhitelistRecord> {
        self.whitelists
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ban(ip: &str, scope: BanScope, minutes: i64) -> BanRecord {
        BanRecord {
            id: format!("{}-{:?}", ip, scope),
            ip: Some(ip.parse().unwrap()),
            ipv6_prefix: None,
            scope,
            ban_type: BanType::Soft,
            reason_code: "test".into(),
            created_utc: Utc::now(),
            expires_utc: Utc::now() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn scoped_and_global_bans_apply_correctly() {
        let tables = BanTables::new();
        let now = Utc::now();
        tables.insert_ban(ban("10.0.0.1", BanScope::Admin, 10));

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(tables.active_ban(ip, BanScope::Admin, now).is_some());
        assert!(tables.active_ban(ip, BanScope::Public, now).is_none());

        tables.insert_ban(ban("10.0.0.1", BanScope::Global, 10));
        assert!(tables.active_ban(ip, BanScope::Public, now).is_some());
    }

    #[test]
    fn expired_bans_do_not_apply_and_get_purged() {
        let tables = BanTables::new();
        let mut record = ban("10.0.0.2", BanScope::Public, 10);
        record.expires_utc = Utc::now() - Duration::minutes(1);
        tables.insert_ban(record);

        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(tables.active_ban(ip, BanScope::Public, Utc::now()).is_none());
        let (dead, _) = tables.purge_expired(Utc::now());
        assert_eq!(dead.len(), 1);
        assert!(tables.bans().is_empty());
    }

    #[test]
    fn true_bans_survive_purging() {
        let tables = BanTables::new();
        let mut record = ban("10.0.0.3", BanScope::Global, 10);
        record.ban_type = BanType::True;
        record.expires_utc = Utc::now() - Duration::minutes(1);
        tables.insert_ban(record);

        let (dead, _) = tables.purge_expired(Utc::now());
        assert!(dead.is_empty());
        assert_eq!(tables.bans().len(), 1);
    }

    #[test]
    fn v6_prefix_records_cover_the_whole_64() {
        let tables = BanTables::new();
        let prefix = v6_prefix64("2001:db8:1:2:3:4:5:6".parse().unwrap()).unwrap();
        assert_eq!(prefix.to_string(), "2001:db8:1:2::/64");

        tables.insert_whitelist(WhitelistRecord {
            id: "w1".into(),
            ip: None,
            ipv6_prefix: Some(prefix),
            reason: None,
            created_utc: Utc::now(),
            expires_utc: None,
            auto: false,
        });

        let sibling: IpAddr = "2001:db8:1:2:ffff::1".parse().unwrap();
        let outsider: IpAddr = "2001:db8:1:3::1".parse().unwrap();
        assert!(tables.is_whitelisted(sibling, Utc::now()));
        assert!(!tables.is_whitelisted(outsider, Utc::now()));
    }

    #[test]
    fn unban_clears_every_scope() {
        let tables = BanTables::new();
        tables.insert_ban(ban("10.0.0.4", BanScope::Admin, 10));
        tables.insert_ban(ban("10.0.0.4", BanScope::Gateway, 10));
        tables.insert_ban(ban("10.0.0.5", BanScope::Admin, 10));

        let removed = tables.remove_bans_for("10.0.0.4".parse().unwrap());
        assert_eq!(removed.len(), 2);
        assert_eq!(tables.bans().len(), 1);
    }
}
