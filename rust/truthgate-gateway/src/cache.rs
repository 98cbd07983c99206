//! The resolve/exists/list cache fronting every path query.
//!
//! Entries are keyed by `(CID, lowercased path)` or MFS path and tagged
//! with `cid:X` / `mfs:P`. Invalidating a tag eagerly expires everything
//! carrying it; the dispatcher fires both tags when a forwarded request
//! smells of stale cache. Concurrent misses for one key coalesce to a
//! single outbound node call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use truthgate_ipfs::{NodeClient, NodeResult, ProbeClient};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone, Debug, PartialEq)]
enum CacheValue {
    /// Canonical path, or `None` for a known-not-found input.
    Canonical(Option<String>),
    Exists(bool),
    Listing(Arc<std::collections::BTreeMap<String, String>>),
    Cid(String),
    Local(bool),
}

struct Entry {
    value: CacheValue,
    expires: Instant,
    tags: Vec<String>,
}

/// The tag-indexed store. Purely derived state: safe to discard wholesale.
#[derive(Default)]
pub struct TagCache {
    entries: DashMap<String, Entry>,
    tags: DashMap<String, HashSet<String>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<CacheValue> {
        let entry = self.entries.get(key)?;
        if entry.expires < Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: String, value: CacheValue, ttl: Duration, tags: Vec<String>) {
        for tag in tags.iter() {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires: Instant::now() + ttl,
                tags,
            },
        );
    }

    fn invalidate_tag(&self, tag: &str) {
        if let Some((_, keys)) = self.tags.remove(tag) {
            for key in keys {
                if let Some((_, entry)) = self.entries.remove(&key) {
                    // Unlink the key from its other tags so the indexes
                    // stay bounded.
                    for other in entry.tags {
                        if other != tag {
                            if let Some(mut set) = self.tags.get_mut(&other) {
                                set.remove(&key);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drop expired entries and stale tag links.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut dead = Vec::new();
        for entry in self.entries.iter() {
            if entry.expires < now {
                dead.push(entry.key().clone());
            }
        }
        for key in dead {
            if let Some((_, entry)) = self.entries.remove(&key) {
                for tag in entry.tags {
                    if let Some(mut set) = self.tags.get_mut(&tag) {
                        set.remove(&key);
                    }
                }
            }
        }
        self.tags.retain(|_, keys| !keys.is_empty());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take the per-key fill lock, coalescing concurrent misses.
    async fn fill_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_fill_lock(&self, key: &str, lock: &Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        // Last waiter out removes the slot.
        if Arc::strong_count(lock) <= 2 {
            inflight.remove(key);
        }
    }
}

fn tag_cid(cid: &str) -> String {
    format!("cid:{}", cid)
}

fn tag_mfs(path: &str) -> String {
    format!("mfs:{}", path)
}

/// The cache bound to its node clients: every path question the dispatcher
/// asks goes through here.
#[derive(Clone)]
pub struct SiteCache {
    cache: Arc<TagCache>,
    node: NodeClient,
    probe: ProbeClient,
    ttl: Duration,
}

impl SiteCache {
    pub fn new(node: NodeClient, probe: ProbeClient) -> Self {
        SiteCache {
            cache: Arc::new(TagCache::new()),
            node,
            probe,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn inner(&self) -> &TagCache {
        &self.cache
    }

    pub fn invalidate_cid(&self, cid: &str) {
        trace!("invalidating cache tag cid:{}", cid);
        self.cache.invalidate_tag(&tag_cid(cid));
    }

    pub fn invalidate_mfs(&self, mfs_path: &str) {
        trace!("invalidating cache tag mfs:{}", mfs_path);
        self.cache.invalidate_tag(&tag_mfs(mfs_path));
    }

    /// Cached `files/stat` of an MFS folder.
    pub async fn resolve_mfs_folder_to_cid(&self, mfs_path: &str) -> NodeResult<Option<String>> {
        let key = format!("cid:{}", mfs_path);
        if let Some(CacheValue::Cid(cid)) = self.cache.get(&key) {
            return Ok(Some(cid));
        }

        let lock = self.cache.fill_lock(&key).await;
        let _guard = lock.lock().await;
        if let Some(CacheValue::Cid(cid)) = self.cache.get(&key) {
            self.cache.release_fill_lock(&key, &lock).await;
            return Ok(Some(cid));
        }

        let result = match self.node.resolve_mfs_folder_to_cid(mfs_path).await {
            Ok(cid) => {
                self.cache.put(
                    key.clone(),
                    CacheValue::Cid(cid.clone()),
                    self.ttl,
                    vec![tag_mfs(mfs_path), tag_cid(&cid)],
                );
                Ok(Some(cid))
            }
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        };
        self.cache.release_fill_lock(&key, &lock).await;
        result
    }

    /// Cached pinned-or-present check.
    pub async fn is_cid_local(&self, cid: &str) -> NodeResult<bool> {
        let key = format!("local:{}", cid);
        if let Some(CacheValue::Local(local)) = self.cache.get(&key) {
            return Ok(local);
        }

        let lock = self.cache.fill_lock(&key).await;
        let _guard = lock.lock().await;
        if let Some(CacheValue::Local(local)) = self.cache.get(&key) {
            self.cache.release_fill_lock(&key, &lock).await;
            return Ok(local);
        }

        let result = match self.node.is_cid_local(cid).await {
            Ok(local) => {
                self.cache.put(
                    key.clone(),
                    CacheValue::Local(local),
                    self.ttl,
                    vec![tag_cid(cid)],
                );
                Ok(local)
            }
            Err(error) => Err(error),
        };
        self.cache.release_fill_lock(&key, &lock).await;
        result
    }

    /// Whether `input` names something inside `cid`, and under which
    /// canonical (case-corrected) path. Policy:
    ///
    /// 1. a cached resolution short-circuits (including known-not-found);
    /// 2. otherwise HEAD the path as given;
    /// 3. otherwise walk it segment by segment against cached directory
    ///    listings, case-insensitively, and HEAD the corrected path.
    pub async fn path_exists_in_ipfs(
        &self,
        cid: &str,
        input: &str,
    ) -> NodeResult<(bool, Option<String>)> {
        let input = input.trim_matches('/');
        if input.is_empty() {
            return Ok((true, Some(String::new())));
        }
        let lower = input.to_lowercase();
        let resolve_key = format!("resolve:{}:{}", cid, lower);

        if let Some(CacheValue::Canonical(canonical)) = self.cache.get(&resolve_key) {
            return match canonical {
                None => Ok((false, None)),
                Some(canonical) => {
                    let exists = self.exists_cached(cid, &canonical).await?;
                    Ok((exists, Some(canonical)))
                }
            };
        }

        if self.probe.head_exists(cid, input, false).await? {
            self.remember_resolution(cid, &lower, Some(input.to_string()));
            self.remember_existence(cid, input, true);
            return Ok((true, Some(input.to_string())));
        }

        // Case-insensitive walk.
        let mut canonical_parts: Vec<String> = Vec::new();
        for segment in input.split('/').filter(|s| !s.is_empty()) {
            let dir = canonical_parts.join("/");
            let listing = self.ls_cached(cid, &dir).await?;
            match listing.get(&segment.to_lowercase()) {
                Some(actual) => canonical_parts.push(actual.clone()),
                None => {
                    self.remember_resolution(cid, &lower, None);
                    return Ok((false, None));
                }
            }
        }

        let canonical = canonical_parts.join("/");
        if canonical != input && self.probe.head_exists(cid, &canonical, false).await? {
            self.remember_resolution(cid, &lower, Some(canonical.clone()));
            self.remember_existence(cid, &canonical, true);
            return Ok((true, Some(canonical)));
        }

        self.remember_resolution(cid, &lower, None);
        Ok((false, None))
    }

    async fn exists_cached(&self, cid: &str, canonical: &str) -> NodeResult<bool> {
        let key = format!("exists:{}:{}", cid, canonical);
        if let Some(CacheValue::Exists(exists)) = self.cache.get(&key) {
            return Ok(exists);
        }
        let exists = self.probe.head_exists(cid, canonical, false).await?;
        self.remember_existence(cid, canonical, exists);
        Ok(exists)
    }

    async fn ls_cached(
        &self,
        cid: &str,
        canonical_dir: &str,
    ) -> NodeResult<Arc<std::collections::BTreeMap<String, String>>> {
        let key = format!("ls:{}:{}", cid, canonical_dir.to_lowercase());
        if let Some(CacheValue::Listing(listing)) = self.cache.get(&key) {
            return Ok(listing);
        }

        let lock = self.cache.fill_lock(&key).await;
        let _guard = lock.lock().await;
        if let Some(CacheValue::Listing(listing)) = self.cache.get(&key) {
            self.cache.release_fill_lock(&key, &lock).await;
            return Ok(listing);
        }

        let target = if canonical_dir.is_empty() {
            format!("/ipfs/{}", cid)
        } else {
            format!("/ipfs/{}/{}", cid, canonical_dir)
        };
        let result = match self.node.ls(&target).await {
            Ok(listing) => {
                let listing = Arc::new(listing);
                self.cache.put(
                    key.clone(),
                    CacheValue::Listing(listing.clone()),
                    self.ttl,
                    vec![tag_cid(cid)],
                );
                Ok(listing)
            }
            Err(error) if error.is_not_found() => {
                let empty = Arc::new(std::collections::BTreeMap::new());
                self.cache.put(
                    key.clone(),
                    CacheValue::Listing(empty.clone()),
                    self.ttl,
                    vec![tag_cid(cid)],
                );
                Ok(empty)
            }
            Err(error) => Err(error),
        };
        self.cache.release_fill_lock(&key, &lock).await;
        result
    }

    fn remember_resolution(&self, cid: &str, lower: &str, canonical: Option<String>) {
        self.cache.put(
            format!("resolve:{}:{}", cid, lower),
            CacheValue::Canonical(canonical),
            self.ttl,
            vec![tag_cid(cid)],
        );
    }

    fn remember_existence(&self, cid: &str, canonical: &str, exists: bool) {
        self.cache.put(
            format!("exists:{}:{}", cid, canonical),
            CacheValue::Exists(exists),
            self.ttl,
            vec![tag_cid(cid)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_by_ttl() {
        let cache = TagCache::new();
        cache.put(
            "k".into(),
            CacheValue::Exists(true),
            Duration::from_millis(0),
            vec!["cid:QmA".into()],
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn tag_invalidation_expires_all_tagged_entries() {
        let cache = TagCache::new();
        cache.put(
            "resolve:QmA:a".into(),
            CacheValue::Canonical(Some("A".into())),
            Duration::from_secs(60),
            vec![tag_cid("QmA")],
        );
        cache.put(
            "cid:/production/sites/x".into(),
            CacheValue::Cid("QmA".into()),
            Duration::from_secs(60),
            vec![tag_mfs("/production/sites/x"), tag_cid("QmA")],
        );
        cache.put(
            "resolve:QmB:a".into(),
            CacheValue::Canonical(None),
            Duration::from_secs(60),
            vec![tag_cid("QmB")],
        );

        cache.invalidate_tag(&tag_cid("QmA"));

        assert!(cache.get("resolve:QmA:a").is_none());
        assert!(cache.get("cid:/production/sites/x").is_none());
        assert!(cache.get("resolve:QmB:a").is_some());
    }

    #[test]
    fn purge_drops_expired_entries_and_tag_links() {
        let cache = TagCache::new();
        cache.put(
            "a".into(),
            CacheValue::Exists(true),
            Duration::from_millis(0),
            vec![tag_cid("QmA")],
        );
        cache.put(
            "b".into(),
            CacheValue::Exists(true),
            Duration::from_secs(60),
            vec![tag_cid("QmA")],
        );
        std::thread::sleep(Duration::from_millis(5));
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_some());
    }

    #[tokio::test]
    async fn fill_locks_coalesce_and_clean_up() {
        let cache = Arc::new(TagCache::new());
        let lock = cache.fill_lock("k").await;
        {
            let _guard = lock.lock().await;
            // A second taker sees the same slot.
            let other = cache.fill_lock("k").await;
            assert!(Arc::ptr_eq(&lock, &other));
            cache.release_fill_lock("k", &other).await;
        }
        cache.release_fill_lock("k", &lock).await;
        assert!(cache.inflight.lock().await.is_empty());
    }
}
