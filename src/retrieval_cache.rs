// Copyright 2023 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Retrieval caches
//!
//! Remote repositories memoize recent negative lookups so that repeated requests for paths the
//! origin does not have (or could not serve) do not hit the network again. Each remote
//! repository owns two independent instances: one for failures (connectivity errors, timeouts,
//! unexpected statuses) and one for misses (authoritative 404s).

use std::time::{Duration, Instant};

use moka::{Expiry, sync::Cache as MokaCache};

use crate::{path::RepoPath, resource::UnfoundResource};

/// Configuration for a [`RetrievalCache`].
#[derive(Clone, Copy, Debug)]
pub struct RetrievalCacheConfig {
    /// Maximum number of memoized paths.
    pub capacity: u64,

    /// How long an entry stays valid, measured from insertion.
    ///
    /// Reads do not extend the lifetime of an entry. A zero duration disables the cache.
    pub ttl: Duration,
}

impl Default for RetrievalCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
            ttl: Duration::from_secs(60),
        }
    }
}

impl RetrievalCacheConfig {
    /// Default configuration with the given time to live.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }
}

impl Expiry<RepoPath, UnfoundResource> for RetrievalCacheConfig {
    fn expire_after_create(
        &self,
        _key: &RepoPath,
        _value: &UnfoundResource,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.ttl)
    }

    // storing again counts as a new insertion
    fn expire_after_update(
        &self,
        _key: &RepoPath,
        _value: &UnfoundResource,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.ttl)
    }
}

/// Time-bounded memo of unfound lookups per path.
///
/// Only [`UnfoundResource`]s can be stored, so a found resource never ends up in here. Expired
/// entries are treated as misses on lookup. The cache is implemented using the moka crate,
/// whose operations are atomic with respect to each other, so instances can be shared freely
/// between request tasks.
#[derive(Clone, Debug)]
pub struct RetrievalCache {
    name: &'static str,
    config: RetrievalCacheConfig,
    cache: MokaCache<RepoPath, UnfoundResource>,
}

impl RetrievalCache {
    /// Create a new retrieval cache. The name is only used for logging.
    pub fn new(name: &'static str, config: RetrievalCacheConfig) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(config.capacity)
            .expire_after(config)
            .build();

        Self {
            name,
            config,
            cache,
        }
    }

    /// Name of this cache.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether entries are memoized at all.
    pub fn is_enabled(&self) -> bool {
        !self.config.ttl.is_zero()
    }

    /// Look up a memoized unfound resource.
    pub fn lookup(&self, path: &RepoPath) -> Option<UnfoundResource> {
        let hit = self.cache.get(path);

        if hit.is_some() {
            tracing::debug!(cache = self.name, %path, "retrieval cache hit");
        }

        hit
    }

    /// Memoize an unfound resource under its requested path.
    pub fn store(&self, unfound: UnfoundResource) {
        if !self.is_enabled() {
            return;
        }

        tracing::debug!(
            cache = self.name,
            path = %unfound.path,
            status = %unfound.status,
            ttl = ?self.config.ttl,
            "memoizing unfound resource"
        );

        self.cache.insert(unfound.path.clone(), unfound);
    }

    /// Forget a path.
    pub fn remove(&self, path: &RepoPath) {
        self.cache.invalidate(path);
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    fn unfound(path: &str) -> UnfoundResource {
        UnfoundResource::not_found(RepoPath::new("remote", path), "missing upstream")
    }

    #[test]
    fn can_store_and_lookup() {
        let cache = RetrievalCache::new("missed", RetrievalCacheConfig::default());
        let entry = unfound("a/b.jar");

        assert_eq!(cache.lookup(&entry.path), None);

        cache.store(entry.clone());

        assert_eq!(cache.lookup(&entry.path), Some(entry.clone()));
        assert_eq!(cache.lookup(&RepoPath::new("remote", "a/c.jar")), None);
    }

    #[test]
    fn can_remove_and_clear() {
        let cache = RetrievalCache::new("failed", RetrievalCacheConfig::default());
        let first = unfound("first");
        let second = unfound("second");

        cache.store(first.clone());
        cache.store(second.clone());

        cache.remove(&first.path);
        assert_eq!(cache.lookup(&first.path), None);
        assert!(cache.lookup(&second.path).is_some());

        cache.clear();
        assert_eq!(cache.lookup(&second.path), None);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = RetrievalCache::new(
            "missed",
            RetrievalCacheConfig::with_ttl(Duration::from_millis(50)),
        );
        let entry = unfound("a/b.jar");

        cache.store(entry.clone());
        assert!(cache.lookup(&entry.path).is_some());

        std::thread::sleep(Duration::from_millis(150));

        assert_eq!(cache.lookup(&entry.path), None);
    }

    #[test]
    fn reads_do_not_extend_lifetime() {
        let cache = RetrievalCache::new(
            "missed",
            RetrievalCacheConfig::with_ttl(Duration::from_millis(200)),
        );
        let entry = unfound("a/b.jar");
        cache.store(entry.clone());

        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(60));
            cache.lookup(&entry.path);
        }

        assert_eq!(cache.lookup(&entry.path), None);
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let cache = RetrievalCache::new("failed", RetrievalCacheConfig::with_ttl(Duration::ZERO));
        let entry = UnfoundResource::with_status(
            RepoPath::new("remote", "a"),
            StatusCode::BAD_GATEWAY,
            "boom",
        );

        cache.store(entry.clone());

        assert!(!cache.is_enabled());
        assert_eq!(cache.lookup(&entry.path), None);
    }
}
