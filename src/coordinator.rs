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

//! # Download coordination
//!
//! Concurrent requests for the same remote artifact must not fetch it from the origin more than
//! once. The [`DownloadCoordinator`] hands out one async lock per remote path: the first request
//! downloads into the local cache, everyone who waited on the lock finds the fresh entry there.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::Mutex as PathLock;

use crate::{
    errors::{Error, Result},
    path::RepoPath,
    repo::{LocalCacheRepo, Repository},
    resource::FoundResource,
};

/// Default bound on waiting for another download of the same path.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Lock of one remote path and the number of downloads completed under it.
#[derive(Debug, Default)]
struct InFlight {
    lock: PathLock<()>,
    completed: AtomicU64,
}

/// Single-flight guard for remote downloads, shared by all remote repositories.
#[derive(Debug)]
pub struct DownloadCoordinator {
    locks: Mutex<HashMap<RepoPath, Arc<InFlight>>>,
    lock_timeout: Duration,
}

impl Default for DownloadCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

/// What to fetch and where to put it.
pub(crate) struct Fetch<'a> {
    /// Resource as resolved against the origin, keyed by the remote repository
    pub(crate) resource: &'a FoundResource,
    /// Destination of the download
    pub(crate) cache: &'a LocalCacheRepo,
}

impl DownloadCoordinator {
    /// A coordinator giving up on a busy path after `lock_timeout`.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            locks: Mutex::default(),
            lock_timeout,
        }
    }

    /// Number of paths currently being downloaded or waited on.
    pub fn in_flight(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Make sure the resource is in the cache, downloading it with `download` at most once
    /// across concurrent callers. Returns the resource as held by the cache.
    pub(crate) async fn fetch<F, Fut>(&self, fetch: Fetch<'_>, download: F) -> Result<FoundResource>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FoundResource>>,
    {
        if let Some(cached) = self.cached(&fetch, false).await? {
            return Ok(cached);
        }

        let path = &fetch.resource.response_path;
        let flight = self.acquire(path);
        let seen = flight.completed.load(Ordering::Acquire);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.lock_timeout, flight.lock.lock()).await {
            Ok(_guard) => {
                let fetched_meanwhile = flight.completed.load(Ordering::Acquire) > seen;
                match self.cached(&fetch, fetched_meanwhile).await {
                    Ok(Some(cached)) => {
                        tracing::debug!(%path, "download completed by another request");
                        Ok(cached)
                    }
                    Ok(None) => download().await.inspect(|_| {
                        flight.completed.fetch_add(1, Ordering::Release);
                    }),
                    Err(error) => Err(error),
                }
            }
            Err(_) => Err(Error::LockTimeout {
                target: path.to_string(),
                waited: started.elapsed(),
            }),
        };

        self.release(path, flight);
        result
    }

    /// The cached copy, if it is at least as new as the origin's, or was downloaded by another
    /// request while we waited for the lock.
    async fn cached(
        &self,
        fetch: &Fetch<'_>,
        fetched_meanwhile: bool,
    ) -> Result<Option<FoundResource>> {
        let path = &fetch.resource.response_path;
        let Some(node) = fetch.cache.cached_node(path).await? else {
            return Ok(None);
        };

        if !fetched_meanwhile && node.last_modified < fetch.resource.last_modified {
            return Ok(None);
        }

        fetch.cache.unexpire(path).await?;

        let cached = path.with_repo(fetch.cache.key());
        Ok(Some(
            FoundResource::new(cached, node.last_modified, node.size).with_checksums(node.checksums),
        ))
    }

    fn acquire(&self, path: &RepoPath) -> Arc<InFlight> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.clone())
            .or_default()
            .clone()
    }

    fn release(&self, path: &RepoPath, flight: Arc<InFlight>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        // the table and this caller are the only holders left
        if Arc::strong_count(&flight) <= 2 {
            locks.remove(path);
        }
    }
}
