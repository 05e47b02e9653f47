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

use std::sync::Arc;

use chrono::Utc;
use reqwest::StatusCode;

use super::{Content, Download, FindingKind, LocalCacheRepo, Repository, Request};
use crate::{
    coordinator::{DownloadCoordinator, Fetch},
    errors::{Error, Result},
    layout::RepoLayout,
    path::RepoPath,
    policy::{self, ChecksumPolicy, PathPolicy, RepoPolicy},
    remote::{RemoteClient, RemoteError},
    resource::{FoundResource, RepoResource, UnfoundResource},
    retrieval_cache::{RetrievalCache, RetrievalCacheConfig},
};

/// Behavior of a [`RemoteRepo`].
#[derive(Clone, Debug, Default)]
pub struct RemoteRepoSettings {
    /// Artifact path layout of the origin
    pub layout: RepoLayout,
    /// Path rules
    pub policy: RepoPolicy,
    /// Never contact the origin
    pub offline: bool,
    /// Propagate origin failures instead of falling back to the cache
    pub hard_fail: bool,
    /// Treatment of checksums announced by the origin
    pub checksum_policy: ChecksumPolicy,
    /// Memo of origin failures
    pub failed_retrieval: RetrievalCacheConfig,
    /// Memo of origin misses
    pub missed_retrieval: RetrievalCacheConfig,
}

/// Mirror of a remote origin.
///
/// With a cache attached (see [`RemoteRepo::with_cache`]) fetched content is stored locally and
/// served from there until it expires. Without one every download is streamed from the origin.
#[derive(Debug)]
pub struct RemoteRepo {
    key: String,
    settings: RemoteRepoSettings,
    client: Arc<dyn RemoteClient>,
    gate: Arc<dyn PathPolicy>,
    coordinator: Arc<DownloadCoordinator>,
    cache: Option<Arc<LocalCacheRepo>>,
    failed: RetrievalCache,
    missed: RetrievalCache,
}

impl RemoteRepo {
    /// Create a remote repository that streams everything from `client`.
    pub fn new(
        key: impl Into<String>,
        settings: RemoteRepoSettings,
        client: Arc<dyn RemoteClient>,
        gate: Arc<dyn PathPolicy>,
        coordinator: Arc<DownloadCoordinator>,
    ) -> Self {
        Self {
            key: key.into(),
            failed: RetrievalCache::new("failed", settings.failed_retrieval),
            missed: RetrievalCache::new("missed", settings.missed_retrieval),
            settings,
            client,
            gate,
            coordinator,
            cache: None,
        }
    }

    /// Store fetched content in `cache`.
    pub fn with_cache(mut self, cache: LocalCacheRepo) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// The cache fetched content is stored in.
    pub fn cache(&self) -> Option<&Arc<LocalCacheRepo>> {
        self.cache.as_ref()
    }

    /// Whether fetched content is stored locally.
    pub fn stores_artifacts_locally(&self) -> bool {
        self.cache.is_some()
    }

    /// Forget memoized misses and failures.
    pub fn clear_retrieval_caches(&self) {
        self.failed.clear();
        self.missed.clear();
    }

    fn remember_failure(&self, path: &RepoPath, error: &RemoteError) {
        self.failed.store(UnfoundResource::with_status(
            path.clone(),
            error.status(),
            error.to_string(),
        ));
    }

    /// Serve an expired cache entry instead of an answer the origin could not give.
    async fn fallback(&self, request: &Request, unfound: UnfoundResource) -> Result<RepoResource> {
        let Some(cache) = &self.cache else {
            return Ok(unfound.into());
        };

        match cache.get_info_including_expired(request).await? {
            RepoResource::Found(found) => {
                tracing::debug!(
                    repo = %self.key,
                    path = %request.path,
                    reason = %unfound.reason,
                    "serving expired cache entry"
                );
                cache.unexpire(&request.path).await?;
                Ok(found.into())
            }
            RepoResource::Unfound(_) => Ok(unfound.into()),
        }
    }

    /// Checksum files are never requested from the origin: they are served from the checksums
    /// computed for cached content.
    async fn checksum_info(&self, request: &Request) -> Result<RepoResource> {
        match &self.cache {
            Some(cache) => cache.get_info(request).await,
            None => Ok(super::nothing_found(&request.path).into()),
        }
    }

    async fn probe(&self, request: &Request) -> Result<RepoResource> {
        let path = &request.path;

        let response = match self.client.head(path.path()).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(repo = %self.key, %path, %error, "remote probe failed");
                self.remember_failure(path, &error);
                request.diagnostics.record(
                    FindingKind::RemoteFailure,
                    format!("{}: {error}", self.key),
                );

                if self.settings.hard_fail {
                    return Err(Error::RemoteUnavailable {
                        repo: self.key.clone(),
                        source: error,
                    });
                }

                let unfound = UnfoundResource::with_status(
                    path.clone(),
                    error.status(),
                    error.to_string(),
                );
                return self.fallback(request, unfound).await;
            }
        };

        if !response.status.is_success() {
            let unfound =
                UnfoundResource::with_status(path.clone(), response.status, "not found in origin");
            self.missed.store(unfound.clone());
            return self.fallback(request, unfound).await;
        }

        let found = FoundResource::new(
            path.clone(),
            response.last_modified.unwrap_or_else(Utc::now),
            response.content_length.unwrap_or_default(),
        )
        .with_checksums(response.checksums);

        Ok(found.into())
    }

    async fn stream(&self, resource: &FoundResource) -> Result<Download> {
        let path = &resource.response_path;

        let download = self.client.get(path.path()).await.map_err(|source| {
            self.remember_failure(path, &source);
            Error::RemoteUnavailable {
                repo: self.key.clone(),
                source,
            }
        })?;

        Ok(Download {
            resource: resource.clone(),
            content: Content::Stream(download.body),
        })
    }

    async fn download_to_cache(
        &self,
        request: &Request,
        cache: &LocalCacheRepo,
        resource: &FoundResource,
    ) -> Result<FoundResource> {
        let path = &resource.response_path;

        let download = self
            .client
            .get(path.path())
            .await
            .map_err(|source| Error::RemoteUnavailable {
                repo: self.key.clone(),
                source,
            })?;

        tracing::info!(repo = %self.key, %path, "downloading from origin");

        let mut body = download.body;
        cache
            .store(
                path,
                &mut *body,
                &download.response,
                self.settings.checksum_policy,
                &request.diagnostics,
            )
            .await
    }
}

#[async_trait::async_trait]
impl Repository for RemoteRepo {
    fn key(&self) -> &str {
        &self.key
    }

    fn layout(&self) -> RepoLayout {
        self.settings.layout
    }

    fn is_local(&self) -> bool {
        false
    }

    fn handles_releases(&self) -> bool {
        self.settings.policy.handles_releases
    }

    fn handles_snapshots(&self) -> bool {
        self.settings.policy.handles_snapshots
    }

    fn local_cache(&self) -> Option<Arc<dyn Repository>> {
        self.cache
            .clone()
            .map(|cache| cache as Arc<dyn Repository>)
    }

    async fn get_info(&self, request: &Request) -> Result<RepoResource> {
        let path = &request.path;

        if let Some(rejected) = self.settings.policy.reject(path) {
            return Ok(rejected.into());
        }
        if let Some(denied) = policy::authorize(self.gate.as_ref(), path, false) {
            return Ok(denied.into());
        }

        if request.is_checksum() {
            return self.checksum_info(request).await;
        }

        let memoized = self.failed.lookup(path).or_else(|| self.missed.lookup(path));
        if let Some(unfound) = memoized {
            return self.fallback(request, unfound).await;
        }

        if let Some(cache) = &self.cache {
            let cached = cache.get_info(request).await?;
            if cached.is_found() {
                return Ok(cached);
            }
        }

        if self.settings.offline {
            let unfound = UnfoundResource::not_found(path.clone(), "repository is offline");
            return self.fallback(request, unfound).await;
        }

        self.probe(request).await
    }

    async fn download(&self, request: &Request, resource: &FoundResource) -> Result<Download> {
        if let Some(denied) = policy::authorize(self.gate.as_ref(), &resource.response_path, true) {
            return Err(Error::Unavailable(denied));
        }

        let Some(cache) = &self.cache else {
            return self.stream(resource).await;
        };

        if resource.response_path.repo() == cache.key() {
            return cache.download(request, resource).await;
        }

        let fetch = Fetch {
            resource,
            cache: cache.as_ref(),
        };
        let cached = self
            .coordinator
            .fetch(fetch, || self.download_to_cache(request, cache, resource))
            .await
            .inspect_err(|error| {
                if !error.is_fatal() {
                    tracing::warn!(
                        repo = %self.key,
                        path = %resource.response_path,
                        %error,
                        "download failed"
                    );
                    self.failed.store(UnfoundResource::with_status(
                        resource.response_path.clone(),
                        StatusCode::BAD_GATEWAY,
                        error.to_string(),
                    ));
                }
            })?;

        let mut download = cache.download(request, &cached).await?;
        download.resource = cached.requested_as(resource.path.clone());
        Ok(download)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        checksum::ChecksumType,
        remote::scripted::{Scripted, ScriptedRemote},
        repo::testing::Fixture,
    };

    fn jar() -> RepoPath {
        RepoPath::new("central", "com/acme/foo/1.0/foo-1.0.jar")
    }

    #[tokio::test]
    async fn fetches_once_and_serves_from_cache() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        origin.serve(jar().path(), b"foo", Utc::now() - chrono::Duration::days(1));
        let remote = fixture.remote("central", origin.clone(), RemoteRepoSettings::default());

        let request = Request::new(jar());
        let resource = remote.get_info(&request).await.unwrap().into_found().unwrap();
        assert_eq!(resource.response_path.repo(), "central");

        let content = remote
            .download(&request, &resource)
            .await
            .unwrap()
            .read_to_bytes()
            .await
            .unwrap();
        assert_eq!(content, Bytes::from_static(b"foo"));
        assert_eq!(origin.gets(), 1);

        // the second request is answered by the cache without probing
        let heads = origin.heads();
        let cached = remote.get_info(&request).await.unwrap().into_found().unwrap();
        assert_eq!(cached.response_path.repo(), "central-cache");
        assert_eq!(origin.heads(), heads);
    }

    #[tokio::test]
    async fn memoizes_misses() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        let remote = fixture.remote("central", origin.clone(), RemoteRepoSettings::default());
        let request = Request::new(jar());

        assert!(!remote.get_info(&request).await.unwrap().is_found());
        assert!(!remote.get_info(&request).await.unwrap().is_found());
        assert_eq!(origin.heads(), 1);

        remote.clear_retrieval_caches();
        assert!(!remote.get_info(&request).await.unwrap().is_found());
        assert_eq!(origin.heads(), 2);
    }

    #[tokio::test]
    async fn swallows_failures_unless_hard_failing() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        origin.script(jar().path(), Scripted::Failure(StatusCode::INTERNAL_SERVER_ERROR));

        let soft = fixture.remote("central", origin.clone(), RemoteRepoSettings::default());
        let request = Request::new(jar());
        let unfound = soft.get_info(&request).await.unwrap();
        assert!(!unfound.is_found());
        assert!(request.diagnostics.contains(FindingKind::RemoteFailure));

        // the failure is memoized, the origin is not asked again
        let again = Request::new(jar());
        assert!(!soft.get_info(&again).await.unwrap().is_found());
        assert!(!again.diagnostics.contains(FindingKind::RemoteFailure));
        assert_eq!((origin.heads(), origin.gets()), (1, 0));

        let hard = fixture.remote(
            "hard",
            origin,
            RemoteRepoSettings {
                hard_fail: true,
                ..Default::default()
            },
        );
        let request = Request::new(RepoPath::new("hard", jar().path()));
        assert!(matches!(
            hard.get_info(&request).await,
            Err(Error::RemoteUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn falls_back_to_expired_entries() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        origin.serve(jar().path(), b"foo", Utc::now() - chrono::Duration::days(1));

        let remote = fixture.remote_with_period(
            "central",
            origin.clone(),
            RemoteRepoSettings::default(),
            Duration::ZERO,
        );
        let request = Request::new(jar());
        let resource = remote.get_info(&request).await.unwrap().into_found().unwrap();
        remote.download(&request, &resource).await.unwrap();

        origin.script(jar().path(), Scripted::Failure(StatusCode::BAD_GATEWAY));
        let fallback = remote.get_info(&request).await.unwrap().into_found().unwrap();
        assert_eq!(fallback.response_path.repo(), "central-cache");
    }

    #[tokio::test]
    async fn offline_repositories_never_contact_the_origin() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        origin.serve(jar().path(), b"foo", Utc::now());

        let remote = fixture.remote(
            "central",
            origin.clone(),
            RemoteRepoSettings {
                offline: true,
                ..Default::default()
            },
        );

        assert!(!remote.get_info(&Request::new(jar())).await.unwrap().is_found());
        assert_eq!(origin.heads(), 0);
    }

    #[tokio::test]
    async fn serves_checksums_of_cached_content_only() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        origin.serve(jar().path(), b"foo", Utc::now());
        let remote = fixture.remote("central", origin.clone(), RemoteRepoSettings::default());

        let sha1 = Request::new(jar().checksum_path(ChecksumType::Sha1));
        assert!(!remote.get_info(&sha1).await.unwrap().is_found());
        assert_eq!(origin.heads(), 0);

        let request = Request::new(jar());
        let resource = remote.get_info(&request).await.unwrap().into_found().unwrap();
        remote.download(&request, &resource).await.unwrap();

        let resource = remote.get_info(&sha1).await.unwrap().into_found().unwrap();
        assert_eq!(
            resource.content,
            Some(Bytes::from(ChecksumType::Sha1.digest(b"foo").to_hex()))
        );
    }

    #[tokio::test]
    async fn streams_without_a_cache() {
        let origin = Arc::new(ScriptedRemote::new());
        origin.serve(jar().path(), b"foo", Utc::now());
        let remote = RemoteRepo::new(
            "central",
            RemoteRepoSettings::default(),
            origin.clone(),
            Arc::new(crate::policy::AllowAll),
            Arc::default(),
        );
        assert!(!remote.stores_artifacts_locally());

        let request = Request::new(jar());
        let resource = remote.get_info(&request).await.unwrap().into_found().unwrap();
        let download = remote.download(&request, &resource).await.unwrap();
        assert!(matches!(download.content, Content::Stream(_)));
        assert_eq!(download.read_to_bytes().await.unwrap(), Bytes::from_static(b"foo"));
    }

    #[tokio::test]
    async fn broken_streams_leave_nothing_behind() {
        let fixture = Fixture::new();
        let origin = Arc::new(ScriptedRemote::new());
        origin.script(
            jar().path(),
            Scripted::BrokenStream(Bytes::from_static(b"partial")),
        );
        let remote = fixture.remote("central", origin.clone(), RemoteRepoSettings::default());

        let request = Request::new(jar());
        let resource = remote.get_info(&request).await.unwrap().into_found().unwrap();
        assert!(remote.download(&request, &resource).await.is_err());

        let cache = remote.cache().unwrap();
        assert!(cache.cached_node(&jar()).await.unwrap().is_none());

        // the failure is memoized
        let heads = origin.heads();
        assert!(!remote.get_info(&request).await.unwrap().is_found());
        assert_eq!(origin.heads(), heads);
    }
}
