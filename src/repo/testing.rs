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

//! Test doubles and fixtures for repository tests.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use tempfile::TempDir;

use super::*;
use crate::{
    coordinator::DownloadCoordinator,
    metadata::{AnyNodeStore, InMemoryNodeStore},
    policy::{AllowAll, RepoPolicy},
    remote::RemoteClient,
    store::ContentStore,
};

/// Shared storage for repositories under test.
pub(crate) struct Fixture {
    pub(crate) nodes: AnyNodeStore,
    pub(crate) store: Arc<ContentStore>,
    pub(crate) coordinator: Arc<DownloadCoordinator>,
    _root: TempDir,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let store =
            ContentStore::open(root.path().join("filestore"), Duration::from_secs(5)).unwrap();

        Self {
            nodes: Arc::new(InMemoryNodeStore::new()),
            store: Arc::new(store),
            coordinator: Arc::new(DownloadCoordinator::new(Duration::from_secs(5))),
            _root: root,
        }
    }

    pub(crate) fn request(&self, repo: &str, path: &str) -> Request {
        Request::new(RepoPath::new(repo, path))
    }

    pub(crate) fn local(&self, key: &str) -> LocalRepo {
        self.local_with(key, RepoPolicy::default())
    }

    pub(crate) fn local_with(&self, key: &str, policy: RepoPolicy) -> LocalRepo {
        LocalRepo::new(
            key,
            RepoLayout::Maven2,
            policy,
            self.nodes.clone(),
            self.store.clone(),
            Arc::new(AllowAll),
        )
    }

    pub(crate) fn cache(&self, remote: &str, period: Duration) -> LocalCacheRepo {
        LocalCacheRepo::new(
            self.local(&format!("{remote}{}", LocalCacheRepo::SUFFIX)),
            period,
        )
    }

    pub(crate) fn remote(
        &self,
        key: &str,
        client: Arc<dyn RemoteClient>,
        settings: RemoteRepoSettings,
    ) -> RemoteRepo {
        self.remote_with_period(key, client, settings, Duration::from_secs(3600))
    }

    pub(crate) fn remote_with_period(
        &self,
        key: &str,
        client: Arc<dyn RemoteClient>,
        settings: RemoteRepoSettings,
        period: Duration,
    ) -> RemoteRepo {
        RemoteRepo::new(
            key,
            settings,
            client,
            Arc::new(AllowAll),
            self.coordinator.clone(),
        )
        .with_cache(self.cache(key, period))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Local,
    Cache,
    Remote,
}

/// A repository answering from a fixed table, counting lookups.
#[derive(Debug)]
pub(crate) struct Canned {
    key: String,
    kind: Kind,
    layout: RepoLayout,
    handles_releases: bool,
    handles_snapshots: bool,
    resources: HashMap<String, RepoResource>,
    content: HashMap<String, Bytes>,
    calls: AtomicUsize,
}

impl Canned {
    fn new(key: &str, kind: Kind) -> Self {
        Self {
            key: key.into(),
            kind,
            layout: RepoLayout::Maven2,
            handles_releases: true,
            handles_snapshots: true,
            resources: HashMap::new(),
            content: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn local(key: &str) -> Self {
        Self::new(key, Kind::Local)
    }

    pub(crate) fn cache(key: &str) -> Self {
        Self::new(key, Kind::Cache)
    }

    pub(crate) fn remote(key: &str) -> Self {
        Self::new(key, Kind::Remote)
    }

    pub(crate) fn with_layout(mut self, layout: RepoLayout) -> Self {
        self.layout = layout;
        self
    }

    pub(crate) fn snapshots_only(mut self) -> Self {
        self.handles_releases = false;
        self
    }

    fn found(
        mut self,
        path: &str,
        last_modified: DateTime<Utc>,
        content: Bytes,
        exact: bool,
    ) -> Self {
        let location = RepoPath::new(self.key.as_str(), path);
        let resource = FoundResource::new(location.clone(), last_modified, content.len() as u64)
            .with_response_path(location, exact);

        self.resources.insert(path.into(), resource.into());
        self.content.insert(path.into(), content);
        self
    }

    pub(crate) fn exact(self, path: &str, at: DateTime<Utc>, content: &'static [u8]) -> Self {
        self.found(path, at, Bytes::from_static(content), true)
    }

    pub(crate) fn exact_owned(self, path: &str, at: DateTime<Utc>, content: Vec<u8>) -> Self {
        self.found(path, at, Bytes::from(content), true)
    }

    pub(crate) fn closest(self, path: &str, at: DateTime<Utc>, content: &'static [u8]) -> Self {
        self.found(path, at, Bytes::from_static(content), false)
    }

    pub(crate) fn forbidden(mut self, path: &str) -> Self {
        let location = RepoPath::new(self.key.as_str(), path);
        self.resources.insert(
            path.into(),
            UnfoundResource::with_status(location, StatusCode::FORBIDDEN, "denied").into(),
        );
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Repository for Canned {
    fn key(&self) -> &str {
        &self.key
    }

    fn layout(&self) -> RepoLayout {
        self.layout
    }

    fn is_local(&self) -> bool {
        self.kind != Kind::Remote
    }

    fn is_cache(&self) -> bool {
        self.kind == Kind::Cache
    }

    fn handles_releases(&self) -> bool {
        self.handles_releases
    }

    fn handles_snapshots(&self) -> bool {
        self.handles_snapshots
    }

    async fn get_info(&self, request: &Request) -> Result<RepoResource> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let resource = self
            .resources
            .get(request.path.path())
            .cloned()
            .unwrap_or_else(|| nothing_found(&request.path).into());

        Ok(resource.requested_as(request.path.clone()))
    }

    async fn download(&self, _request: &Request, resource: &FoundResource) -> Result<Download> {
        let content = self
            .content
            .get(resource.response_path.path())
            .cloned()
            .ok_or_else(|| Error::Unavailable(nothing_found(&resource.response_path)))?;

        Ok(Download::inline(resource.clone(), content))
    }
}
