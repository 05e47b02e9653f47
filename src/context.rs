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

use crate::{
    config::{Config, MetadataBackend, PolicyConfig, RemoteConfig},
    coordinator::DownloadCoordinator,
    errors::Result,
    layout::RepoLayout,
    metadata::{AnyNodeStore, FilesystemNodeStore, InMemoryNodeStore},
    policy::{AllowAll, PathPolicy},
    remote::HttpRemote,
    repo::{
        LocalCacheRepo, LocalRepo, RemoteRepo, RemoteRepoSettings, Repositories, VirtualRepo,
        VirtualRepoSettings,
    },
    store::{ContentStore, GcReport},
};

/// Shared context of a `depot` instance: storage, repositories and their collaborators.
#[derive(Debug)]
pub struct Context {
    config: Config,
    /// Content store, holds every blob exactly once.
    store: Arc<ContentStore>,
    /// Metadata nodes of all local and cache repositories.
    nodes: AnyNodeStore,
    /// Single-flight guard shared by all remote repositories.
    coordinator: Arc<DownloadCoordinator>,
    repositories: Repositories,
}

impl Context {
    /// Configuration the context was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Content store
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Metadata store
    pub fn nodes(&self) -> &AnyNodeStore {
        &self.nodes
    }

    /// Download coordinator
    pub fn coordinator(&self) -> &Arc<DownloadCoordinator> {
        &self.coordinator
    }

    /// All configured repositories
    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    /// Create a context from a validated configuration.
    ///
    /// This opens the content store below the storage root, indexing blobs already on disk.
    pub fn open(config: Config) -> Result<Arc<Self>> {
        let root = &config.storage.root;
        let lock_timeout = config.gc.lock_timeout();

        let store = Arc::new(ContentStore::open(root, lock_timeout)?);
        let nodes: AnyNodeStore = match config.storage.metadata {
            MetadataBackend::Filesystem => Arc::new(FilesystemNodeStore::new(root.join("metadata"))),
            MetadataBackend::Memory => Arc::new(InMemoryNodeStore::new()),
        };
        let coordinator = Arc::new(DownloadCoordinator::new(lock_timeout));

        let mut context = Self {
            store,
            nodes,
            coordinator,
            repositories: Repositories::new(),
            config: Config::default(),
        };
        context.register(&config)?;
        context.config = config;

        tracing::debug!(
            repositories = context.repositories.keys().count(),
            "initialized context"
        );

        Ok(Arc::new(context))
    }

    fn register(&mut self, config: &Config) -> Result<()> {
        let gate: Arc<dyn PathPolicy> = Arc::new(AllowAll);

        for local in &config.local {
            let repo = self.local_repo(&local.key, local.layout, &local.policy, gate.clone())?;
            self.repositories.add_local(repo)?;
        }

        for remote in &config.remote {
            let repo = self.remote_repo(remote, gate.clone())?;
            self.repositories.add_remote(repo)?;
        }

        for repo in &config.virtuals {
            let (repositories, nested) = config.members(repo);
            let settings = VirtualRepoSettings {
                layout: repo.layout,
                repositories,
                nested,
                peer_requests_fetch_remote: repo.peer_requests_fetch_remote,
                hide_unauthorized_resources: repo.hide_unauthorized_resources,
            };

            self.repositories
                .add_virtual(VirtualRepo::new(&repo.key, settings, gate.clone()))?;
        }

        Ok(())
    }

    fn local_repo(
        &self,
        key: &str,
        layout: RepoLayout,
        policy: &PolicyConfig,
        gate: Arc<dyn PathPolicy>,
    ) -> Result<LocalRepo> {
        Ok(LocalRepo::new(
            key,
            layout,
            policy.to_policy()?,
            self.nodes.clone(),
            self.store.clone(),
            gate,
        ))
    }

    fn remote_repo(&self, remote: &RemoteConfig, gate: Arc<dyn PathPolicy>) -> Result<RemoteRepo> {
        let client = HttpRemote::new(&remote.key, remote.url.clone(), remote.connection())?;

        let settings = RemoteRepoSettings {
            layout: remote.layout,
            policy: remote.policy.to_policy()?,
            offline: remote.offline,
            hard_fail: remote.hard_fail,
            checksum_policy: remote.checksum_policy,
            failed_retrieval: remote.failed_retrieval(),
            missed_retrieval: remote.missed_retrieval(),
        };

        let repo = RemoteRepo::new(
            &remote.key,
            settings,
            Arc::new(client),
            gate.clone(),
            self.coordinator.clone(),
        );

        if !remote.store_artifacts_locally {
            return Ok(repo);
        }

        let cache = self.local_repo(&remote.cache_key(), remote.layout, &remote.policy, gate)?;
        Ok(repo.with_cache(LocalCacheRepo::new(cache, remote.retrieval_cache_period())))
    }

    /// Run `passes` garbage collection passes over the content store.
    ///
    /// Unreferenced content survives the first pass it is seen idle in, so two passes are
    /// needed to reclaim it.
    pub async fn collect_garbage(&self, passes: usize) -> Result<Vec<GcReport>> {
        let mut reports = Vec::with_capacity(passes);

        for pass in 1..=passes {
            tracing::debug!(pass, "starting garbage collection pass");
            let report = self.store.collect_garbage(self.nodes.as_ref()).await?;
            reports.push(report);
        }

        Ok(reports)
    }
}
