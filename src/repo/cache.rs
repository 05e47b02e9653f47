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

use std::time::Duration;

use chrono::Utc;

use super::{
    Diagnostics, Download, FindingKind, Repository, Request,
    local::{LocalLookup, LocalRepo},
};
use crate::{
    errors::{Error, Result},
    layout::RepoLayout,
    metadata::{FileNode, Node},
    path::RepoPath,
    policy::ChecksumPolicy,
    remote::RemoteResponse,
    resource::{FoundResource, RepoResource},
    store::ChunkSource,
};

/// Local copy of everything a remote repository fetched.
///
/// Entries older than the retrieval period are reported as unfound so that the remote
/// repository revalidates them against the origin.
#[derive(Debug)]
pub struct LocalCacheRepo {
    local: LocalRepo,
    retrieval_period: Duration,
}

impl LocalCacheRepo {
    /// Suffix appended to the key of the remote repository.
    pub const SUFFIX: &'static str = "-cache";

    /// Wrap a local repository whose key is the remote key followed by [`Self::SUFFIX`].
    pub fn new(local: LocalRepo, retrieval_period: Duration) -> Self {
        Self {
            local,
            retrieval_period,
        }
    }

    /// How long cached entries are served without revalidation.
    pub fn retrieval_period(&self) -> Duration {
        self.retrieval_period
    }

    fn is_expired(&self, node: &FileNode) -> bool {
        if self.retrieval_period.is_zero() {
            return true;
        }

        let age = Utc::now().signed_duration_since(node.last_updated);
        age.to_std()
            .map(|age| age >= self.retrieval_period)
            .unwrap_or(false)
    }

    /// Resolve a path, ignoring expiry.
    pub async fn get_info_including_expired(&self, request: &Request) -> Result<RepoResource> {
        let cached = request.with_path(request.path.with_repo(self.key()));
        let resource = self.local.get_info(&cached).await?;
        Ok(resource.requested_as(request.path.clone()))
    }

    /// The cached file node for a path, expired or not.
    pub async fn cached_node(&self, path: &RepoPath) -> Result<Option<FileNode>> {
        self.local.read_file(&path.with_repo(self.key())).await
    }

    /// Serve an expired entry again for a full retrieval period.
    pub async fn unexpire(&self, path: &RepoPath) -> Result<()> {
        let path = path.with_repo(self.key());
        let Some(mut node) = self.local.read_file(&path).await? else {
            return Ok(());
        };

        node.last_updated = Utc::now();
        self.local
            .nodes()
            .write_node(&path, Node::File(node))
            .await
            .map_err(Error::metadata(&path))?;

        tracing::debug!(repo = %self.key(), %path, "unexpired cached entry");
        Ok(())
    }

    /// Store content fetched from the origin.
    ///
    /// The checksums announced by the origin are verified according to `policy`. With
    /// [`ChecksumPolicy::Fail`] a mismatch aborts before the file becomes visible, otherwise it
    /// is recorded in `diagnostics`.
    pub async fn store(
        &self,
        path: &RepoPath,
        body: &mut (dyn ChunkSource + '_),
        response: &RemoteResponse,
        policy: ChecksumPolicy,
        diagnostics: &Diagnostics,
    ) -> Result<FoundResource> {
        let path = path.with_repo(self.key());
        let stored = self.local.store().insert(body).await?;

        let warnings = policy.verify(&path, &stored.checksums, &response.checksums)?;
        for mismatch in &warnings {
            tracing::warn!(
                repo = %self.key(),
                %path,
                checksum = %mismatch.checksum,
                expected = %mismatch.expected,
                actual = %mismatch.actual,
                "origin announced a different checksum"
            );
            diagnostics.record(
                FindingKind::ChecksumMismatch,
                format!(
                    "{path}: origin announced {} {} but content has {}",
                    mismatch.checksum, mismatch.expected, mismatch.actual
                ),
            );
        }

        let declared = match policy {
            ChecksumPolicy::IgnoreAndGenerate => Default::default(),
            _ => response.checksums.clone(),
        };
        let last_modified = response.last_modified.unwrap_or_else(Utc::now);

        let (node, _) = self
            .local
            .commit_file(&path, &stored, last_modified, declared)
            .await?;

        tracing::info!(
            repo = %self.key(),
            %path,
            digest = %node.digest,
            size = node.size,
            "cached remote content"
        );

        Ok(FoundResource::new(path, node.last_modified, node.size)
            .with_checksums(node.checksums))
    }

    /// The underlying local repository.
    pub fn local(&self) -> &LocalRepo {
        &self.local
    }
}

#[async_trait::async_trait]
impl Repository for LocalCacheRepo {
    fn key(&self) -> &str {
        self.local.key()
    }

    fn layout(&self) -> RepoLayout {
        self.local.layout()
    }

    fn is_local(&self) -> bool {
        true
    }

    fn is_cache(&self) -> bool {
        true
    }

    fn handles_releases(&self) -> bool {
        self.local.handles_releases()
    }

    fn handles_snapshots(&self) -> bool {
        self.local.handles_snapshots()
    }

    async fn get_info(&self, request: &Request) -> Result<RepoResource> {
        let cached = request.with_path(request.path.with_repo(self.key()));

        let resource = match self.local.lookup(&cached).await? {
            LocalLookup::Found { resolved, .. } if self.is_expired(&resolved.node) => {
                tracing::debug!(repo = %self.key(), path = %cached.path, "cached entry expired");
                super::nothing_found(&cached.path).into()
            }
            LocalLookup::Found { resolved, checksum } => {
                self.local.to_resource(&cached, &resolved, checksum)
            }
            LocalLookup::Unfound(unfound) => unfound.into(),
        };

        Ok(resource.requested_as(request.path.clone()))
    }

    async fn download(&self, _request: &Request, resource: &FoundResource) -> Result<Download> {
        self.local.open(resource).await
    }
}
