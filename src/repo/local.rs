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

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::{Content, Download, FindingKind, Repository, Request};
use crate::{
    checksum::{ChecksumMismatch, ChecksumType, Checksums},
    errors::{Error, Result},
    layout::{self, RepoLayout},
    metadata::{AnyNodeStore, FileNode, Node},
    path::RepoPath,
    policy::{self, PathPolicy, RepoPolicy},
    resource::{FoundResource, RepoResource, UnfoundResource},
    store::{ChunkSource, ContentStore, StoredContent},
};

/// Outcome of storing a file through [`LocalRepo::create_or_get_file`] or
/// [`LocalRepo::deploy`].
#[derive(Clone, Debug, PartialEq)]
pub struct ImportReport {
    /// The stored file
    pub resource: FoundResource,
    /// Declared checksums that did not match the content
    pub warnings: Vec<ChecksumMismatch>,
    /// Whether the content store already held the content
    pub reused: bool,
    /// Whether an existing file with different content was replaced
    pub replaced: bool,
}

/// A repository whose content is deployed to this server.
#[derive(Debug)]
pub struct LocalRepo {
    key: String,
    layout: RepoLayout,
    policy: RepoPolicy,
    nodes: AnyNodeStore,
    store: Arc<ContentStore>,
    gate: Arc<dyn PathPolicy>,
}

/// A file node resolved for a request.
pub(crate) struct Resolved {
    pub(crate) path: RepoPath,
    pub(crate) node: FileNode,
    pub(crate) exact: bool,
}

impl LocalRepo {
    /// Create a local repository.
    pub fn new(
        key: impl Into<String>,
        layout: RepoLayout,
        policy: RepoPolicy,
        nodes: AnyNodeStore,
        store: Arc<ContentStore>,
        gate: Arc<dyn PathPolicy>,
    ) -> Self {
        Self {
            key: key.into(),
            layout,
            policy,
            nodes,
            store,
            gate,
        }
    }

    /// Path rules of this repository.
    pub fn policy(&self) -> &RepoPolicy {
        &self.policy
    }

    pub(crate) fn nodes(&self) -> &AnyNodeStore {
        &self.nodes
    }

    pub(crate) fn store(&self) -> &ContentStore {
        &self.store
    }

    pub(crate) async fn read_node(&self, path: &RepoPath) -> Result<Option<Node>> {
        self.nodes
            .read_node(path)
            .await
            .map_err(Error::metadata(path))
    }

    pub(crate) async fn read_file(&self, path: &RepoPath) -> Result<Option<FileNode>> {
        Ok(match self.read_node(path).await? {
            Some(Node::File(file)) => Some(file),
            _ => None,
        })
    }

    /// Find the file serving `path`, resolving non-unique snapshots to the latest unique one.
    pub(crate) async fn resolve(&self, path: &RepoPath) -> Result<Option<Resolved>> {
        if let Some(node) = self.read_file(path).await? {
            return Ok(Some(Resolved {
                path: path.clone(),
                node,
                exact: true,
            }));
        }

        let Some(info) = self.layout.parse(path.path()) else {
            return Ok(None);
        };
        if !info.is_non_unique_snapshot() {
            return Ok(None);
        }
        let Some(folder) = path.parent() else {
            return Ok(None);
        };

        let children = self
            .nodes
            .list_children(&folder)
            .await
            .map_err(Error::metadata(&folder))?;

        let latest = children
            .into_iter()
            .filter_map(|(child, node)| {
                let file = match node {
                    Node::File(file) => file,
                    Node::Folder { .. } => return None,
                };
                let candidate = self.layout.parse(child.path())?;
                let revision = candidate.file_integration_revision.clone()?;

                let unique = candidate.same_artifact(&info)
                    && revision != layout::SNAPSHOT
                    && layout::is_integration_revision(&revision);

                unique.then_some((revision, child, file))
            })
            .max_by(|(a, ..), (b, ..)| layout::compare_unique_revisions(a, b));

        Ok(latest.map(|(revision, child, node)| {
            tracing::debug!(repo = %self.key, %path, %revision, "resolved non-unique snapshot");
            Resolved {
                path: child,
                node,
                exact: false,
            }
        }))
    }

    /// Resolution shared with the cache repository, which adds expiry on top.
    pub(crate) async fn lookup(&self, request: &Request) -> Result<LocalLookup> {
        let path = &request.path;

        if let Some(rejected) = self.policy.reject(path) {
            return Ok(LocalLookup::Unfound(rejected));
        }
        if let Some(denied) = policy::authorize(self.gate.as_ref(), path, false) {
            return Ok(LocalLookup::Unfound(denied));
        }

        let (target, checksum) = match path.checksum_target() {
            Some((target, checksum)) => (target, Some(checksum)),
            None => (path.clone(), None),
        };

        let Some(resolved) = self.resolve(&target).await? else {
            return Ok(LocalLookup::Unfound(super::nothing_found(path)));
        };

        Ok(LocalLookup::Found { resolved, checksum })
    }

    pub(crate) fn to_resource(
        &self,
        request: &Request,
        resolved: &Resolved,
        checksum: Option<ChecksumType>,
    ) -> RepoResource {
        let path = &request.path;

        let Some(checksum) = checksum else {
            return FoundResource::new(
                path.clone(),
                resolved.node.last_modified,
                resolved.node.size,
            )
            .with_checksums(resolved.node.checksums.clone())
            .with_response_path(resolved.path.clone(), resolved.exact)
            .into();
        };

        match resolved.node.checksums.get(checksum) {
            Some(value) => FoundResource::inline(
                path.clone(),
                resolved.node.last_modified,
                Bytes::from(value.to_owned()),
            )
            .with_response_path(resolved.path.checksum_path(checksum), resolved.exact)
            .into(),
            None => super::nothing_found(path).into(),
        }
    }

    /// Open the body of a resolved resource.
    pub(crate) async fn open(&self, resource: &FoundResource) -> Result<Download> {
        if let Some(content) = &resource.content {
            return Ok(Download::inline(resource.clone(), content.clone()));
        }

        let path = &resource.response_path;
        if let Some(denied) = policy::authorize(self.gate.as_ref(), path, true) {
            return Err(Error::Unavailable(denied));
        }

        let node = self
            .read_file(path)
            .await?
            .ok_or_else(|| Error::Unavailable(super::nothing_found(path)))?;

        let reader = self.store.open_blob(&node.digest)?;

        Ok(Download {
            resource: resource.clone(),
            content: Content::Blob(reader),
        })
    }

    /// Create every missing folder from the repository root down to `folder`.
    pub async fn create_or_get_folder(&self, folder: &RepoPath) -> Result<bool> {
        let mut missing = Vec::new();
        let mut current = Some(folder.clone());

        while let Some(path) = current {
            if path.is_root() {
                break;
            }
            match self.read_node(&path).await? {
                Some(Node::Folder { .. }) => break,
                Some(Node::File(_)) => {
                    return Err(Error::Metadata {
                        target: path.to_string(),
                        source: crate::metadata::NodeStoreError::Conflict(path),
                    });
                }
                None => {}
            }
            current = path.parent();
            missing.push(path);
        }

        let created = !missing.is_empty();
        for path in missing.into_iter().rev() {
            self.nodes
                .write_node(&path, Node::Folder { created: Utc::now() })
                .await
                .map_err(Error::metadata(&path))?;
        }

        Ok(created)
    }

    /// Record stored content as the file at `path`.
    pub(crate) async fn commit_file(
        &self,
        path: &RepoPath,
        stored: &StoredContent,
        last_modified: DateTime<Utc>,
        declared: Checksums,
    ) -> Result<(FileNode, Option<FileNode>)> {
        if let Some(parent) = path.parent() {
            self.create_or_get_folder(&parent).await?;
        }

        let previous = self.read_file(path).await?;
        let now = Utc::now();

        let node = FileNode {
            digest: stored.digest.clone(),
            size: stored.length,
            created: previous.as_ref().map_or(now, |previous| previous.created),
            last_modified,
            last_updated: now,
            checksums: stored.checksums.clone(),
            declared,
        };

        self.nodes
            .write_node(path, Node::File(node.clone()))
            .await
            .map_err(Error::metadata(path))?;

        Ok((node, previous))
    }

    /// Store content at `path` outside the normal download path.
    ///
    /// Declared checksums that do not match the content are reported but do not abort the
    /// import. An existing file with identical content is left untouched.
    pub async fn create_or_get_file(
        &self,
        path: &RepoPath,
        source: &mut (dyn ChunkSource + '_),
        declared: Checksums,
    ) -> Result<ImportReport> {
        let stored = self.store.insert(source).await?;
        let warnings = stored.checksums.mismatches(&declared);

        for mismatch in &warnings {
            tracing::warn!(
                repo = %self.key,
                %path,
                checksum = %mismatch.checksum,
                expected = %mismatch.expected,
                actual = %mismatch.actual,
                "declared checksum does not match content"
            );
        }

        if let Some(existing) = self.read_file(path).await? {
            if existing.digest == stored.digest {
                return Ok(ImportReport {
                    resource: self.found(path, &existing),
                    warnings,
                    reused: true,
                    replaced: false,
                });
            }
        }

        let (node, previous) = self
            .commit_file(path, &stored, Utc::now(), declared)
            .await?;

        tracing::info!(
            repo = %self.key,
            %path,
            digest = %node.digest,
            size = node.size,
            "stored file"
        );

        Ok(ImportReport {
            resource: self.found(path, &node),
            warnings,
            reused: stored.reused,
            replaced: previous.is_some(),
        })
    }

    fn found(&self, path: &RepoPath, node: &FileNode) -> FoundResource {
        FoundResource::new(path.clone(), node.last_modified, node.size)
            .with_checksums(node.checksums.clone())
    }

    /// Deploy content, honoring the repository policy.
    ///
    /// Deploying a checksum file (`foo.jar.sha1`) attaches the checksum to the existing file
    /// instead of storing a separate file.
    pub async fn deploy(
        &self,
        request: &Request,
        source: &mut (dyn ChunkSource + '_),
        declared: Checksums,
    ) -> Result<ImportReport> {
        let path = &request.path;
        self.policy.check(path)?;

        if let Some(denied) = policy::authorize(self.gate.as_ref(), path, false) {
            return Err(Error::Unavailable(denied));
        }

        let report = match path.checksum_target() {
            Some((target, checksum)) => self.attach_checksum(&target, checksum, source).await?,
            None => self.create_or_get_file(path, source, declared).await?,
        };

        for warning in &report.warnings {
            request.diagnostics.record(
                FindingKind::ChecksumMismatch,
                format!(
                    "{path}: declared {} {} but content has {}",
                    warning.checksum, warning.expected, warning.actual
                ),
            );
        }

        Ok(report)
    }

    async fn attach_checksum(
        &self,
        target: &RepoPath,
        checksum: ChecksumType,
        source: &mut (dyn ChunkSource + '_),
    ) -> Result<ImportReport> {
        let mut content = Vec::new();
        while let Some(chunk) = source.next_chunk().await? {
            content.extend_from_slice(&chunk);
        }

        // checksum files may carry the file name after the digest
        let text = String::from_utf8_lossy(&content);
        let declared = text.split_whitespace().next().unwrap_or_default();

        let mut node = self
            .read_file(target)
            .await?
            .ok_or_else(|| Error::Unavailable(super::nothing_found(target)))?;
        node.declared.insert(checksum, declared);

        let warnings = node
            .checksums
            .mismatches(&Checksums::default().with(checksum, declared));

        self.nodes
            .write_node(target, Node::File(node.clone()))
            .await
            .map_err(Error::metadata(target))?;

        Ok(ImportReport {
            resource: self.found(target, &node),
            warnings,
            reused: true,
            replaced: false,
        })
    }

    /// Delete a file or folder. The content is reclaimed by garbage collection.
    pub async fn delete(&self, request: &Request) -> Result<bool> {
        let path = &request.path;
        self.policy.check(path)?;

        if let Some(denied) = policy::authorize(self.gate.as_ref(), path, false) {
            return Err(Error::Unavailable(denied));
        }

        let deleted = self
            .nodes
            .delete_node(path)
            .await
            .map_err(Error::metadata(path))?;

        if deleted {
            tracing::info!(repo = %self.key, %path, "deleted");
        }

        Ok(deleted)
    }
}

/// Result of [`LocalRepo::lookup`].
pub(crate) enum LocalLookup {
    Found {
        resolved: Resolved,
        checksum: Option<ChecksumType>,
    },
    Unfound(UnfoundResource),
}

#[async_trait::async_trait]
impl Repository for LocalRepo {
    fn key(&self) -> &str {
        &self.key
    }

    fn layout(&self) -> RepoLayout {
        self.layout
    }

    fn is_local(&self) -> bool {
        true
    }

    fn handles_releases(&self) -> bool {
        self.policy.handles_releases
    }

    fn handles_snapshots(&self) -> bool {
        self.policy.handles_snapshots
    }

    async fn get_info(&self, request: &Request) -> Result<RepoResource> {
        match self.lookup(request).await? {
            LocalLookup::Found { resolved, checksum } => {
                Ok(self.to_resource(request, &resolved, checksum))
            }
            LocalLookup::Unfound(unfound) => Ok(unfound.into()),
        }
    }

    async fn download(&self, _request: &Request, resource: &FoundResource) -> Result<Download> {
        self.open(resource).await
    }
}
