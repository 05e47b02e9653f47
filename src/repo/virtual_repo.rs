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

use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;

use super::{FindingKind, Repositories, Repository, Request};
use crate::{
    checksum::ChecksumHasher,
    errors::{Error, Result},
    layout::{self, RepoLayout},
    maven_metadata::{MavenMetadata, MetadataAccumulator},
    path::{RepoPath, RequestKind},
    policy::{self, PathPolicy},
    resource::{FoundResource, RepoResource, UnfoundResource},
};

/// Members and behavior of a [`VirtualRepo`].
#[derive(Clone, Debug, Default)]
pub struct VirtualRepoSettings {
    /// Artifact path layout exposed to clients
    pub layout: RepoLayout,
    /// Keys of real member repositories, in search order
    pub repositories: Vec<String>,
    /// Keys of nested virtual repositories, searched after the real members
    pub nested: Vec<String>,
    /// Let requests coming from peer servers trigger remote fetches
    pub peer_requests_fetch_remote: bool,
    /// Report forbidden members as plain absence
    pub hide_unauthorized_resources: bool,
}

/// Aggregation of real and nested virtual repositories under a single key.
#[derive(Debug)]
pub struct VirtualRepo {
    key: String,
    settings: VirtualRepoSettings,
    gate: Arc<dyn PathPolicy>,
}

/// Forbidden answers seen while searching, surfaced when nothing was found.
#[derive(Default)]
struct Rejections(Option<UnfoundResource>);

impl Rejections {
    fn observe(&mut self, unfound: UnfoundResource) {
        if self.0.is_none() && unfound.is_forbidden() {
            self.0 = Some(unfound);
        }
    }
}

impl VirtualRepo {
    /// Create a virtual repository.
    pub fn new(
        key: impl Into<String>,
        settings: VirtualRepoSettings,
        gate: Arc<dyn PathPolicy>,
    ) -> Self {
        Self {
            key: key.into(),
            settings,
            gate,
        }
    }

    /// Unique key of the repository.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Artifact path layout exposed to clients.
    pub fn layout(&self) -> RepoLayout {
        self.settings.layout
    }

    /// Members and behavior.
    pub fn settings(&self) -> &VirtualRepoSettings {
        &self.settings
    }

    /// Flatten the member graph into the list of real repositories to search.
    ///
    /// Local repositories come first, then caches, then remote repositories. Each repository
    /// appears at most once. Nested virtual repositories seen twice are not traversed again.
    pub fn assemble_search_repositories(
        &self,
        arena: &Repositories,
        request: &Request,
    ) -> Vec<Arc<dyn Repository>> {
        let mut visited = HashSet::new();
        let mut members = Vec::new();
        self.collect(arena, request, &mut visited, &mut members);

        let fetch_remote = !request.from_peer || self.settings.peer_requests_fetch_remote;

        let mut locals = Vec::new();
        let mut caches = Vec::new();
        let mut remotes = Vec::new();
        for member in members {
            if member.is_cache() {
                caches.push(member);
            } else if member.is_local() {
                locals.push(member);
            } else {
                caches.extend(member.local_cache());
                if fetch_remote {
                    remotes.push(member);
                }
            }
        }

        let mut seen = HashSet::new();
        locals
            .into_iter()
            .chain(caches)
            .chain(remotes)
            .filter(|member| seen.insert(member.key().to_owned()))
            .collect()
    }

    fn collect(
        &self,
        arena: &Repositories,
        request: &Request,
        visited: &mut HashSet<String>,
        members: &mut Vec<Arc<dyn Repository>>,
    ) {
        if !visited.insert(self.key.clone()) {
            let cycle = Error::ConfigurationCycle {
                key: self.key.clone(),
            };
            tracing::warn!(repo = %self.key, "{cycle}");
            request
                .diagnostics
                .record(FindingKind::ConfigurationCycle, cycle.to_string());
            return;
        }

        for key in &self.settings.repositories {
            match arena.get(key) {
                Some(member) => members.push(member),
                None => self.unknown_member(request, key),
            }
        }

        for key in &self.settings.nested {
            match arena.virtual_repo(key) {
                Some(nested) => nested.collect(arena, request, visited, members),
                None => self.unknown_member(request, key),
            }
        }
    }

    fn unknown_member(&self, request: &Request, key: &str) {
        tracing::warn!(repo = %self.key, member = key, "unknown member repository");
        request.diagnostics.record(
            FindingKind::UnknownMember,
            format!("`{}` aggregates unknown repository `{key}`", self.key),
        );
    }

    /// The request as seen by a member: re-keyed and translated to the member's layout.
    fn member_request(&self, request: &Request, member: &dyn Repository) -> Request {
        let translated = layout::translate(request.path.path(), self.layout(), member.layout());
        request.with_path(RepoPath::new(member.key(), translated))
    }

    fn nothing_found(&self, path: &RepoPath, rejections: Rejections) -> RepoResource {
        match rejections.0 {
            Some(forbidden) if !self.settings.hide_unauthorized_resources => {
                forbidden.requested_as(path.clone()).into()
            }
            _ => super::nothing_found(path).into(),
        }
    }

    /// Resolve a path against the members, picking the strategy from the shape of the path.
    pub async fn get_info(&self, arena: &Repositories, request: &Request) -> Result<RepoResource> {
        let path = &request.path;

        if let Some(denied) = policy::authorize(self.gate.as_ref(), path, false) {
            return Ok(denied.into());
        }

        let members = self.assemble_search_repositories(arena, request);
        let kind = path.kind();

        tracing::debug!(
            repo = %self.key,
            %path,
            ?kind,
            members = members.len(),
            "resolving in virtual repository"
        );

        match kind {
            RequestKind::Standard => self.standard(request, &members).await,
            RequestKind::Snapshot => self.snapshot(request, &members).await,
            RequestKind::Metadata => self.metadata(request, &members).await,
        }
    }

    /// First exact match wins, otherwise the first closest match.
    async fn standard(
        &self,
        request: &Request,
        members: &[Arc<dyn Repository>],
    ) -> Result<RepoResource> {
        let path = &request.path;
        let mut closest: Option<FoundResource> = None;
        let mut rejections = Rejections::default();

        for member in members {
            if !member.handles_releases() && !request.is_checksum() {
                continue;
            }

            match member.get_info(&self.member_request(request, member.as_ref())).await? {
                RepoResource::Found(found) if found.exact_match => {
                    tracing::debug!(repo = %self.key, %path, member = member.key(), "exact match");
                    return Ok(found.requested_as(path.clone()).into());
                }
                RepoResource::Found(found) => {
                    closest.get_or_insert(found);
                }
                RepoResource::Unfound(unfound) => rejections.observe(unfound),
            }
        }

        Ok(match closest {
            Some(found) => found.requested_as(path.clone()).into(),
            None => self.nothing_found(path, rejections),
        })
    }

    /// The most recently modified match wins, exact matches before closest ones.
    async fn snapshot(
        &self,
        request: &Request,
        members: &[Arc<dyn Repository>],
    ) -> Result<RepoResource> {
        let path = &request.path;
        let mut best: Option<FoundResource> = None;
        let mut claims = Vec::new();
        let mut rejections = Rejections::default();

        for member in members {
            if !member.handles_snapshots() && !request.is_checksum() {
                continue;
            }

            if member.is_remote() && best.is_some() {
                tracing::debug!(member = member.key(), %path, "found locally, skipping remote");
                continue;
            }

            match member.get_info(&self.member_request(request, member.as_ref())).await? {
                RepoResource::Found(found) => {
                    if member.is_local() && !member.is_cache() {
                        claims.push(member.key().to_owned());
                    }

                    best = Some(match best {
                        Some(current) if !is_better(&found, &current) => current,
                        _ => found,
                    });
                }
                RepoResource::Unfound(unfound) => rejections.observe(unfound),
            }
        }

        if claims.len() > 1 {
            tracing::warn!(
                repo = %self.key,
                %path,
                repositories = ?claims,
                "snapshot deployed to several local repositories"
            );
            request.diagnostics.record(
                FindingKind::DuplicateSnapshot,
                format!("{path} is held by {}", claims.join(", ")),
            );
        }

        Ok(match best {
            Some(found) => found.requested_as(path.clone()).into(),
            None => self.nothing_found(path, rejections),
        })
    }

    /// Merge the metadata of every member that has some.
    async fn metadata(
        &self,
        request: &Request,
        members: &[Arc<dyn Repository>],
    ) -> Result<RepoResource> {
        let path = &request.path;
        let (document, checksum) = match path.checksum_target() {
            Some((target, checksum)) => (target, Some(checksum)),
            None => (path.clone(), None),
        };
        let document_request = request.with_path(document.clone());

        let mut accumulator = MetadataAccumulator::default();
        let mut rejections = Rejections::default();

        for member in members.iter().filter(|member| !member.is_cache()) {
            let member_request = self.member_request(&document_request, member.as_ref());

            let found = match member.get_info(&member_request).await? {
                RepoResource::Found(found) => found,
                RepoResource::Unfound(unfound) => {
                    rejections.observe(unfound);
                    continue;
                }
            };

            let content = match read(member.as_ref(), &member_request, &found).await {
                Ok(content) => content,
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    tracing::warn!(member = member.key(), %path, %error, "cannot read metadata");
                    request.diagnostics.record(
                        FindingKind::RemoteFailure,
                        format!("{}: {error}", member.key()),
                    );
                    continue;
                }
            };

            match MavenMetadata::parse(&found.response_path, &content) {
                Ok(metadata) => accumulator.add(member.key(), metadata, found.last_modified),
                Err(error) => {
                    tracing::warn!(member = member.key(), %path, %error, "skipping invalid metadata");
                    request.diagnostics.record(
                        FindingKind::InvalidMetadata,
                        format!("{}: {error}", found.response_path),
                    );
                }
            }
        }

        let contributors = accumulator.contributors().join(", ");
        let Some((merged, last_modified)) = accumulator.finish() else {
            return Ok(self.nothing_found(path, rejections));
        };

        tracing::debug!(repo = %self.key, %path, %contributors, "merged metadata");

        let xml = merged.to_xml(&document)?;
        let resource = match checksum {
            Some(checksum) => {
                let value = checksum.digest(&xml).to_hex();
                FoundResource::inline(path.clone(), last_modified, Bytes::from(value))
            }
            None => {
                let mut hasher = ChecksumHasher::new();
                hasher.update(&xml);
                FoundResource::inline(path.clone(), last_modified, xml)
                    .with_checksums(hasher.finalize().checksums)
            }
        };

        Ok(resource.into())
    }
}

async fn read(member: &dyn Repository, request: &Request, found: &FoundResource) -> Result<Bytes> {
    if let Some(content) = &found.content {
        return Ok(content.clone());
    }

    member.download(request, found).await?.read_to_bytes().await
}

fn is_better(candidate: &FoundResource, current: &FoundResource) -> bool {
    if candidate.exact_match != current.exact_match {
        return candidate.exact_match;
    }

    candidate.last_modified > current.last_modified
}
