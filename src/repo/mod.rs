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

//! # Repositories
//!
//! Every request is resolved against a named repository. Real repositories come in three kinds:
//!
//! - [`LocalRepo`]: content deployed or imported directly
//! - [`RemoteRepo`]: a mirror of a remote origin, materializing fetched content into its
//!   [`LocalCacheRepo`]
//! - [`LocalCacheRepo`]: the on-disk copy of everything a remote repository fetched
//!
//! All of them implement the [`Repository`] capability trait. [`VirtualRepo`]s aggregate real
//! repositories and other virtual repositories under one key. The [`Repositories`] arena owns
//! all of them and dispatches requests by repository key.

mod cache;
mod local;
mod remote;
mod virtual_repo;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use strum::Display;

pub use cache::LocalCacheRepo;
pub use local::{ImportReport, LocalRepo};
pub use remote::{RemoteRepo, RemoteRepoSettings};
pub use virtual_repo::{VirtualRepo, VirtualRepoSettings};

use crate::{
    errors::{Error, Result},
    layout::RepoLayout,
    path::RepoPath,
    resource::{FoundResource, RepoResource, UnfoundResource},
    store::{BlobReader, ChunkSource, ReaderSource},
};

/// Kind of a non-fatal finding recorded while serving a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FindingKind {
    /// A virtual repository is nested in itself
    ConfigurationCycle,
    /// A virtual repository names a repository that does not exist
    UnknownMember,
    /// Several local repositories hold the same snapshot
    DuplicateSnapshot,
    /// Content did not match its declared checksums
    ChecksumMismatch,
    /// A remote origin failed and the failure was swallowed
    RemoteFailure,
    /// Repository metadata of a member could not be parsed
    InvalidMetadata,
}

/// A non-fatal finding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    /// What happened
    pub kind: FindingKind,
    /// Details
    pub message: String,
}

/// Collects findings of one request, shared by every repository the request visits.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics(Arc<Mutex<Vec<Finding>>>);

impl Diagnostics {
    /// Record a finding.
    pub fn record(&self, kind: FindingKind, message: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Finding {
                kind,
                message: message.into(),
            });
    }

    /// Everything recorded so far.
    pub fn findings(&self) -> Vec<Finding> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether a finding of this kind was recorded.
    pub fn contains(&self, kind: FindingKind) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|finding| finding.kind == kind)
    }
}

/// An inbound request as handed over by the transport layer.
#[derive(Clone, Debug)]
pub struct Request {
    /// Requested repository and path
    pub path: RepoPath,
    /// Only report content newer than this
    pub if_modified_since: Option<DateTime<Utc>>,
    /// The caller does not want the body
    pub head_only: bool,
    /// The request was sent by a peer server
    pub from_peer: bool,
    /// Properties forwarded with the request
    pub properties: BTreeMap<String, String>,
    /// Findings sink
    pub diagnostics: Diagnostics,
}

impl Request {
    /// A plain request for a path.
    pub fn new(path: RepoPath) -> Self {
        Self {
            path,
            if_modified_since: None,
            head_only: false,
            from_peer: false,
            properties: BTreeMap::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Mark the request as sent by a peer server.
    pub fn from_peer(mut self) -> Self {
        self.from_peer = true;
        self
    }

    /// Mark the request as not wanting the body.
    pub fn head_only(mut self) -> Self {
        self.head_only = true;
        self
    }

    /// Only report content newer than `since`.
    pub fn if_modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.if_modified_since = Some(since);
        self
    }

    /// Forward a property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The same request for another path, sharing the findings sink.
    pub fn with_path(&self, path: RepoPath) -> Self {
        Self {
            path,
            ..self.clone()
        }
    }

    /// Whether a checksum file is requested.
    pub fn is_checksum(&self) -> bool {
        self.path.checksum().is_some()
    }

    fn is_not_modified(&self, resource: &FoundResource) -> bool {
        self.if_modified_since
            .is_some_and(|since| resource.last_modified <= since)
    }
}

/// Body of a [`Download`].
pub enum Content {
    /// A blob of the content store
    Blob(BlobReader),
    /// Content synthesized in memory
    Inline(Bytes),
    /// Content streamed straight from a remote origin
    Stream(Box<dyn ChunkSource>),
    /// The caller asked for headers only
    Empty,
    /// The content did not change since the time given by the caller
    NotModified,
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blob(reader) => f.debug_tuple("Blob").field(reader).finish(),
            Self::Inline(bytes) => f.debug_tuple("Inline").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Empty => f.write_str("Empty"),
            Self::NotModified => f.write_str("NotModified"),
        }
    }
}

/// A resolved resource together with its body.
#[derive(Debug)]
pub struct Download {
    /// The resource being served
    pub resource: FoundResource,
    /// Its body
    pub content: Content,
}

impl Download {
    /// A download of content held in memory.
    pub fn inline(resource: FoundResource, content: Bytes) -> Self {
        Self {
            resource,
            content: Content::Inline(content),
        }
    }

    /// The body as a chunk stream.
    pub fn into_chunks(self) -> Box<dyn ChunkSource> {
        match self.content {
            Content::Blob(reader) => Box::new(ReaderSource::new(reader)),
            Content::Inline(bytes) => Box::new(bytes),
            Content::Stream(stream) => stream,
            Content::Empty | Content::NotModified => Box::new(Bytes::new()),
        }
    }

    /// Read the whole body into memory.
    pub async fn read_to_bytes(self) -> Result<Bytes> {
        if let Content::Blob(reader) = self.content {
            return reader.read_to_bytes().await;
        }

        let mut chunks = self.into_chunks();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = chunks.next_chunk().await? {
            buffer.extend_from_slice(&chunk);
        }

        Ok(buffer.freeze())
    }
}

/// Capability shared by all real repository kinds.
#[async_trait::async_trait]
pub trait Repository: Send + Sync + fmt::Debug {
    /// Unique key of the repository.
    fn key(&self) -> &str;

    /// Artifact path layout.
    fn layout(&self) -> RepoLayout;

    /// Whether the content lives in this server.
    fn is_local(&self) -> bool;

    /// Whether this is the local cache of a remote repository.
    fn is_cache(&self) -> bool {
        false
    }

    /// Whether this mirrors a remote origin.
    fn is_remote(&self) -> bool {
        !self.is_local()
    }

    /// Whether release artifacts are served.
    fn handles_releases(&self) -> bool;

    /// Whether snapshot artifacts are served.
    fn handles_snapshots(&self) -> bool;

    /// The cache repository populated by this repository, if any.
    fn local_cache(&self) -> Option<Arc<dyn Repository>> {
        None
    }

    /// Resolve a path.
    async fn get_info(&self, request: &Request) -> Result<RepoResource>;

    /// Open the body of a resource previously resolved by [`get_info`](Self::get_info).
    async fn download(&self, request: &Request, resource: &FoundResource) -> Result<Download>;
}

/// Arena of all configured repositories, keyed by repository key.
#[derive(Debug, Default)]
pub struct Repositories {
    real: HashMap<String, Arc<dyn Repository>>,
    locals: HashMap<String, Arc<LocalRepo>>,
    virtuals: HashMap<String, Arc<VirtualRepo>>,
    order: Vec<String>,
}

impl Repositories {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&mut self, key: &str) -> Result<()> {
        let taken = self.real.contains_key(key) || self.virtuals.contains_key(key);
        if taken {
            return Err(Error::Config(format!("duplicate repository key `{key}`")));
        }

        self.order.push(key.to_owned());
        Ok(())
    }

    /// Register a local repository.
    pub fn add_local(&mut self, repo: LocalRepo) -> Result<Arc<LocalRepo>> {
        self.claim(repo.key())?;

        let repo = Arc::new(repo);
        self.locals.insert(repo.key().to_owned(), repo.clone());
        self.real.insert(repo.key().to_owned(), repo.clone());

        Ok(repo)
    }

    /// Register a remote repository together with its cache.
    pub fn add_remote(&mut self, repo: RemoteRepo) -> Result<Arc<RemoteRepo>> {
        if let Some(cache) = repo.cache() {
            self.add_repository(cache.clone())?;
        }

        let repo = Arc::new(repo);
        self.add_repository(repo.clone())?;

        Ok(repo)
    }

    /// Register any real repository.
    pub fn add_repository(&mut self, repo: Arc<dyn Repository>) -> Result<()> {
        self.claim(repo.key())?;
        self.real.insert(repo.key().to_owned(), repo);

        Ok(())
    }

    /// Register a virtual repository.
    pub fn add_virtual(&mut self, repo: VirtualRepo) -> Result<Arc<VirtualRepo>> {
        self.claim(repo.key())?;

        let repo = Arc::new(repo);
        self.virtuals.insert(repo.key().to_owned(), repo.clone());

        Ok(repo)
    }

    /// A real repository.
    pub fn get(&self, key: &str) -> Option<Arc<dyn Repository>> {
        self.real.get(key).cloned()
    }

    /// A local repository.
    pub fn local(&self, key: &str) -> Option<Arc<LocalRepo>> {
        self.locals.get(key).cloned()
    }

    /// The local repository content can be deployed to.
    pub fn deploy_target(&self, key: &str) -> Result<Arc<LocalRepo>> {
        if let Some(local) = self.locals.get(key) {
            return Ok(local.clone());
        }

        if self.real.contains_key(key) || self.virtuals.contains_key(key) {
            return Err(Error::Unsupported {
                repo: key.to_owned(),
                operation: "deploy",
            });
        }

        Err(Error::UnknownRepository(key.to_owned()))
    }

    /// A virtual repository.
    pub fn virtual_repo(&self, key: &str) -> Option<Arc<VirtualRepo>> {
        self.virtuals.get(key).cloned()
    }

    /// Whether a key names a virtual repository.
    pub fn is_virtual(&self, key: &str) -> bool {
        self.virtuals.contains_key(key)
    }

    /// All keys, in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Resolve a request against the repository it names.
    pub async fn get_info(&self, request: &Request) -> Result<RepoResource> {
        let key = request.path.repo();

        if let Some(repo) = self.virtuals.get(key) {
            return repo.get_info(self, request).await;
        }

        match self.real.get(key) {
            Some(repo) => repo.get_info(request).await,
            None => Err(Error::UnknownRepository(key.to_owned())),
        }
    }

    /// Open the body of a resolved resource.
    pub async fn download(&self, request: &Request, resource: &FoundResource) -> Result<Download> {
        if request.is_not_modified(resource) {
            return Ok(Download {
                resource: resource.clone(),
                content: Content::NotModified,
            });
        }

        if request.head_only {
            return Ok(Download {
                resource: resource.clone(),
                content: Content::Empty,
            });
        }

        if let Some(content) = &resource.content {
            return Ok(Download::inline(resource.clone(), content.clone()));
        }

        let holder = resource.response_path.repo();
        let repo = self
            .real
            .get(holder)
            .ok_or_else(|| Error::UnknownRepository(holder.to_owned()))?;

        repo.download(&request.with_path(resource.response_path.clone()), resource)
            .await
    }

    /// Resolve and open in one go.
    pub async fn fetch(&self, request: &Request) -> Result<Download> {
        match self.get_info(request).await? {
            RepoResource::Found(found) => self.download(request, &found).await,
            RepoResource::Unfound(unfound) => Err(Error::Unavailable(unfound)),
        }
    }
}

/// Unfound resource for a path no member could serve.
pub(crate) fn nothing_found(path: &RepoPath) -> UnfoundResource {
    UnfoundResource::not_found(path.clone(), "could not find resource")
}

#[cfg(test)]
pub(crate) mod testing;
