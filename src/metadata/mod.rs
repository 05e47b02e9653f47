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

//! # Metadata node store
//!
//! Repositories describe their contents as a tree of nodes addressed by [`RepoPath`]. File nodes
//! reference their content by digest; the bytes themselves live in the
//! [`ContentStore`](crate::store::ContentStore). The [`NodeStore`] trait abstracts the persistence
//! technology; it is treated as a transactional key/value layer where each call is atomic.

mod filesystem;
mod memory;

use std::{collections::HashSet, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use filesystem::FilesystemNodeStore;
pub use memory::InMemoryNodeStore;

use crate::{
    checksum::{Checksums, Digest},
    path::RepoPath,
};

/// Arbitrary node store instance.
pub type AnyNodeStore = Arc<dyn NodeStore>;

/// One entry in a repository tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    /// A folder
    Folder {
        /// Creation time
        created: DateTime<Utc>,
    },
    /// A file backed by the content store
    File(FileNode),
}

impl Node {
    /// The file node, if this is a file.
    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Self::File(file) => Some(file),
            Self::Folder { .. } => None,
        }
    }
}

/// Metadata of a stored file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    /// Identity of the content in the content store
    pub digest: Digest,
    /// Content length in bytes
    pub size: u64,
    /// Creation time of the node
    pub created: DateTime<Utc>,
    /// Last modification time of the content (remote-reported for cached files)
    pub last_modified: DateTime<Utc>,
    /// When the content was last written or confirmed fresh
    pub last_updated: DateTime<Utc>,
    /// Checksums computed from the content
    pub checksums: Checksums,
    /// Checksums declared by the uploader or origin
    #[serde(default)]
    pub declared: Checksums,
}

/// Errors raised by node stores.
#[derive(thiserror::Error, Debug)]
pub enum NodeStoreError {
    /// A lock guarding the store was poisoned
    #[error("node store lock poisoned")]
    Poisoned,

    /// The path cannot be represented by this store
    #[error("invalid node path {0}")]
    InvalidPath(RepoPath),

    /// A file exists where a folder is required, or vice versa
    #[error("conflicting node at {0}")]
    Conflict(RepoPath),

    /// Underlying I/O failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A node could not be (de)serialized
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

/// Hierarchical metadata store.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync + fmt::Debug {
    /// Read the node at a path.
    async fn read_node(&self, path: &RepoPath) -> Result<Option<Node>, NodeStoreError>;

    /// Create or replace the node at a path.
    async fn write_node(&self, path: &RepoPath, node: Node) -> Result<(), NodeStoreError>;

    /// Delete the node at a path, including all descendants. Returns whether anything existed.
    async fn delete_node(&self, path: &RepoPath) -> Result<bool, NodeStoreError>;

    /// Direct children of a folder, sorted by path.
    async fn list_children(
        &self,
        folder: &RepoPath,
    ) -> Result<Vec<(RepoPath, Node)>, NodeStoreError>;

    /// Every digest referenced by a file node in any repository.
    async fn referenced_digests(&self) -> Result<HashSet<Digest>, NodeStoreError>;
}
