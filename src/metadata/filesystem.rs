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

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use walkdir::WalkDir;

use super::*;

const NODE_SUFFIX: &str = ".node.json";
const FOLDER_MARKER: &str = ".folder.json";

/// Filesystem-backed node store.
///
/// Folders are directories below `<root>/<repo>/` carrying a `.folder.json` marker, files are
/// JSON documents named `<name>.node.json` inside their parent folder.
///
/// Clones share one sequence of partial write names, so open a root once and clone the store.
#[derive(Clone, Debug)]
pub struct FilesystemNodeStore {
    root: PathBuf,
    partial_writes: Arc<AtomicU64>,
}

impl FilesystemNodeStore {
    /// Create a new store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partial_writes: Arc::default(),
        }
    }

    /// Base directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn folder_path(&self, path: &RepoPath) -> Result<PathBuf, NodeStoreError> {
        let invalid = |segment: &str| {
            segment == "."
                || segment == ".."
                || segment == FOLDER_MARKER
                || segment.ends_with(NODE_SUFFIX)
        };

        if invalid(path.repo()) || path.repo().contains('/') || path.repo().is_empty() {
            return Err(NodeStoreError::InvalidPath(path.clone()));
        }

        let mut location = self.root.join(path.repo());
        for segment in path.path().split('/').filter(|segment| !segment.is_empty()) {
            if invalid(segment) {
                return Err(NodeStoreError::InvalidPath(path.clone()));
            }
            location.push(segment);
        }

        Ok(location)
    }

    fn file_path(&self, path: &RepoPath) -> Result<PathBuf, NodeStoreError> {
        let folder = self.folder_path(path)?;
        let mut name = folder.into_os_string();
        name.push(NODE_SUFFIX);
        Ok(name.into())
    }

    async fn write_json(&self, location: &Path, node: &Node) -> Result<(), NodeStoreError> {
        let serialized = serde_json::to_vec_pretty(node)?;

        let sequence = self.partial_writes.fetch_add(1, Ordering::Relaxed);
        let mut partial = location.as_os_str().to_owned();
        partial.push(format!(".{}-{sequence}.partial", std::process::id()));
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, serialized).await?;
        if let Err(error) = tokio::fs::rename(&partial, location).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(error.into());
        }

        Ok(())
    }

    async fn read_json(location: &Path) -> Result<Option<Node>, NodeStoreError> {
        match tokio::fs::read(location).await {
            Ok(contents) => Ok(Some(serde_json::from_slice(&contents)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn is_dir(location: &Path) -> Result<bool, NodeStoreError> {
        match tokio::fs::metadata(location).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl NodeStore for FilesystemNodeStore {
    async fn read_node(&self, path: &RepoPath) -> Result<Option<Node>, NodeStoreError> {
        if let Some(node) = Self::read_json(&self.file_path(path)?).await? {
            return Ok(Some(node));
        }

        let folder = self.folder_path(path)?;
        if !Self::is_dir(&folder).await? {
            return Ok(None);
        }

        match Self::read_json(&folder.join(FOLDER_MARKER)).await? {
            Some(node) => Ok(Some(node)),
            // implicit folders created by parent directories
            None => {
                let modified = tokio::fs::metadata(&folder).await?.modified()?;
                Ok(Some(Node::Folder {
                    created: modified.into(),
                }))
            }
        }
    }

    async fn write_node(&self, path: &RepoPath, node: Node) -> Result<(), NodeStoreError> {
        let folder = self.folder_path(path)?;

        match &node {
            Node::Folder { .. } => {
                if tokio::fs::try_exists(self.file_path(path)?).await? {
                    return Err(NodeStoreError::Conflict(path.clone()));
                }

                tokio::fs::create_dir_all(&folder).await?;
                self.write_json(&folder.join(FOLDER_MARKER), &node).await
            }
            Node::File(_) => {
                if Self::is_dir(&folder).await? {
                    return Err(NodeStoreError::Conflict(path.clone()));
                }

                let location = self.file_path(path)?;
                if let Some(parent) = location.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                self.write_json(&location, &node).await
            }
        }
    }

    async fn delete_node(&self, path: &RepoPath) -> Result<bool, NodeStoreError> {
        match tokio::fs::remove_file(self.file_path(path)?).await {
            Ok(()) => return Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        match tokio::fs::remove_dir_all(self.folder_path(path)?).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn list_children(
        &self,
        folder: &RepoPath,
    ) -> Result<Vec<(RepoPath, Node)>, NodeStoreError> {
        let location = self.folder_path(folder)?;

        let mut entries = match tokio::fs::read_dir(&location).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let child = if entry.file_type().await?.is_dir() {
                folder.join(name)
            } else if let Some(stem) = name.strip_suffix(NODE_SUFFIX) {
                folder.join(stem)
            } else {
                continue;
            };

            if let Some(node) = self.read_node(&child).await? {
                children.push((child, node));
            }
        }

        children.sort_by(|(a, _), (b, _)| a.cmp(b));

        Ok(children)
    }

    async fn referenced_digests(&self) -> Result<HashSet<Digest>, NodeStoreError> {
        let mut digests = HashSet::new();

        if !Self::is_dir(&self.root).await? {
            return Ok(digests);
        }

        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(std::io::Error::from)?;

            let is_node = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.ends_with(NODE_SUFFIX));

            if !is_node {
                continue;
            }

            if let Some(Node::File(file)) = Self::read_json(entry.path()).await? {
                digests.insert(file.digest);
            }
        }

        Ok(digests)
    }
}
