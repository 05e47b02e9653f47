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
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use super::*;

/// In-memory provider for [`NodeStore`].
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    nodes: Mutex<BTreeMap<RepoPath, Node>>,
}

impl InMemoryNodeStore {
    /// Creates a new, empty store
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_descendant(candidate: &RepoPath, ancestor: &RepoPath) -> bool {
    candidate.repo() == ancestor.repo()
        && (ancestor.is_root()
            || candidate
                .path()
                .strip_prefix(ancestor.path())
                .is_some_and(|rest| rest.starts_with('/')))
}

#[async_trait::async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn read_node(&self, path: &RepoPath) -> Result<Option<Node>, NodeStoreError> {
        let nodes = self.nodes.lock().map_err(|_| NodeStoreError::Poisoned)?;

        Ok(nodes.get(path).cloned())
    }

    async fn write_node(&self, path: &RepoPath, node: Node) -> Result<(), NodeStoreError> {
        let mut nodes = self.nodes.lock().map_err(|_| NodeStoreError::Poisoned)?;

        let replaces_folder = matches!(nodes.get(path), Some(Node::Folder { .. }));
        if replaces_folder && node.as_file().is_some() {
            return Err(NodeStoreError::Conflict(path.clone()));
        }

        nodes.insert(path.clone(), node);

        Ok(())
    }

    async fn delete_node(&self, path: &RepoPath) -> Result<bool, NodeStoreError> {
        let mut nodes = self.nodes.lock().map_err(|_| NodeStoreError::Poisoned)?;

        let before = nodes.len();
        nodes.retain(|candidate, _| candidate != path && !is_descendant(candidate, path));

        Ok(nodes.len() != before)
    }

    async fn list_children(
        &self,
        folder: &RepoPath,
    ) -> Result<Vec<(RepoPath, Node)>, NodeStoreError> {
        let nodes = self.nodes.lock().map_err(|_| NodeStoreError::Poisoned)?;

        Ok(nodes
            .iter()
            .filter(|(candidate, _)| candidate.parent().as_ref() == Some(folder))
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect())
    }

    async fn referenced_digests(&self) -> Result<HashSet<Digest>, NodeStoreError> {
        let nodes = self.nodes.lock().map_err(|_| NodeStoreError::Poisoned)?;

        Ok(nodes
            .values()
            .filter_map(Node::as_file)
            .map(|file| file.digest.clone())
            .collect())
    }
}
