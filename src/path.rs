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

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{checksum::ChecksumType, layout};

/// File name of the aggregate repository metadata index.
pub const MAVEN_METADATA: &str = "maven-metadata.xml";

/// A logical location: a repository key and a path relative to the repository root.
///
/// Paths are normalized on construction: leading, trailing and duplicate slashes are removed, so
/// `RepoPath::new("libs", "/com//acme/")` equals `RepoPath::new("libs", "com/acme")`. The
/// repository root is the empty path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoPath {
    repo: Arc<str>,
    path: Arc<str>,
}

/// Shape of a request, used by virtual repositories to pick a resolution strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// An ordinary release artifact (or anything that is neither of the below).
    Standard,
    /// A snapshot/integration artifact.
    Snapshot,
    /// Aggregate repository metadata that is merged across repositories.
    Metadata,
}

impl RepoPath {
    /// Create a new path within a repository.
    pub fn new(repo: impl Into<Arc<str>>, path: impl AsRef<str>) -> Self {
        let path = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        Self {
            repo: repo.into(),
            path: path.into(),
        }
    }

    /// Key of the repository this path lives in.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Path relative to the repository root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The same relative path in another repository.
    pub fn with_repo(&self, repo: impl Into<Arc<str>>) -> Self {
        Self {
            repo: repo.into(),
            path: self.path.clone(),
        }
    }

    /// Another path in the same repository.
    pub fn with_path(&self, path: impl AsRef<str>) -> Self {
        Self::new(self.repo.clone(), path)
    }

    /// Whether this is the repository root.
    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Last segment of the path.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Parent folder, `None` for the repository root.
    pub fn parent(&self) -> Option<RepoPath> {
        if self.is_root() {
            return None;
        }

        let parent = self.path.rsplit_once('/').map(|(parent, _)| parent);
        Some(self.with_path(parent.unwrap_or_default()))
    }

    /// Child entry of this folder.
    pub fn join(&self, name: &str) -> RepoPath {
        self.with_path(format!("{}/{name}", self.path))
    }

    /// The checksum algorithm if this path names a checksum file (`foo.jar.sha1`).
    pub fn checksum(&self) -> Option<ChecksumType> {
        let (_, extension) = self.name().rsplit_once('.')?;
        ChecksumType::from_extension(extension)
    }

    /// The file a checksum path refers to, together with the algorithm.
    pub fn checksum_target(&self) -> Option<(RepoPath, ChecksumType)> {
        let checksum = self.checksum()?;
        let target = self.path.strip_suffix(checksum.extension())?;
        let target = target.strip_suffix('.')?;
        Some((self.with_path(target), checksum))
    }

    /// Path of the checksum file for this path.
    pub fn checksum_path(&self, checksum: ChecksumType) -> RepoPath {
        self.with_path(format!("{}.{}", self.path, checksum.extension()))
    }

    /// Whether this path (or the file it is a checksum of) is repository metadata.
    pub fn is_metadata(&self) -> bool {
        let target = self
            .checksum_target()
            .map(|(target, _)| target)
            .unwrap_or_else(|| self.clone());
        target.name() == MAVEN_METADATA
    }

    /// Whether this path (or the file it is a checksum of) belongs to a snapshot version.
    pub fn is_snapshot(&self) -> bool {
        layout::is_snapshot_path(&self.path)
    }

    /// Classify the request.
    pub fn kind(&self) -> RequestKind {
        if self.is_metadata() {
            RequestKind::Metadata
        } else if self.is_snapshot() {
            RequestKind::Snapshot
        } else {
            RequestKind::Standard
        }
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(
            RepoPath::new("libs", "/com//acme/"),
            RepoPath::new("libs", "com/acme")
        );
        assert!(RepoPath::new("libs", "/").is_root());
        assert_eq!(RepoPath::new("libs", "a/b").to_string(), "libs:a/b");
    }

    #[test]
    fn can_navigate() {
        let path = RepoPath::new("libs", "com/acme/foo");
        assert_eq!(path.name(), "foo");
        assert_eq!(path.parent(), Some(RepoPath::new("libs", "com/acme")));
        assert_eq!(
            RepoPath::new("libs", "com").parent(),
            Some(RepoPath::new("libs", ""))
        );
        assert_eq!(RepoPath::new("libs", "").parent(), None);
        assert_eq!(
            RepoPath::new("libs", "").join("com"),
            RepoPath::new("libs", "com")
        );
    }

    #[test]
    fn recognizes_checksum_paths() {
        let path = RepoPath::new("libs", "com/acme/foo/1.0/foo-1.0.jar.sha1");
        assert_eq!(path.checksum(), Some(ChecksumType::Sha1));
        assert_eq!(
            path.checksum_target(),
            Some((
                RepoPath::new("libs", "com/acme/foo/1.0/foo-1.0.jar"),
                ChecksumType::Sha1
            ))
        );
        assert_eq!(RepoPath::new("libs", "foo.jar").checksum(), None);
        assert_eq!(RepoPath::new("libs", "sha1").checksum_target(), None);
    }

    #[test]
    fn classifies_requests() {
        let kind = |path: &str| RepoPath::new("libs", path).kind();

        assert_eq!(kind("com/acme/foo/1.0/foo-1.0.jar"), RequestKind::Standard);
        assert_eq!(kind("com/acme/foo/1.0/foo-1.0.jar.md5"), RequestKind::Standard);
        assert_eq!(
            kind("com/acme/foo/1.0-SNAPSHOT/foo-1.0-SNAPSHOT.jar"),
            RequestKind::Snapshot
        );
        assert_eq!(
            kind("com/acme/foo/1.0-SNAPSHOT/foo-1.0-20240102.030405-7.jar"),
            RequestKind::Snapshot
        );
        assert_eq!(kind("com/acme/foo/maven-metadata.xml"), RequestKind::Metadata);
        assert_eq!(
            kind("com/acme/foo/1.0-SNAPSHOT/maven-metadata.xml.sha1"),
            RequestKind::Metadata
        );
    }
}
