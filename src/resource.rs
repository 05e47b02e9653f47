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

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use crate::{checksum::Checksums, path::RepoPath};

/// Outcome of resolving a path against a repository.
#[derive(Clone, Debug, PartialEq)]
pub enum RepoResource {
    /// The resource exists.
    Found(FoundResource),
    /// The resource does not exist or may not be accessed.
    Unfound(UnfoundResource),
}

impl RepoResource {
    /// The path that was requested.
    pub fn path(&self) -> &RepoPath {
        match self {
            Self::Found(found) => &found.path,
            Self::Unfound(unfound) => &unfound.path,
        }
    }

    /// Whether the resource was found.
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// The found resource, if any.
    pub fn found(&self) -> Option<&FoundResource> {
        match self {
            Self::Found(found) => Some(found),
            Self::Unfound(_) => None,
        }
    }

    /// Convert into the found resource, if any.
    pub fn into_found(self) -> Option<FoundResource> {
        match self {
            Self::Found(found) => Some(found),
            Self::Unfound(_) => None,
        }
    }

    /// The same outcome, reported as requested at `path`.
    pub fn requested_as(self, path: RepoPath) -> Self {
        match self {
            Self::Found(found) => found.requested_as(path).into(),
            Self::Unfound(unfound) => unfound.requested_as(path).into(),
        }
    }
}

impl From<FoundResource> for RepoResource {
    fn from(found: FoundResource) -> Self {
        Self::Found(found)
    }
}

impl From<UnfoundResource> for RepoResource {
    fn from(unfound: UnfoundResource) -> Self {
        Self::Unfound(unfound)
    }
}

/// A resource that exists in some concrete repository.
#[derive(Clone, Debug, PartialEq)]
pub struct FoundResource {
    /// Path the resource was requested at
    pub path: RepoPath,
    /// Concrete repository and path holding the bytes
    pub response_path: RepoPath,
    /// Last modification time as reported by the holder
    pub last_modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    /// Known checksums
    pub checksums: Checksums,
    /// Whether the response path unambiguously matches the request
    pub exact_match: bool,
    /// Content synthesized during resolution (checksum files, merged metadata)
    pub content: Option<Bytes>,
}

impl FoundResource {
    /// A resource found exactly at the requested path.
    pub fn new(path: RepoPath, last_modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            response_path: path.clone(),
            path,
            last_modified,
            size,
            checksums: Checksums::default(),
            exact_match: true,
            content: None,
        }
    }

    /// A resource whose bytes are known up front.
    pub fn inline(path: RepoPath, last_modified: DateTime<Utc>, content: Bytes) -> Self {
        Self {
            size: content.len() as u64,
            content: Some(content),
            ..Self::new(path, last_modified, 0)
        }
    }

    /// Set the checksums.
    pub fn with_checksums(mut self, checksums: Checksums) -> Self {
        self.checksums = checksums;
        self
    }

    /// Mark the resource as served from another location than the one requested.
    pub fn with_response_path(mut self, response_path: RepoPath, exact_match: bool) -> Self {
        self.response_path = response_path;
        self.exact_match = exact_match;
        self
    }

    /// The same resource, reported as requested at `path`.
    pub fn requested_as(mut self, path: RepoPath) -> Self {
        self.path = path;
        self
    }
}

/// A resource that could not be resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnfoundResource {
    /// Path the resource was requested at
    pub path: RepoPath,
    /// HTTP-like status distinguishing absence from rejection
    pub status: StatusCode,
    /// Human readable reason
    pub reason: String,
}

impl UnfoundResource {
    /// Authoritative absence.
    pub fn not_found(path: RepoPath, reason: impl Into<String>) -> Self {
        Self {
            path,
            status: StatusCode::NOT_FOUND,
            reason: reason.into(),
        }
    }

    /// Rejection by the authorization gate.
    pub fn forbidden(path: RepoPath, reason: impl Into<String>) -> Self {
        Self {
            path,
            status: StatusCode::FORBIDDEN,
            reason: reason.into(),
        }
    }

    /// Unfound with an arbitrary status.
    pub fn with_status(path: RepoPath, status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            path,
            status,
            reason: reason.into(),
        }
    }

    /// Whether the caller was denied access rather than told the resource is absent.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self.status,
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED
        )
    }

    /// The same rejection, reported as requested at `path`.
    pub fn requested_as(mut self, path: RepoPath) -> Self {
        self.path = path;
        self
    }
}
