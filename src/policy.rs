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

use std::fmt;

use glob::{MatchOptions, Pattern};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{
    checksum::{ChecksumMismatch, Checksums},
    errors::{Error, Result},
    path::RepoPath,
    resource::UnfoundResource,
};

/// Per-repository rules deciding which paths a repository may serve at all.
#[derive(Clone, Debug)]
pub struct RepoPolicy {
    /// Reject every request
    pub blackout: bool,
    /// Serve release artifacts
    pub handles_releases: bool,
    /// Serve snapshot artifacts
    pub handles_snapshots: bool,
    pub(crate) includes: Vec<Pattern>,
    pub(crate) excludes: Vec<Pattern>,
}

impl Default for RepoPolicy {
    fn default() -> Self {
        Self {
            blackout: false,
            handles_releases: true,
            handles_snapshots: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern)
                .map_err(|error| Error::Config(format!("invalid glob pattern `{pattern}`: {error}")))
        })
        .collect()
}

impl RepoPolicy {
    /// Policy with include and exclude glob patterns. No include pattern means everything is
    /// included.
    pub fn with_patterns(includes: &[String], excludes: &[String]) -> Result<Self> {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
            ..Default::default()
        })
    }

    /// Check whether a path may be served.
    ///
    /// Checksum files are judged by the file they belong to.
    pub fn check(&self, path: &RepoPath) -> Result<()> {
        let reject = |reason: &str| {
            Err(Error::RejectedByPolicy {
                path: path.clone(),
                reason: reason.into(),
            })
        };

        if self.blackout {
            return reject("repository is blacked out");
        }

        let target = path
            .checksum_target()
            .map(|(target, _)| target)
            .unwrap_or_else(|| path.clone());

        let relative = target.path();
        if !relative.is_empty() {
            let included = self.includes.is_empty()
                || self
                    .includes
                    .iter()
                    .any(|pattern| pattern.matches_with(relative, MATCH_OPTIONS));
            if !included {
                return reject("path is not included");
            }

            let excluded = self
                .excludes
                .iter()
                .any(|pattern| pattern.matches_with(relative, MATCH_OPTIONS));
            if excluded {
                return reject("path is excluded");
            }
        }

        if target.is_metadata() {
            return Ok(());
        }

        if target.is_snapshot() {
            if !self.handles_snapshots {
                return reject("repository does not handle snapshots");
            }
        } else if !self.handles_releases && looks_like_artifact(&target) {
            return reject("repository does not handle releases");
        }

        Ok(())
    }

    /// [`check`](Self::check), expressed as an unfound resource.
    pub fn reject(&self, path: &RepoPath) -> Option<UnfoundResource> {
        match self.check(path) {
            Ok(()) => None,
            Err(error) => {
                tracing::debug!(%path, %error, "request rejected by repository policy");
                Some(UnfoundResource::not_found(path.clone(), error.to_string()))
            }
        }
    }
}

// folders never count as release artifacts
fn looks_like_artifact(path: &RepoPath) -> bool {
    path.name().contains('.')
}

/// Decision of the authorization gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    /// Access granted
    Allow,
    /// Access denied with a status distinguishing anonymous from authenticated callers
    Deny {
        /// `401` or `403`
        status: StatusCode,
        /// Human readable reason
        reason: String,
    },
}

/// Authorization collaborator consulted before any remote I/O or content access.
pub trait PathPolicy: Send + Sync + fmt::Debug {
    /// Whether the caller may see (`is_download == false`) or read `path`.
    fn check_path_allowed(&self, path: &RepoPath, is_download: bool) -> Access;
}

/// Grants everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl PathPolicy for AllowAll {
    fn check_path_allowed(&self, _path: &RepoPath, _is_download: bool) -> Access {
        Access::Allow
    }
}

/// Denies whole repositories, grants everything else.
#[derive(Clone, Debug, Default)]
pub struct DenyRepositories {
    keys: Vec<String>,
}

impl DenyRepositories {
    /// Deny access to the given repository keys.
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl PathPolicy for DenyRepositories {
    fn check_path_allowed(&self, path: &RepoPath, _is_download: bool) -> Access {
        if self.keys.iter().any(|key| key == path.repo()) {
            return Access::Deny {
                status: StatusCode::FORBIDDEN,
                reason: format!("access to `{}` is denied", path.repo()),
            };
        }

        Access::Allow
    }
}

/// Consult the gate and express a denial as an unfound resource.
pub fn authorize(
    gate: &dyn PathPolicy,
    path: &RepoPath,
    is_download: bool,
) -> Option<UnfoundResource> {
    match gate.check_path_allowed(path, is_download) {
        Access::Allow => None,
        Access::Deny { status, reason } => {
            Some(UnfoundResource::with_status(path.clone(), status, reason))
        }
    }
}

/// How a remote repository treats the checksums announced by its origin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumPolicy {
    /// Refuse content whose announced checksums do not match
    Fail,
    /// Keep announced checksums, verifying those that are present
    #[default]
    GenerateIfAbsent,
    /// Never verify; serve computed checksums only
    IgnoreAndGenerate,
}

impl ChecksumPolicy {
    /// Verify fetched content against the checksums announced by the origin.
    ///
    /// Returns the mismatches that must be reported as warnings.
    pub fn verify(
        &self,
        path: &RepoPath,
        computed: &Checksums,
        announced: &Checksums,
    ) -> Result<Vec<ChecksumMismatch>> {
        if *self == Self::IgnoreAndGenerate {
            return Ok(Vec::new());
        }

        let mismatches = computed.mismatches(announced);
        match (self, mismatches.first()) {
            (Self::Fail, Some(mismatch)) => Err(Error::ChecksumMismatch {
                path: path.clone(),
                checksum: mismatch.checksum,
                expected: mismatch.expected.clone(),
                actual: mismatch.actual.clone(),
            }),
            _ => Ok(mismatches),
        }
    }
}
