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

//! # Repository metadata
//!
//! `maven-metadata.xml` documents are not served from a single origin by virtual repositories:
//! every member contributes its own copy and the results are merged.

use std::cmp::Ordering;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{Error, Result},
    path::RepoPath,
};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Maven metadata structure for maven-metadata.xml
#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename = "metadata")]
pub struct MavenMetadata {
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(rename = "artifactId", default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versioning: Option<Versioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Plugins>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Versioning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<Versions>,
    #[serde(rename = "lastUpdated", default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(
        rename = "snapshotVersions",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub snapshot_versions: Option<SnapshotVersions>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Versions {
    #[serde(rename = "version", default)]
    pub version: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "buildNumber", default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u32>,
    #[serde(rename = "localCopy", default, skip_serializing_if = "Option::is_none")]
    pub local_copy: Option<bool>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SnapshotVersions {
    #[serde(rename = "snapshotVersion", default)]
    pub snapshot_version: Vec<SnapshotVersion>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SnapshotVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Plugins {
    #[serde(rename = "plugin", default)]
    pub plugin: Vec<Plugin>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Plugin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(rename = "artifactId", default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
}

impl MavenMetadata {
    /// Parse a metadata document found at `path`.
    pub fn parse(path: &RepoPath, content: &[u8]) -> Result<Self> {
        let invalid = |source: Box<dyn std::error::Error + Send + Sync>| Error::InvalidMetadata {
            path: path.clone(),
            source,
        };

        let text = std::str::from_utf8(content).map_err(|error| invalid(Box::new(error)))?;
        quick_xml::de::from_str(text).map_err(|error| invalid(Box::new(error)))
    }

    /// Serialize into a metadata document.
    pub fn to_xml(&self, path: &RepoPath) -> Result<Bytes> {
        let body = quick_xml::se::to_string(self).map_err(|error| Error::InvalidMetadata {
            path: path.clone(),
            source: Box::new(error),
        })?;

        Ok(format!("{XML_DECLARATION}{body}\n").into())
    }

    fn last_updated(&self) -> Option<&str> {
        self.versioning.as_ref()?.last_updated.as_deref()
    }

    /// Fold another document into this one.
    ///
    /// Version lists and plugins are unioned, scalar fields prefer the document updated last.
    pub fn merge(&mut self, other: MavenMetadata) {
        let other_is_newer = other.last_updated() > self.last_updated();

        self.group_id = self.group_id.take().or(other.group_id);
        self.artifact_id = self.artifact_id.take().or(other.artifact_id);
        self.version = self.version.take().or(other.version);

        self.versioning = match (self.versioning.take(), other.versioning) {
            (Some(mut ours), Some(theirs)) => {
                ours.merge(theirs, other_is_newer);
                Some(ours)
            }
            (ours, theirs) => ours.or(theirs),
        };

        self.plugins = match (self.plugins.take(), other.plugins) {
            (Some(mut ours), Some(theirs)) => {
                for plugin in theirs.plugin {
                    if !ours.plugin.iter().any(|known| known.prefix == plugin.prefix) {
                        ours.plugin.push(plugin);
                    }
                }
                Some(ours)
            }
            (ours, theirs) => ours.or(theirs),
        };
    }
}

impl Versioning {
    fn merge(&mut self, other: Versioning, other_is_newer: bool) {
        let prefer = |ours: &mut Option<String>, theirs: Option<String>| {
            if theirs.is_some() && (other_is_newer || ours.is_none()) {
                *ours = theirs;
            }
        };

        prefer(&mut self.latest, other.latest);
        prefer(&mut self.release, other.release);

        self.last_updated = self.last_updated.take().max(other.last_updated);

        self.snapshot = match (self.snapshot.take(), other.snapshot) {
            (Some(ours), Some(theirs)) => Some(if theirs.timestamp > ours.timestamp {
                theirs
            } else {
                ours
            }),
            (ours, theirs) => ours.or(theirs),
        };

        self.versions = match (self.versions.take(), other.versions) {
            (Some(mut ours), Some(theirs)) => {
                for version in theirs.version {
                    if !ours.version.contains(&version) {
                        ours.version.push(version);
                    }
                }
                ours.version.sort_by(|a, b| compare_versions(a, b));
                Some(ours)
            }
            (ours, theirs) => ours.or(theirs),
        };

        self.snapshot_versions = match (self.snapshot_versions.take(), other.snapshot_versions) {
            (Some(mut ours), Some(theirs)) => {
                for version in theirs.snapshot_version {
                    let known = ours.snapshot_version.iter_mut().find(|known| {
                        known.classifier == version.classifier
                            && known.extension == version.extension
                    });
                    match known {
                        Some(known) if version.updated > known.updated => *known = version,
                        Some(_) => {}
                        None => ours.snapshot_version.push(version),
                    }
                }
                Some(ours)
            }
            (ours, theirs) => ours.or(theirs),
        };
    }
}

/// Order version strings by their numeric and textual components, `1.9 < 1.10`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |version: &str| {
        version
            .split(['.', '-'])
            .map(|part| part.to_owned())
            .collect::<Vec<_>>()
    };

    let (a_parts, b_parts) = (split(a), split(b));
    for (a_part, b_part) in a_parts.iter().zip(&b_parts) {
        let ordering = match (a_part.parse::<u64>(), b_part.parse::<u64>()) {
            (Ok(a_num), Ok(b_num)) => a_num.cmp(&b_num),
            _ => a_part.cmp(b_part),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a_parts.len().cmp(&b_parts.len())
}

/// Running merge of metadata documents contributed by several repositories.
#[derive(Debug, Default)]
pub struct MetadataAccumulator {
    merged: Option<MavenMetadata>,
    last_modified: Option<DateTime<Utc>>,
    contributors: Vec<String>,
}

impl MetadataAccumulator {
    /// Add a contribution.
    pub fn add(&mut self, repo: &str, metadata: MavenMetadata, last_modified: DateTime<Utc>) {
        match &mut self.merged {
            Some(merged) => merged.merge(metadata),
            None => self.merged = Some(metadata),
        }

        self.last_modified = self.last_modified.max(Some(last_modified));
        self.contributors.push(repo.to_owned());
    }

    /// Repositories that contributed, in order.
    pub fn contributors(&self) -> &[String] {
        &self.contributors
    }

    /// The merged document and the newest contribution time, if anything was added.
    pub fn finish(self) -> Option<(MavenMetadata, DateTime<Utc>)> {
        Some((self.merged?, self.last_modified?))
    }
}
