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

//! Repository layouts.
//!
//! A layout describes how module coordinates (organization, module, revision, classifier,
//! extension) map to artifact paths. Virtual repositories translate request paths between the
//! layout they expose and the layout of each member.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Folder and file integration revision of non-unique snapshots.
pub const SNAPSHOT: &str = "SNAPSHOT";

/// Supported artifact path layouts.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
pub enum RepoLayout {
    /// `[orgPath]/[module]/[baseRev](-[folderItegRev])/[module]-[baseRev](-[fileItegRev])(-[classifier]).[ext]`
    #[default]
    #[serde(rename = "maven-2")]
    #[strum(serialize = "maven-2")]
    Maven2,
    /// `[org]/[module]/[baseRev](-[folderItegRev])/[type]s/[module](-[classifier])-[baseRev](-[fileItegRev]).[ext]`
    #[serde(rename = "ivy-default")]
    #[strum(serialize = "ivy-default")]
    IvyDefault,
}

/// Coordinates of one artifact, independent of any layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Dotted organization, e.g. `com.acme`
    pub organization: String,
    /// Module name
    pub module: String,
    /// Revision without integration suffix, e.g. `1.0`
    pub base_revision: String,
    /// `SNAPSHOT` for snapshot folders
    pub folder_integration_revision: Option<String>,
    /// `SNAPSHOT` or a unique timestamp such as `20240102.030405-7`
    pub file_integration_revision: Option<String>,
    /// Optional classifier, e.g. `sources`
    pub classifier: Option<String>,
    /// Artifact type
    pub kind: String,
    /// File extension, e.g. `jar` or `tar.gz`
    pub ext: String,
}

impl ModuleInfo {
    /// Whether this is a snapshot/integration artifact.
    pub fn is_integration(&self) -> bool {
        self.folder_integration_revision.is_some() || self.file_integration_revision.is_some()
    }

    /// Whether this is a non-unique snapshot (`foo-1.0-SNAPSHOT.jar`).
    pub fn is_non_unique_snapshot(&self) -> bool {
        self.file_integration_revision.as_deref() == Some(SNAPSHOT)
    }

    /// Whether both infos name the same artifact apart from the file integration revision.
    pub fn same_artifact(&self, other: &ModuleInfo) -> bool {
        self.organization == other.organization
            && self.module == other.module
            && self.base_revision == other.base_revision
            && self.classifier == other.classifier
            && self.ext == other.ext
    }
}

impl RepoLayout {
    /// Parse an artifact path. Returns `None` for paths that are not artifacts of this layout.
    pub fn parse(&self, path: &str) -> Option<ModuleInfo> {
        match self {
            Self::Maven2 => parse_maven(path),
            Self::IvyDefault => parse_ivy(path),
        }
    }

    /// Build the artifact path of a module in this layout.
    pub fn format(&self, info: &ModuleInfo) -> String {
        let folder = match &info.folder_integration_revision {
            Some(integration) => format!("{}-{integration}", info.base_revision),
            None => info.base_revision.clone(),
        };
        let integration = info
            .file_integration_revision
            .as_ref()
            .map(|revision| format!("-{revision}"))
            .unwrap_or_default();
        let classifier = info
            .classifier
            .as_ref()
            .map(|classifier| format!("-{classifier}"))
            .unwrap_or_default();

        match self {
            Self::Maven2 => format!(
                "{}/{}/{folder}/{}-{}{integration}{classifier}.{}",
                info.organization.replace('.', "/"),
                info.module,
                info.module,
                info.base_revision,
                info.ext
            ),
            Self::IvyDefault => format!(
                "{}/{}/{folder}/{}s/{}{classifier}-{}{integration}.{}",
                info.organization,
                info.module,
                info.kind,
                info.module,
                info.base_revision,
                info.ext
            ),
        }
    }
}

/// Translate an artifact path (or a checksum of one) from one layout to another.
///
/// Paths that do not parse in the source layout, such as metadata files and folders, are
/// returned unchanged.
pub fn translate(path: &str, from: RepoLayout, to: RepoLayout) -> String {
    if from == to {
        return path.to_owned();
    }

    let (artifact, suffix) = match path.rsplit_once('.') {
        Some((artifact, extension))
            if crate::checksum::ChecksumType::from_extension(extension).is_some() =>
        {
            (artifact, &path[artifact.len()..])
        }
        _ => (path, ""),
    };

    match from.parse(artifact) {
        Some(info) => format!("{}{suffix}", to.format(&info)),
        None => path.to_owned(),
    }
}

/// Whether a revision marks an integration build (`SNAPSHOT` or a unique timestamp).
pub fn is_integration_revision(revision: &str) -> bool {
    revision == SNAPSHOT || matches!(split_timestamp(revision), Some((_, "")))
}

/// Whether a path contains a snapshot folder or a uniquely versioned snapshot file.
pub fn is_snapshot_path(path: &str) -> bool {
    let mut segments = path.split('/').peekable();

    while let Some(segment) = segments.next() {
        let is_file = segments.peek().is_none();

        if segment.ends_with("-SNAPSHOT") || (is_file && segment.contains("-SNAPSHOT")) {
            return true;
        }

        if is_file
            && segment
                .match_indices('-')
                .any(|(index, _)| split_timestamp(&segment[index + 1..]).is_some())
        {
            return true;
        }
    }

    false
}

/// Order unique snapshot revisions (`yyyyMMdd.HHmmss-build`) chronologically.
pub fn compare_unique_revisions(a: &str, b: &str) -> Ordering {
    let key = |revision: &str| {
        let (timestamp, build) = revision.rsplit_once('-').unwrap_or((revision, "0"));
        (timestamp.to_owned(), build.parse::<u64>().unwrap_or_default())
    };

    key(a).cmp(&key(b))
}

/// Split a leading `yyyyMMdd.HHmmss-build` timestamp off `input`.
fn split_timestamp(input: &str) -> Option<(&str, &str)> {
    let bytes = input.as_bytes();
    let digits = |range: std::ops::Range<usize>| {
        bytes
            .get(range)
            .is_some_and(|slice| slice.iter().all(u8::is_ascii_digit))
    };

    let shaped = digits(0..8)
        && bytes.get(8) == Some(&b'.')
        && digits(9..15)
        && bytes.get(15) == Some(&b'-');

    if !shaped {
        return None;
    }

    let build = bytes[16..]
        .iter()
        .take_while(|byte| byte.is_ascii_digit())
        .count();

    if build == 0 {
        return None;
    }

    Some(input.split_at(16 + build))
}

/// Split `-<integration revision>` off the front of `rest`, if present.
fn split_integration<'a>(rest: &'a str, snapshot_folder: bool) -> (Option<String>, &'a str) {
    let Some(candidate) = rest.strip_prefix('-') else {
        return (None, rest);
    };

    if snapshot_folder {
        if let Some(tail) = candidate.strip_prefix(SNAPSHOT) {
            if tail.is_empty() || tail.starts_with(['-', '.']) {
                return (Some(SNAPSHOT.to_owned()), tail);
            }
        }
    }

    match split_timestamp(candidate) {
        Some((timestamp, tail)) if tail.is_empty() || tail.starts_with(['-', '.']) => {
            (Some(timestamp.to_owned()), tail)
        }
        _ => (None, rest),
    }
}

/// Split `(-classifier).ext` into its parts.
fn split_classifier_ext(tail: &str) -> Option<(Option<String>, String)> {
    if let Some(ext) = tail.strip_prefix('.') {
        return (!ext.is_empty()).then(|| (None, ext.to_owned()));
    }

    let (classifier, ext) = tail.strip_prefix('-')?.split_once('.')?;

    if classifier.is_empty() || ext.is_empty() {
        return None;
    }

    Some((Some(classifier.to_owned()), ext.to_owned()))
}

fn split_folder(folder: &str) -> (String, Option<String>) {
    match folder.strip_suffix("-SNAPSHOT") {
        Some(base) if !base.is_empty() => (base.to_owned(), Some(SNAPSHOT.to_owned())),
        _ => (folder.to_owned(), None),
    }
}

fn parse_maven(path: &str) -> Option<ModuleInfo> {
    let segments: Vec<_> = path.split('/').filter(|s| !s.is_empty()).collect();

    let [org @ .., module, folder, file] = segments.as_slice() else {
        return None;
    };

    if org.is_empty() {
        return None;
    }

    let (base_revision, folder_integration_revision) = split_folder(folder);

    let rest = file
        .strip_prefix(*module)?
        .strip_prefix('-')?
        .strip_prefix(base_revision.as_str())?;

    let (file_integration_revision, tail) =
        split_integration(rest, folder_integration_revision.is_some());
    let (classifier, ext) = split_classifier_ext(tail)?;

    Some(ModuleInfo {
        organization: org.join("."),
        module: module.to_string(),
        base_revision,
        folder_integration_revision,
        file_integration_revision,
        classifier,
        kind: ext.clone(),
        ext,
    })
}

fn parse_ivy(path: &str) -> Option<ModuleInfo> {
    let segments: Vec<_> = path.split('/').filter(|s| !s.is_empty()).collect();

    let [org, module, folder, types, file] = segments.as_slice() else {
        return None;
    };

    let kind = types.strip_suffix('s').filter(|kind| !kind.is_empty())?;
    let (base_revision, folder_integration_revision) = split_folder(folder);

    let rest = file.strip_prefix(*module)?;
    let needle = format!("-{base_revision}");

    // the classifier sits between module and revision, so take the first revision occurrence
    // that is followed by an integration revision or the extension
    let (index, _) = rest.match_indices(&needle).find(|(index, _)| {
        rest[index + needle.len()..].starts_with(['-', '.'])
    })?;

    let classifier = match &rest[..index] {
        "" => None,
        prefix => Some(prefix.strip_prefix('-')?.to_owned()),
    };

    let (file_integration_revision, tail) = split_integration(
        &rest[index + needle.len()..],
        folder_integration_revision.is_some(),
    );
    let ext = tail.strip_prefix('.').filter(|ext| !ext.is_empty())?;

    Some(ModuleInfo {
        organization: org.to_string(),
        module: module.to_string(),
        base_revision,
        folder_integration_revision,
        file_integration_revision,
        classifier,
        kind: kind.to_owned(),
        ext: ext.to_owned(),
    })
}
