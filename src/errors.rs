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

use std::{path::PathBuf, time::Duration};

use miette::Diagnostic;

use crate::{
    checksum::{ChecksumType, Digest},
    metadata::NodeStoreError,
    path::RepoPath,
    remote::RemoteError,
    resource::UnfoundResource,
};

/// Result type used throughout `depot`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while resolving, downloading or storing artifacts.
///
/// Absence and policy rejections are not errors: they are reported as
/// [`RepoResource::Unfound`](crate::resource::RepoResource::Unfound). The variants here either
/// propagate to the transport layer or are recorded as diagnostics.
#[derive(thiserror::Error, Diagnostic, Debug)]
pub enum Error {
    /// The origin of a remote repository could not be reached or answered with an error.
    #[error("remote repository `{repo}` is unavailable")]
    #[diagnostic(code(depot::remote_unavailable))]
    RemoteUnavailable {
        repo: String,
        #[source]
        source: RemoteError,
    },

    /// The request was rejected by blackout, include/exclude or release/snapshot policy.
    #[error("{path} was rejected by policy: {reason}")]
    #[diagnostic(code(depot::rejected_by_policy))]
    RejectedByPolicy { path: RepoPath, reason: String },

    /// Content hashed to a known digest but its length differs from the stored blob.
    #[error(
        "digest collision on {digest}: stored content has {existing} bytes, new content has {computed} bytes"
    )]
    #[diagnostic(
        code(depot::digest_collision),
        help("the content store may be corrupted, inspect the blob before retrying")
    )]
    DigestCollision {
        digest: Digest,
        existing: u64,
        computed: u64,
    },

    /// A bounded wait on a path lock or a digest settlement timed out.
    #[error("timed out after {waited:?} waiting for {target}")]
    #[diagnostic(code(depot::lock_timeout))]
    LockTimeout { target: String, waited: Duration },

    /// A virtual repository is reachable from itself.
    #[error("virtual repository `{key}` is nested in itself")]
    #[diagnostic(code(depot::configuration_cycle))]
    ConfigurationCycle { key: String },

    /// Content did not match a checksum declared for it.
    #[error("{checksum} checksum mismatch for {path}: expected {expected}, computed {actual}")]
    #[diagnostic(code(depot::checksum_mismatch))]
    ChecksumMismatch {
        path: RepoPath,
        checksum: ChecksumType,
        expected: String,
        actual: String,
    },

    /// A content store record is being deleted and cannot be used anymore.
    #[error("content record {digest} is scheduled for deletion")]
    #[diagnostic(code(depot::record_unusable))]
    RecordUnusable { digest: Digest },

    /// A content store record failed earlier and stays unusable.
    #[error("content record {digest} is faulty: {reason}")]
    #[diagnostic(code(depot::record_fault))]
    RecordFault { digest: Digest, reason: String },

    /// The content store has no blob for a digest referenced by metadata.
    #[error("no content stored for {digest}")]
    #[diagnostic(code(depot::missing_content))]
    MissingContent { digest: Digest },

    /// A download was requested for a resource that could not be resolved.
    #[error("{} is not available: {}", .0.path, .0.reason)]
    #[diagnostic(code(depot::unavailable))]
    Unavailable(UnfoundResource),

    /// No repository is configured under this key.
    #[error("unknown repository `{0}`")]
    #[diagnostic(code(depot::unknown_repository))]
    UnknownRepository(String),

    /// The repository kind does not support the requested operation.
    #[error("repository `{repo}` does not support {operation}")]
    #[diagnostic(code(depot::unsupported))]
    Unsupported {
        repo: String,
        operation: &'static str,
    },

    /// The metadata backing store failed.
    #[error("metadata store failure on {target}")]
    #[diagnostic(code(depot::metadata))]
    Metadata {
        target: String,
        #[source]
        source: NodeStoreError,
    },

    /// Repository metadata could not be parsed or serialized.
    #[error("invalid repository metadata at {path}")]
    #[diagnostic(code(depot::invalid_metadata))]
    InvalidMetadata {
        path: RepoPath,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Local filesystem I/O failed.
    #[error("{context}: {}", .path.display())]
    #[diagnostic(code(depot::io))]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    #[diagnostic(code(depot::config))]
    Config(String),
}

impl Error {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io(
        context: &'static str,
        path: impl Into<PathBuf>,
    ) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io {
            context,
            path,
            source,
        }
    }

    /// Wrap a node store error with the location it happened on.
    pub(crate) fn metadata(target: impl ToString) -> impl FnOnce(NodeStoreError) -> Self {
        let target = target.to_string();
        move |source| Self::Metadata { target, source }
    }

    /// Whether the error signals corruption or exhaustion and must never be swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DigestCollision { .. } | Self::LockTimeout { .. })
    }
}
