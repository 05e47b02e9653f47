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

//! # Remote origins
//!
//! Remote repositories talk to their origin through a [`RemoteClient`]: an existence probe
//! (`head`) and a streamed fetch (`get`). The production implementation is [`HttpRemote`].

mod http;
#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use url::Url;

pub use http::{HttpRemote, RemoteSettings};

use crate::{
    checksum::{ChecksumType, Checksums},
    store::ChunkSource,
};

/// Failure talking to an origin.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connect or socket timeout
    #[error("request to {url} timed out")]
    Timeout {
        /// Requested URL
        url: Url,
    },

    /// Connection, TLS or protocol failure
    #[error("request to {url} failed: {reason}")]
    Transport {
        /// Requested URL
        url: Url,
        /// Description of the failure
        reason: String,
    },

    /// The origin answered with a status that is neither success nor absence
    #[error("{url} answered with unexpected status {status}")]
    Status {
        /// Requested URL
        url: Url,
        /// Received status
        status: StatusCode,
    },
}

impl RemoteError {
    /// Status to record when memoizing this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::Status { status, .. } => *status,
        }
    }
}

/// Status line and the headers the repository cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteResponse {
    /// Response status
    pub status: StatusCode,
    /// `Last-Modified`
    pub last_modified: Option<DateTime<Utc>>,
    /// `Content-Length`
    pub content_length: Option<u64>,
    /// `X-Checksum-*` headers
    pub checksums: Checksums,
}

impl RemoteResponse {
    /// A response without any headers.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            last_modified: None,
            content_length: None,
            checksums: Checksums::default(),
        }
    }

    /// Extract the interesting headers of a response.
    pub fn from_headers(status: StatusCode, headers: &reqwest::header::HeaderMap) -> Self {
        let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

        let last_modified = header(reqwest::header::LAST_MODIFIED.as_str())
            .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
            .map(|value| value.with_timezone(&Utc));

        let content_length = header(reqwest::header::CONTENT_LENGTH.as_str())
            .and_then(|value| value.parse().ok());

        let mut checksums = Checksums::default();
        for checksum in ChecksumType::ALL {
            let value = header(checksum.header())
                .filter(|value| value.len() == checksum.hex_len() && hex::decode(value).is_ok());
            if let Some(value) = value {
                checksums.insert(checksum, value);
            }
        }

        Self {
            status,
            last_modified,
            content_length,
            checksums,
        }
    }
}

/// A successful fetch: the response and its body.
pub struct RemoteDownload {
    /// Status and headers
    pub response: RemoteResponse,
    /// Streamed body
    pub body: Box<dyn ChunkSource>,
}

impl fmt::Debug for RemoteDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDownload")
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

/// Access to the origin of a remote repository.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync + fmt::Debug {
    /// Base URL of the origin.
    fn base_url(&self) -> &Url;

    /// Existence probe. Non-success statuses are returned, not raised.
    async fn head(&self, path: &str) -> Result<RemoteResponse, RemoteError>;

    /// Fetch the content at `path`. Only success responses are returned.
    async fn get(&self, path: &str) -> Result<RemoteDownload, RemoteError>;
}

/// Resolve a repository-relative path against an origin base URL.
pub fn url_for(base: &Url, path: &str) -> Url {
    base.join(path.trim_start_matches('/'))
        .unwrap_or_else(|_| base.clone())
}
