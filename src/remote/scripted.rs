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
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use url::Url;

use super::*;
use crate::{checksum::ChecksumType, errors::Error};

/// What the scripted origin answers for one path.
#[derive(Clone, Debug)]
pub(crate) enum Scripted {
    Content {
        bytes: Bytes,
        last_modified: DateTime<Utc>,
        checksums: Checksums,
    },
    Failure(StatusCode),
    BrokenStream(Bytes),
}

/// In-process origin counting probes and fetches.
#[derive(Debug)]
pub(crate) struct ScriptedRemote {
    base: Url,
    latency: Duration,
    paths: Mutex<HashMap<String, Scripted>>,
    heads: AtomicUsize,
    gets: AtomicUsize,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Self {
        Self {
            base: "https://origin.test/repo/".parse().unwrap(),
            latency: Duration::ZERO,
            paths: Mutex::default(),
            heads: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn serve(&self, path: &str, content: &'static [u8], last_modified: DateTime<Utc>) {
        let checksums = Checksums::default().with(
            ChecksumType::Sha1,
            ChecksumType::Sha1.digest(content).to_hex(),
        );
        self.script(
            path,
            Scripted::Content {
                bytes: Bytes::from_static(content),
                last_modified,
                checksums,
            },
        );
    }

    pub(crate) fn script(&self, path: &str, scripted: Scripted) {
        self.paths.lock().unwrap().insert(path.into(), scripted);
    }

    pub(crate) fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn lookup(&self, path: &str) -> Option<Scripted> {
        self.paths.lock().unwrap().get(path).cloned()
    }
}

struct Chunks {
    chunks: Vec<Bytes>,
    fail_at_end: bool,
}

#[async_trait::async_trait]
impl ChunkSource for Chunks {
    async fn next_chunk(&mut self) -> crate::errors::Result<Option<Bytes>> {
        if !self.chunks.is_empty() {
            return Ok(Some(self.chunks.remove(0)));
        }

        if self.fail_at_end {
            return Err(Error::RemoteUnavailable {
                repo: "scripted".into(),
                source: RemoteError::Transport {
                    url: "https://origin.test/".parse().unwrap(),
                    reason: "connection reset".into(),
                },
            });
        }

        Ok(None)
    }
}

#[async_trait::async_trait]
impl RemoteClient for ScriptedRemote {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn head(&self, path: &str) -> Result<RemoteResponse, RemoteError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        match self.lookup(path) {
            None => Ok(RemoteResponse::status(StatusCode::NOT_FOUND)),
            Some(Scripted::Failure(status)) => Err(RemoteError::Status {
                url: url_for(&self.base, path),
                status,
            }),
            Some(Scripted::Content {
                bytes,
                last_modified,
                checksums,
            }) => Ok(RemoteResponse {
                status: StatusCode::OK,
                last_modified: Some(last_modified),
                content_length: Some(bytes.len() as u64),
                checksums,
            }),
            Some(Scripted::BrokenStream(bytes)) => Ok(RemoteResponse {
                status: StatusCode::OK,
                last_modified: Some(Utc::now()),
                content_length: Some(bytes.len() as u64 * 2),
                checksums: Checksums::default(),
            }),
        }
    }

    async fn get(&self, path: &str) -> Result<RemoteDownload, RemoteError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;

        let response = self.head_unchecked(path)?;
        let body: Box<dyn ChunkSource> = match self.lookup(path) {
            Some(Scripted::Content { bytes, .. }) => {
                let middle = bytes.len() / 2;
                Box::new(Chunks {
                    chunks: vec![bytes.slice(..middle), bytes.slice(middle..)],
                    fail_at_end: false,
                })
            }
            Some(Scripted::BrokenStream(bytes)) => Box::new(Chunks {
                chunks: vec![bytes],
                fail_at_end: true,
            }),
            _ => {
                return Err(RemoteError::Status {
                    url: url_for(&self.base, path),
                    status: StatusCode::NOT_FOUND,
                });
            }
        };

        Ok(RemoteDownload { response, body })
    }
}

impl ScriptedRemote {
    fn head_unchecked(&self, path: &str) -> Result<RemoteResponse, RemoteError> {
        match self.lookup(path) {
            Some(Scripted::Content {
                bytes,
                last_modified,
                checksums,
            }) => Ok(RemoteResponse {
                status: StatusCode::OK,
                last_modified: Some(last_modified),
                content_length: Some(bytes.len() as u64),
                checksums,
            }),
            Some(Scripted::BrokenStream(_)) => Ok(RemoteResponse::status(StatusCode::OK)),
            Some(Scripted::Failure(status)) => Err(RemoteError::Status {
                url: url_for(&self.base, path),
                status,
            }),
            None => Err(RemoteError::Status {
                url: url_for(&self.base, path),
                status: StatusCode::NOT_FOUND,
            }),
        }
    }
}
