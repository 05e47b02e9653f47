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

//! # Content store
//!
//! Deduplicating, digest-addressed blob storage shared by every repository. Each unique content
//! is stored exactly once below `<root>/filestore/<xx>/<sha256>` and tracked by a
//! [`ContentStoreRecord`]. Repository metadata nodes reference blobs by digest; blobs no node
//! references are reclaimed by [`ContentStore::collect_garbage`].

mod reader;
mod record;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

pub use reader::{BlobReader, ChunkSource, ReaderSource};
pub use record::{
    ContentStoreRecord, Deletion, GcDisposition, RecordRef, RecordState, Reinsert,
};

use crate::{
    checksum::{ChecksumHasher, ChecksumType, Checksums, Digest},
    errors::{Error, Result},
    metadata::NodeStore,
};

/// Content that was handed to [`ContentStore::insert`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredContent {
    /// Identity of the content
    pub digest: Digest,
    /// Length in bytes
    pub length: u64,
    /// All checksums computed while streaming
    pub checksums: Checksums,
    /// Whether an existing blob was reused
    pub reused: bool,
}

/// Outcome of one collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Records looked at
    pub scanned: usize,
    /// Records still referenced by metadata
    pub referenced: usize,
    /// Records marked for deletion
    pub marked: usize,
    /// Blobs removed from disk during this pass
    pub deleted: usize,
    /// Blobs kept on disk because readers still hold them open
    pub deferred: usize,
    /// Faulty or deleted records dropped from the index
    pub evicted: usize,
    /// Marked blobs that could not be removed and stay indexed for the next pass
    pub failed: usize,
    /// Bytes freed
    pub reclaimed_bytes: u64,
}

/// Digest-addressed blob storage.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    settle_timeout: Duration,
    index: Mutex<HashMap<Digest, RecordRef>>,
    deferred: Mutex<Vec<RecordRef>>,
    sequence: AtomicU64,
}

impl ContentStore {
    const FILESTORE: &str = "filestore";
    const TMP: &str = "tmp";

    /// Open the store at `root`, indexing every blob already on disk.
    pub fn open(root: impl Into<PathBuf>, settle_timeout: Duration) -> Result<Self> {
        let root = root.into();
        let filestore = root.join(Self::FILESTORE);
        let tmp = root.join(Self::TMP);

        std::fs::create_dir_all(&filestore)
            .map_err(Error::io("failed to create content store", &filestore))?;

        // leftovers of interrupted inserts and deferred deletions
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)
                .map_err(Error::io("failed to clean temporary directory", &tmp))?;
        }
        std::fs::create_dir_all(&tmp)
            .map_err(Error::io("failed to create temporary directory", &tmp))?;

        let mut index = HashMap::new();
        for entry in WalkDir::new(&filestore).min_depth(2).max_depth(2) {
            let entry = entry
                .map_err(|error| Error::io("failed to scan content store", &filestore)(error.into()))?;

            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Ok(digest) = Digest::from_parts(ChecksumType::Sha256, name) else {
                tracing::warn!(path = %entry.path().display(), "ignoring unknown file in content store");
                continue;
            };

            let metadata = entry
                .metadata()
                .map_err(|error| Error::io("failed to inspect blob", entry.path())(error.into()))?;
            let created: DateTime<Utc> = metadata
                .modified()
                .map(Into::into)
                .unwrap_or_else(|_| Utc::now());

            let record = ContentStoreRecord::committed(
                digest.clone(),
                metadata.len(),
                entry.path().to_path_buf(),
                created,
            );
            index.insert(digest, Arc::new(record));
        }

        tracing::debug!(root = %root.display(), blobs = index.len(), "opened content store");

        Ok(Self {
            root,
            settle_timeout,
            index: Mutex::new(index),
            deferred: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Base directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index(&self) -> MutexGuard<'_, HashMap<Digest, RecordRef>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deferred(&self) -> MutexGuard<'_, Vec<RecordRef>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join(Self::FILESTORE)
            .join(&hex[..2])
            .join(hex)
    }

    fn scratch_path(&self, kind: &str) -> PathBuf {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(Self::TMP)
            .join(format!("{kind}-{}-{sequence}", std::process::id()))
    }

    /// Number of tracked blobs.
    pub fn len(&self) -> usize {
        self.index().len()
    }

    /// Whether no blob is tracked.
    pub fn is_empty(&self) -> bool {
        self.index().is_empty()
    }

    /// The record for a digest, if tracked.
    pub fn record(&self, digest: &Digest) -> Option<RecordRef> {
        self.index().get(digest).cloned()
    }

    /// Whether content with this digest is stored.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.record(digest).is_some_and(|record| {
            matches!(
                record.state(),
                RecordState::InDbUsed | RecordState::InDbFound
            )
        })
    }

    /// Mark a blob as used without reading it.
    pub fn touch(&self, digest: &Digest) -> Result<()> {
        self.record(digest)
            .ok_or_else(|| Error::MissingContent {
                digest: digest.clone(),
            })?
            .set_in_use()
    }

    /// Open a blob for reading.
    pub fn open_blob(&self, digest: &Digest) -> Result<BlobReader> {
        let record = self.record(digest).ok_or_else(|| Error::MissingContent {
            digest: digest.clone(),
        })?;

        BlobReader::open(record)
    }

    /// Stream content into the store, hashing it on the way.
    ///
    /// If the store already holds a blob with the same digest, it is reused and the streamed copy
    /// is discarded. Nothing becomes visible unless the whole stream was consumed successfully.
    pub async fn insert(&self, source: &mut (dyn ChunkSource + '_)) -> Result<StoredContent> {
        let scratch = self.scratch_path("insert");

        let hashed = match self.spool(source, &scratch).await {
            Ok(hashed) => hashed,
            Err(error) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                return Err(error);
            }
        };

        let result = self.commit(&scratch, &hashed.digest, hashed.length).await;
        if !matches!(result, Ok(false)) {
            let _ = tokio::fs::remove_file(&scratch).await;
        }
        let reused = result?;

        tracing::debug!(digest = %hashed.digest, length = hashed.length, reused, "stored content");

        Ok(StoredContent {
            digest: hashed.digest,
            length: hashed.length,
            checksums: hashed.checksums,
            reused,
        })
    }

    async fn spool(
        &self,
        source: &mut (dyn ChunkSource + '_),
        scratch: &Path,
    ) -> Result<crate::checksum::Hashed> {
        let mut file = tokio::fs::File::create(scratch)
            .await
            .map_err(Error::io("failed to create temporary file", scratch))?;
        let mut hasher = ChecksumHasher::new();

        while let Some(chunk) = source.next_chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(Error::io("failed to write temporary file", scratch))?;
        }

        file.flush()
            .await
            .map_err(Error::io("failed to flush temporary file", scratch))?;

        Ok(hasher.finalize())
    }

    /// Moves the spooled file into place unless a blob is reused. Returns whether it was reused.
    async fn commit(&self, scratch: &Path, digest: &Digest, length: u64) -> Result<bool> {
        loop {
            let existing = {
                let mut index = self.index();
                match index.get(digest) {
                    Some(existing) => Ok(existing.clone()),
                    None => {
                        let record = Arc::new(ContentStoreRecord::new(
                            digest.clone(),
                            length,
                            self.blob_path(digest),
                        ));
                        index.insert(digest.clone(), record.clone());
                        drop(index);

                        Err(record)
                    }
                }
            };
            let existing = match existing {
                Ok(existing) => existing,
                Err(record) => {
                    self.place(scratch, &record).await?;
                    return Ok(false);
                }
            };

            match existing.needs_reinsert(length, self.settle_timeout).await? {
                Reinsert::Reuse => return Ok(true),
                Reinsert::Replace => {
                    let mut index = self.index();
                    if index
                        .get(digest)
                        .is_some_and(|current| Arc::ptr_eq(current, &existing))
                    {
                        index.remove(digest);
                    }
                }
            }
        }
    }

    async fn place(&self, scratch: &Path, record: &ContentStoreRecord) -> Result<()> {
        let location = record.location();

        let placed = async {
            if let Some(parent) = location.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(Error::io("failed to create blob directory", parent))?;
            }

            tokio::fs::rename(scratch, &location)
                .await
                .map_err(Error::io("failed to move blob into place", &location))
        }
        .await;

        match placed {
            Ok(()) => {
                record.commit();
                Ok(())
            }
            Err(error) => {
                record.fail(error.to_string());
                Err(error)
            }
        }
    }

    /// Run one mark-and-sweep pass.
    ///
    /// Blobs referenced by any node in `nodes` are kept. Unreferenced blobs are deleted once they
    /// stayed idle across two consecutive passes and were not accessed since this pass started.
    pub async fn collect_garbage(&self, nodes: &dyn NodeStore) -> Result<GcReport> {
        let scan_start = Instant::now();
        let mut report = GcReport::default();

        self.deferred().retain(|record| match record.finish_deferred_delete() {
            Ok(done) => !done,
            Err(error) => {
                tracing::warn!(digest = %record.digest(), %error, "failed to finish deferred deletion");
                true
            }
        });

        let records: Vec<RecordRef> = self.index().values().cloned().collect();
        report.scanned = records.len();

        for record in &records {
            if record.update_gc_state() == GcDisposition::Remove {
                self.evict(record);
                report.evicted += 1;
            }
        }

        let referenced = nodes
            .referenced_digests()
            .await
            .map_err(Error::metadata("content references"))?;

        for record in &records {
            if !referenced.contains(record.digest()) {
                continue;
            }

            report.referenced += 1;
            if let Err(error) = record.set_in_use() {
                tracing::debug!(digest = %record.digest(), %error, "referenced record is unusable");
            }
        }

        for record in records
            .iter()
            .filter(|record| !referenced.contains(record.digest()))
        {
            let mut index = self.index();

            let tracked = index
                .get(record.digest())
                .is_some_and(|current| Arc::ptr_eq(current, record));
            if !tracked || !record.mark_for_deletion(scan_start) {
                continue;
            }

            report.marked += 1;

            // under the index lock, so a reinsert cannot race the physical delete
            match record.set_deleted(&self.scratch_path("deleted")) {
                Ok(Deletion::Removed) => {
                    index.remove(record.digest());
                    report.deleted += 1;
                    report.reclaimed_bytes += record.length();
                }
                Ok(Deletion::Deferred) => {
                    index.remove(record.digest());
                    report.deferred += 1;
                    self.deferred().push(record.clone());
                }
                Err(error) => {
                    tracing::warn!(digest = %record.digest(), %error, "failed to delete content blob");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            referenced = report.referenced,
            deleted = report.deleted,
            deferred = report.deferred,
            failed = report.failed,
            reclaimed_bytes = report.reclaimed_bytes,
            "garbage collection pass finished"
        );

        Ok(report)
    }

    fn evict(&self, record: &RecordRef) {
        if let Err(error) = record.finish_deferred_delete() {
            tracing::warn!(digest = %record.digest(), %error, "failed to remove deleted blob");
        }

        let mut index = self.index();
        if index
            .get(record.digest())
            .is_some_and(|current| Arc::ptr_eq(current, record))
        {
            index.remove(record.digest());
        }
    }
}
