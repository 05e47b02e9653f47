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
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use strum::Display;
use tokio::sync::watch;

use crate::{
    checksum::Digest,
    errors::{Error, Result},
};

/// Lifecycle state of a [`ContentStoreRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RecordState {
    /// Created for a digest whose blob is not committed yet
    New,
    /// Committed and touched since the last collection scan
    InDbUsed,
    /// Committed, seen by a collection scan and not touched since
    InDbFound,
    /// Chosen for deletion by the current collection pass
    InDbMarkForDeletion,
    /// Deleted; the blob may still be held open by readers
    Deleted,
    /// The insert that created the record failed
    InError,
}

/// What a collection scan should do with a record after [`ContentStoreRecord::update_gc_state`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcDisposition {
    /// Keep the record in the index
    Keep,
    /// Drop the record from the index
    Remove,
}

/// Outcome of [`ContentStoreRecord::needs_reinsert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reinsert {
    /// The existing blob holds the same content and was marked in use
    Reuse,
    /// The existing record is gone or broken and must be replaced
    Replace,
}

/// Outcome of [`ContentStoreRecord::set_deleted`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deletion {
    /// The blob was removed from disk
    Removed,
    /// Readers hold the blob open, it was moved aside and will be removed later
    Deferred,
}

#[derive(Debug)]
struct Guarded {
    state: RecordState,
    last_access: Instant,
    open_readers: usize,
    idle_generations: u32,
    location: PathBuf,
    deferred_delete: bool,
    fault: Option<String>,
}

/// One unique blob in the [`ContentStore`](super::ContentStore).
///
/// All state transitions happen while holding the record's own lock, so the state and its
/// counters always change together. The lock is never held across an await point.
#[derive(Debug)]
pub struct ContentStoreRecord {
    digest: Digest,
    length: u64,
    created: DateTime<Utc>,
    in_use: AtomicBool,
    guarded: Mutex<Guarded>,
    settled: watch::Sender<bool>,
}

impl ContentStoreRecord {
    /// A record for a blob that is about to be committed at `location`.
    pub(crate) fn new(digest: Digest, length: u64, location: PathBuf) -> Self {
        Self::with_state(digest, length, location, RecordState::New, Utc::now())
    }

    /// A record for a blob that already exists on disk.
    pub(crate) fn committed(
        digest: Digest,
        length: u64,
        location: PathBuf,
        created: DateTime<Utc>,
    ) -> Self {
        Self::with_state(digest, length, location, RecordState::InDbUsed, created)
    }

    fn with_state(
        digest: Digest,
        length: u64,
        location: PathBuf,
        state: RecordState,
        created: DateTime<Utc>,
    ) -> Self {
        let settled = state != RecordState::New;
        let (settled, _) = watch::channel(settled);

        Self {
            digest,
            length,
            created,
            in_use: AtomicBool::new(state == RecordState::InDbUsed),
            guarded: Mutex::new(Guarded {
                state,
                last_access: Instant::now(),
                open_readers: 0,
                idle_generations: 0,
                location,
                deferred_delete: false,
                fault: None,
            }),
            settled,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Guarded> {
        self.guarded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, guarded: &mut Guarded, state: RecordState) {
        guarded.state = state;
        self.in_use
            .store(state == RecordState::InDbUsed, Ordering::Release);
    }

    /// Digest identifying the content.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Content length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// When the blob was committed.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecordState {
        self.lock().state
    }

    /// Number of readers currently holding the blob open.
    pub fn open_readers(&self) -> usize {
        self.lock().open_readers
    }

    /// Location of the blob on disk.
    pub fn location(&self) -> PathBuf {
        self.lock().location.clone()
    }

    /// Whether a deleted blob still waits for its readers to go away.
    pub fn is_deletion_deferred(&self) -> bool {
        self.lock().deferred_delete
    }

    /// The blob was moved into place: `New → InDbUsed`.
    pub(crate) fn commit(&self) {
        {
            let mut guarded = self.lock();
            if guarded.state == RecordState::New {
                self.transition(&mut guarded, RecordState::InDbUsed);
                guarded.last_access = Instant::now();
            }
        }
        self.settled.send_replace(true);
    }

    /// The insert failed: `New → InError`.
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        {
            let mut guarded = self.lock();
            self.transition(&mut guarded, RecordState::InError);
            guarded.fault = Some(reason.into());
        }
        self.settled.send_replace(true);
    }

    fn use_locked(&self, guarded: &mut Guarded) -> Result<()> {
        match guarded.state {
            RecordState::InDbMarkForDeletion | RecordState::Deleted => {
                Err(Error::RecordUnusable {
                    digest: self.digest.clone(),
                })
            }
            RecordState::InError => Err(Error::RecordFault {
                digest: self.digest.clone(),
                reason: guarded.fault.clone().unwrap_or_default(),
            }),
            RecordState::New => Ok(()),
            RecordState::InDbUsed | RecordState::InDbFound => {
                self.transition(guarded, RecordState::InDbUsed);
                guarded.last_access = Instant::now();
                guarded.idle_generations = 0;
                Ok(())
            }
        }
    }

    /// Mark the record as actively used.
    ///
    /// Refused once the record is marked for deletion or deleted, in which case the content must
    /// be inserted again.
    pub fn set_in_use(&self) -> Result<()> {
        if self.in_use.load(Ordering::Acquire) {
            return Ok(());
        }

        self.use_locked(&mut self.lock())
    }

    /// Open the blob for reading, counting the reader until [`release_reader`](Self::release_reader).
    pub(crate) fn open_reader(&self) -> Result<File> {
        let mut guarded = self.lock();
        self.use_locked(&mut guarded)?;

        if guarded.state == RecordState::New {
            return Err(Error::MissingContent {
                digest: self.digest.clone(),
            });
        }

        let file = File::open(&guarded.location).map_err(Error::io(
            "failed to open content blob",
            guarded.location.clone(),
        ))?;
        guarded.open_readers += 1;

        Ok(file)
    }

    pub(crate) fn release_reader(&self) {
        let mut guarded = self.lock();
        guarded.open_readers = guarded.open_readers.saturating_sub(1);
    }

    /// Wait (bounded) for an in-flight insert to settle, then decide whether new content with
    /// this digest and `length` can reuse the record.
    pub async fn needs_reinsert(&self, length: u64, wait: Duration) -> Result<Reinsert> {
        let mut settled = self.settled.subscribe();
        let waited = tokio::time::timeout(wait, settled.wait_for(|settled| *settled)).await;

        if waited.is_err() {
            return Err(Error::LockTimeout {
                target: format!("content {}", self.digest),
                waited: wait,
            });
        }

        let mut guarded = self.lock();
        match guarded.state {
            RecordState::InDbUsed | RecordState::InDbFound if length == self.length => {
                self.use_locked(&mut guarded)?;
                Ok(Reinsert::Reuse)
            }
            RecordState::InDbUsed | RecordState::InDbFound => Err(Error::DigestCollision {
                digest: self.digest.clone(),
                existing: self.length,
                computed: length,
            }),
            RecordState::InDbMarkForDeletion | RecordState::Deleted | RecordState::InError => {
                Ok(Reinsert::Replace)
            }
            // a settled record is never new
            RecordState::New => Ok(Reinsert::Replace),
        }
    }

    /// Scan start: age the record by one generation.
    pub fn update_gc_state(&self) -> GcDisposition {
        let mut guarded = self.lock();

        match guarded.state {
            RecordState::New => GcDisposition::Keep,
            RecordState::InDbUsed => {
                self.transition(&mut guarded, RecordState::InDbFound);
                guarded.idle_generations = 1;
                GcDisposition::Keep
            }
            RecordState::InDbFound => {
                guarded.idle_generations += 1;
                GcDisposition::Keep
            }
            RecordState::InDbMarkForDeletion => {
                tracing::error!(
                    digest = %self.digest,
                    "content record still marked for deletion at scan start"
                );
                GcDisposition::Keep
            }
            RecordState::Deleted | RecordState::InError => GcDisposition::Remove,
        }
    }

    /// End of pass: mark the record if it stayed idle for two generations and was not accessed
    /// since `scan_start`.
    pub fn mark_for_deletion(&self, scan_start: Instant) -> bool {
        let mut guarded = self.lock();

        let idle = guarded.state == RecordState::InDbFound
            && guarded.last_access < scan_start
            && guarded.idle_generations >= 2;

        if idle {
            self.transition(&mut guarded, RecordState::InDbMarkForDeletion);
        }

        idle
    }

    /// Delete the blob. With open readers, the blob is moved to `graveyard` instead and removed by
    /// [`finish_deferred_delete`](Self::finish_deferred_delete).
    ///
    /// When the blob cannot be removed or moved, the record falls back to
    /// [`RecordState::InDbFound`] and stays a deletion candidate.
    pub fn set_deleted(&self, graveyard: &Path) -> Result<Deletion> {
        let mut guarded = self.lock();

        let outcome = if guarded.open_readers == 0 {
            remove_blob(&guarded.location).map(|()| Deletion::Removed)
        } else {
            std::fs::rename(&guarded.location, graveyard)
                .map_err(Error::io("failed to set aside content blob", graveyard))
                .map(|()| Deletion::Deferred)
        };

        let deletion = match outcome {
            Ok(deletion) => deletion,
            Err(error) => {
                self.transition(&mut guarded, RecordState::InDbFound);
                return Err(error);
            }
        };

        self.transition(&mut guarded, RecordState::Deleted);
        if deletion == Deletion::Deferred {
            guarded.location = graveyard.to_path_buf();
            guarded.deferred_delete = true;

            tracing::warn!(
                digest = %self.digest,
                readers = guarded.open_readers,
                "deferring physical deletion of content blob"
            );
        }

        Ok(deletion)
    }

    /// Remove a deferred blob once the last reader is gone. Returns whether nothing is left to do.
    pub fn finish_deferred_delete(&self) -> Result<bool> {
        let mut guarded = self.lock();

        if !guarded.deferred_delete {
            return Ok(true);
        }
        if guarded.open_readers > 0 {
            return Ok(false);
        }

        remove_blob(&guarded.location)?;
        guarded.deferred_delete = false;

        Ok(true)
    }
}

fn remove_blob(location: &Path) -> Result<()> {
    match std::fs::remove_file(location) {
        Err(error) if error.kind() != ErrorKind::NotFound => {
            Err(Error::io("failed to delete content blob", location)(error))
        }
        _ => Ok(()),
    }
}

/// A shared record.
pub type RecordRef = Arc<ContentStoreRecord>;
