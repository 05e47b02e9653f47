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
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::RecordRef;
use crate::errors::{Error, Result};

const CHUNK_SIZE: usize = 64 * 1024;

/// A stream of byte chunks, consumed by the content store while hashing.
#[async_trait::async_trait]
pub trait ChunkSource: Send {
    /// The next chunk, `None` once the stream is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait::async_trait]
impl ChunkSource for Bytes {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.is_empty() {
            return Ok(None);
        }

        Ok(Some(std::mem::take(self)))
    }
}

/// Adapts any [`AsyncRead`] into a [`ChunkSource`].
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
}

impl<R> ReaderSource<R> {
    /// Wrap a reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> ChunkSource for ReaderSource<R> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buffer = BytesMut::with_capacity(CHUNK_SIZE);

        let read = self
            .reader
            .read_buf(&mut buffer)
            .await
            .map_err(Error::io("failed to read source stream", "<stream>"))?;

        Ok((read > 0).then(|| buffer.freeze()))
    }
}

/// Reads a blob from the content store.
///
/// The record counts the reader as open until this is dropped; collection never removes a blob
/// while it is being read.
#[derive(Debug)]
pub struct BlobReader {
    file: tokio::fs::File,
    record: RecordRef,
}

impl BlobReader {
    pub(super) fn open(record: RecordRef) -> Result<Self> {
        let file = record.open_reader()?;

        Ok(Self {
            file: tokio::fs::File::from_std(file),
            record,
        })
    }

    /// The record backing this reader.
    pub fn record(&self) -> &RecordRef {
        &self.record
    }

    /// Read the remaining content into memory.
    pub async fn read_to_bytes(mut self) -> Result<Bytes> {
        let mut buffer = Vec::with_capacity(self.record.length() as usize);
        let location = self.record.location();

        self.file
            .read_to_end(&mut buffer)
            .await
            .map_err(Error::io("failed to read content blob", location))?;

        Ok(buffer.into())
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl Drop for BlobReader {
    fn drop(&mut self) {
        self.record.release_reader();
    }
}
