//! Resumable chunked download.
//!
//! A [`ReadChannel`] fetches an object one range request at a time. When a
//! body stream breaks or ends early the same chunk is re-requested from the
//! exact stored offset reached, so callers see each byte once and in order.
//! The first response locks the object generation; every later request
//! carries it and a change is fatal.

use bytes::{Buf, Bytes};
use flate2::write::GzDecoder;
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::transport::{ReadRequest, ReadResponse, Transport};
use crate::{
    ByteRange, ByteStream, ChecksumHasher, Generation, ObjectChecksums, ObjectId, RetryPolicy,
    RetryState, TransferError, TransferResult,
};

/// Options for a read channel
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Stored bytes requested per range GET
    pub chunk_size: u64,
    /// Decode `content-encoding: gzip` objects while reading
    pub decompress: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            decompress: false,
        }
    }
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes.max(1);
        self
    }

    pub fn decompress(mut self, enabled: bool) -> Self {
        self.decompress = enabled;
        self
    }
}

/// Cancels the in-flight I/O of a channel from another task
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct ActiveChunk {
    body: ByteStream,
    /// Stored offset one past the last byte of this chunk
    end: u64,
}

/// Resumable reader over a remote object
pub struct ReadChannel<T: Transport + ?Sized = dyn Transport> {
    transport: Arc<T>,
    object: ObjectId,
    policy: RetryPolicy,
    chunk_size: u64,
    decompress: bool,

    /// Caller-visible position (decoded space when decompressing)
    position: u64,
    /// Stored bytes received from the service
    encoded_offset: u64,
    limit: Option<u64>,
    /// Decoded bytes still to discard after a seek before the first read
    skip: u64,

    locked_generation: Option<Generation>,
    object_size: Option<u64>,
    started: bool,
    active: Option<ActiveChunk>,
    /// Budget of the chunk in flight, shared by all of its resumes
    retry: Option<RetryState>,
    pending: Bytes,
    decoder: Option<GzDecoder<Vec<u8>>>,
    hasher: Option<ChecksumHasher>,
    expected: ObjectChecksums,

    eof: bool,
    closed: bool,
    cancel: CancellationToken,
}

impl<T: Transport + ?Sized> ReadChannel<T> {
    pub fn new(transport: Arc<T>, object: ObjectId, policy: RetryPolicy, options: ReadOptions) -> Self {
        let locked_generation = object.generation.clone();
        Self {
            transport,
            object,
            policy,
            chunk_size: options.chunk_size.max(1),
            decompress: options.decompress,
            position: 0,
            encoded_offset: 0,
            limit: None,
            skip: 0,
            locked_generation,
            object_size: None,
            started: false,
            active: None,
            retry: None,
            pending: Bytes::new(),
            decoder: None,
            hasher: None,
            expected: ObjectChecksums::default(),
            eof: false,
            closed: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    /// Caller-visible position of the next byte
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Generation pinned by the first response (or by the caller)
    pub fn locked_generation(&self) -> Option<&Generation> {
        self.locked_generation.as_ref()
    }

    /// Stored size, known after the first response
    pub fn object_size(&self) -> Option<u64> {
        self.object_size
    }

    pub fn is_decoding(&self) -> bool {
        self.decoder.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.cancel.clone())
    }

    pub fn set_chunk_size(&mut self, bytes: u64) {
        self.chunk_size = bytes.max(1);
    }

    /// Stop reading at `end` (exclusive); clamped to the object size
    pub fn limit(&mut self, end: u64) {
        self.limit = Some(end);
    }

    /// Move to `offset`.
    ///
    /// Raw channels may seek at any time. A decompressing channel can only
    /// seek before its first read, since the decoder cannot start mid-stream.
    pub fn seek(&mut self, offset: u64) -> TransferResult<()> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        if self.decoder.is_some() {
            return Err(TransferError::invalid(
                "cannot seek a decompressing channel after reading started",
            ));
        }
        if self.decompress && !self.started {
            self.position = offset;
            self.skip = offset;
            return Ok(());
        }
        if offset == self.position {
            return Ok(());
        }

        self.active = None;
        self.retry = None;
        self.pending = Bytes::new();
        self.hasher = None;
        self.position = offset;
        self.encoded_offset = offset;
        self.eof = false;
        Ok(())
    }

    /// Cancel in-flight I/O and release the channel. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.cancel.cancel();
        self.active = None;
        self.pending = Bytes::new();
        self.decoder = None;
        self.closed = true;
        debug!(object = %self.object, position = self.position, "read channel closed");
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` means end of object (or limit)
    pub async fn read(&mut self, buf: &mut [u8]) -> TransferResult<usize> {
        if self.closed {
            return Err(TransferError::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.pending.is_empty() {
                let n = self.deliver(buf);
                if n > 0 || self.limit_reached() {
                    return Ok(n);
                }
                continue;
            }
            if self.eof || self.limit_reached() {
                return Ok(0);
            }
            self.fill().await?;
        }
    }

    /// Read everything left into `out`, returning the number of bytes appended
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> TransferResult<usize> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit.map_or(false, |limit| self.position >= limit)
    }

    fn deliver(&mut self, buf: &mut [u8]) -> usize {
        if self.skip > 0 {
            let dropped = self.skip.min(self.pending.len() as u64);
            self.pending.advance(dropped as usize);
            self.skip -= dropped;
        }

        let mut n = buf.len().min(self.pending.len());
        if let Some(limit) = self.limit {
            n = n.min(limit.saturating_sub(self.position) as usize);
        }
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        self.position += n as u64;
        n
    }

    /// Receive stored bytes until something is pending or the object ends
    async fn fill(&mut self) -> TransferResult<()> {
        loop {
            if self.active.is_none() && !self.open_chunk().await? {
                return self.finish();
            }

            let next = match self.active.as_mut() {
                Some(active) => {
                    self.policy
                        .attempt(&self.cancel, async {
                            Ok::<_, TransferError>(active.body.next().await)
                        })
                        .await
                }
                None => continue,
            };

            match next {
                Ok(Some(Ok(bytes))) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.encoded_offset += bytes.len() as u64;
                    self.ingest(bytes)?;
                    if !self.pending.is_empty() {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    let end = self.active.take().map_or(0, |a| a.end);
                    if self.encoded_offset >= end {
                        // Chunk landed; its budget is spent
                        self.retry = None;
                        continue;
                    }
                    self.resume(TransferError::transient(format!(
                        "stream ended at {} before {end}",
                        self.encoded_offset
                    )))
                    .await?;
                }
                Ok(Some(Err(e))) => {
                    self.active = None;
                    self.resume(TransferError::from(e)).await?;
                }
                Err(e) => {
                    self.active = None;
                    self.resume(e).await?;
                }
            }
        }
    }

    /// Charge a failure to the current chunk's budget and wait before resuming
    async fn resume(&mut self, error: TransferError) -> TransferResult<()> {
        let policy = &self.policy;
        let state = self.retry.get_or_insert_with(|| policy.start());
        let delay = state.record_failure(policy, error)?;
        debug!(
            object = %self.object,
            offset = self.encoded_offset,
            attempt = state.attempt(),
            "resuming read"
        );
        self.policy.pause(delay, &self.cancel).await
    }

    fn next_range(&self) -> Option<ByteRange> {
        let start = self.encoded_offset;
        let mut end = start.saturating_add(self.chunk_size);
        // The limit is in stored space unless decoding
        if !self.decompress {
            if let Some(limit) = self.limit {
                end = end.min(limit);
            }
        }
        if let Some(size) = self.object_size {
            end = end.min(size);
        }
        if start >= end {
            return None;
        }
        Some(ByteRange::new(start, Some(end)))
    }

    /// Issue the GET for the next chunk; `false` means nothing is left
    #[instrument(skip(self), fields(object = %self.object, offset = self.encoded_offset))]
    async fn open_chunk(&mut self) -> TransferResult<bool> {
        loop {
            let Some(range) = self.next_range() else {
                return Ok(false);
            };
            let request = ReadRequest {
                object: self.object.clone(),
                range,
                if_generation_match: self.locked_generation.clone(),
            };

            let result = self
                .policy
                .attempt(&self.cancel, self.transport.read_range(request))
                .await;
            match result {
                Ok(response) => {
                    if self.accept(response, range)? {
                        return Ok(true);
                    }
                }
                Err(e) if e.status() == Some(416) => {
                    debug!(offset = range.start, "range past end of object");
                    return Ok(false);
                }
                Err(e) if e.status() == Some(412) => {
                    if let Some(expected) = self.locked_generation.clone() {
                        self.close();
                        return Err(TransferError::GenerationChanged {
                            expected,
                            actual: None,
                        });
                    }
                    return Err(e);
                }
                Err(e) => self.resume(e).await?,
            }
        }
    }

    /// Take a response as the active chunk; `false` asks for a new request
    fn accept(&mut self, response: ReadResponse, range: ByteRange) -> TransferResult<bool> {
        match &self.locked_generation {
            Some(locked) if *locked != response.generation => {
                let expected = locked.clone();
                self.close();
                return Err(TransferError::GenerationChanged {
                    expected,
                    actual: Some(response.generation),
                });
            }
            Some(_) => {}
            None => {
                debug!(object = %self.object, generation = %response.generation, "generation locked");
                self.locked_generation = Some(response.generation.clone());
            }
        }
        self.object_size = Some(response.object_size);

        if !self.started {
            self.started = true;
            let gzip = response
                .content_encoding
                .as_deref()
                .map_or(false, |e| e.eq_ignore_ascii_case("gzip"));
            if self.decompress && gzip {
                self.decoder = Some(GzDecoder::new(Vec::new()));
            } else if self.decompress {
                // Stored bytes are the content; positions are raw from here on
                self.decompress = false;
                self.skip = 0;
                if self.position != range.start {
                    self.encoded_offset = self.position;
                    return Ok(false);
                }
            }
            if range.start == 0 && !response.checksums.is_empty() {
                self.hasher = Some(ChecksumHasher::new());
                self.expected = response.checksums;
            }
        }

        let end = range
            .end
            .map_or(response.object_size, |e| e.min(response.object_size));
        self.active = Some(ActiveChunk {
            body: response.body,
            end,
        });
        Ok(true)
    }

    fn ingest(&mut self, bytes: Bytes) -> TransferResult<()> {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&bytes);
        }
        match self.decoder.as_mut() {
            Some(decoder) => {
                decoder.write_all(&bytes)?;
                decoder.flush()?;
                self.pending = Bytes::from(std::mem::take(decoder.get_mut()));
            }
            None => self.pending = bytes,
        }
        Ok(())
    }

    /// End of the stored stream: flush the decoder and verify the digest
    fn finish(&mut self) -> TransferResult<()> {
        self.eof = true;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.try_finish()?;
            let tail = std::mem::take(decoder.get_mut());
            if !tail.is_empty() {
                self.pending = Bytes::from(tail);
            }
        }

        if let (Some(hasher), Some(size)) = (self.hasher.take(), self.object_size) {
            if hasher.bytes_hashed() == size {
                self.expected.verify(&hasher.finish())?;
                debug!(object = %self.object, bytes = size, "checksum verified");
            }
        }
        Ok(())
    }
}

impl<T: Transport + ?Sized> Drop for ReadChannel<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
