//! Resumable chunked upload.
//!
//! A [`WriteChannel`] buffers caller bytes and ships them into a server-side
//! resumable session in aligned chunks. After any failure the server's
//! committed offset decides what is re-sent, so acknowledged bytes never go
//! over the wire twice. A channel can be captured into a [`WriteSnapshot`]
//! and restored later, in another process if need be.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::read::AbortHandle;
use crate::transport::{align_chunk_size, ChunkUpload, SessionStatus, StartUpload, Transport};
use crate::{
    ChecksumHasher, ObjectChecksums, ObjectId, ObjectInfo, Preconditions, RetryPolicy, RetryState,
    SessionHandle, TransferError, TransferResult,
};

/// Current [`WriteSnapshot`] layout
pub const SNAPSHOT_VERSION: u32 = 1;

/// Options for a write channel; they travel with snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Bytes per chunk, rounded up to the chunk alignment
    pub chunk_size: u64,
    /// Sent on the session-start request only
    pub preconditions: Preconditions,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Expected whole-object checksums; computed from the written bytes when absent
    pub checksums: Option<ObjectChecksums>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024 * 1024,
            preconditions: Preconditions::default(),
            content_type: None,
            content_encoding: None,
            checksums: None,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_preconditions(mut self, preconditions: Preconditions) -> Self {
        self.preconditions = preconditions;
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding<S: Into<String>>(mut self, encoding: S) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_checksums(mut self, checksums: ObjectChecksums) -> Self {
        self.checksums = Some(checksums);
        self
    }
}

/// Serializable state of an unfinished write channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSnapshot {
    pub version: u32,
    pub object: ObjectId,
    /// Absent if no byte reached the network yet
    pub session: Option<SessionHandle>,
    /// Bytes the server had acknowledged at capture time
    pub committed: u64,
    /// Buffered bytes after `committed`
    #[serde(with = "base64_bytes")]
    pub pending: Vec<u8>,
    pub chunk_size: u64,
    /// Running CRC32C over everything written
    pub crc32c: u32,
    pub hashed_bytes: u64,
    pub options: WriteOptions,
}

impl WriteSnapshot {
    pub fn to_json(&self) -> TransferResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> TransferResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Resumable writer into a new object
pub struct WriteChannel<T: Transport + ?Sized = dyn Transport> {
    transport: Arc<T>,
    object: ObjectId,
    policy: RetryPolicy,
    options: WriteOptions,
    chunk_size: u64,

    session: Option<SessionHandle>,
    /// Bytes the server has persisted
    committed: u64,
    /// Bytes `[committed, committed + buffer.len())`
    buffer: BytesMut,
    hasher: ChecksumHasher,
    /// Ask the server for its committed offset before sending again
    needs_sync: bool,
    /// Whether the transport reports committed offsets
    session_query: bool,

    finished: Option<ObjectInfo>,
    aborted: bool,
    /// A flush or close gave up; only capture and abort remain
    failed: bool,
    cancel: CancellationToken,
}

impl<T: Transport + ?Sized> WriteChannel<T> {
    pub fn new(transport: Arc<T>, object: ObjectId, policy: RetryPolicy, options: WriteOptions) -> Self {
        let chunk_size = align_chunk_size(options.chunk_size);
        let session_query = transport.capabilities().supports_session_query;
        Self {
            transport,
            object: object.latest(),
            policy,
            options,
            chunk_size,
            session: None,
            committed: 0,
            buffer: BytesMut::new(),
            hasher: ChecksumHasher::new(),
            needs_sync: false,
            session_query,
            finished: None,
            aborted: false,
            failed: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Rebuild a channel from a snapshot without touching the network.
    ///
    /// The first flush asks the server for its committed offset, so bytes
    /// acknowledged after the capture are not sent again.
    pub fn restore(transport: Arc<T>, snapshot: WriteSnapshot, policy: RetryPolicy) -> TransferResult<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(TransferError::invalid(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        let written = snapshot.committed + snapshot.pending.len() as u64;
        if snapshot.hashed_bytes != written {
            return Err(TransferError::invalid(format!(
                "snapshot hashed {} bytes but holds {written}",
                snapshot.hashed_bytes
            )));
        }
        if snapshot.session.is_none() && snapshot.committed != 0 {
            return Err(TransferError::invalid("snapshot has committed bytes but no session"));
        }

        let needs_sync = snapshot.session.is_some();
        let session_query = transport.capabilities().supports_session_query;
        Ok(Self {
            transport,
            object: snapshot.object,
            policy,
            options: snapshot.options,
            chunk_size: align_chunk_size(snapshot.chunk_size),
            session: snapshot.session,
            committed: snapshot.committed,
            buffer: BytesMut::from(&snapshot.pending[..]),
            hasher: ChecksumHasher::resume_crc32c(snapshot.crc32c, snapshot.hashed_bytes),
            needs_sync,
            session_query,
            finished: None,
            aborted: false,
            failed: false,
            cancel: CancellationToken::new(),
        })
    }

    pub fn object(&self) -> &ObjectId {
        &self.object
    }

    /// Server-acknowledged byte count
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Bytes accepted by `write` so far
    pub fn written(&self) -> u64 {
        self.committed + self.buffer.len() as u64
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// Effective chunk size after alignment
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.cancel.clone())
    }

    /// True once a write or close failed; the channel can still be captured
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn ensure_open(&self) -> TransferResult<()> {
        if self.failed {
            return Err(TransferError::Closed);
        }
        self.ensure_unfinished()
    }

    fn ensure_unfinished(&self) -> TransferResult<()> {
        if self.aborted || self.finished.is_some() {
            return Err(TransferError::Closed);
        }
        Ok(())
    }

    /// Buffer `data`, shipping every full chunk.
    ///
    /// Once accepted, `data` belongs to the upload even if shipping it fails:
    /// the error is terminal and the channel refuses further writes. Use
    /// [`capture`](Self::capture) to continue elsewhere.
    pub async fn write(&mut self, data: &[u8]) -> TransferResult<usize> {
        self.ensure_open()?;
        self.hasher.update(data);
        self.buffer.extend_from_slice(data);
        while self.buffer.len() as u64 >= self.chunk_size {
            if let Err(e) = self.flush_chunk().await {
                self.failed = true;
                return Err(e);
            }
        }
        Ok(data.len())
    }

    /// Capture everything needed to continue this upload later.
    /// Allowed after a failed write or close.
    pub fn capture(&self) -> TransferResult<WriteSnapshot> {
        self.ensure_unfinished()?;
        Ok(WriteSnapshot {
            version: SNAPSHOT_VERSION,
            object: self.object.clone(),
            session: self.session.clone(),
            committed: self.committed,
            pending: self.buffer.to_vec(),
            chunk_size: self.chunk_size,
            crc32c: self.hasher.crc32c(),
            hashed_bytes: self.hasher.bytes_hashed(),
            options: self.options.clone(),
        })
    }

    /// Finalize the object. Idempotent: later calls return the same info.
    /// A failure is terminal, like a failed write.
    pub async fn close(&mut self) -> TransferResult<ObjectInfo> {
        if let Some(info) = &self.finished {
            return Ok(info.clone());
        }
        self.ensure_open()?;
        let result = self.finalize().await;
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    #[instrument(skip(self), fields(object = %self.object, written = self.written()))]
    async fn finalize(&mut self) -> TransferResult<ObjectInfo> {
        while self.buffer.len() as u64 > self.chunk_size {
            self.flush_chunk().await?;
        }

        let session = self.ensure_session().await?;
        let total = self.written();
        let checksums = self
            .options
            .checksums
            .clone()
            .unwrap_or_else(|| self.hasher.finish());
        let mut state = self.policy.start();

        loop {
            if self.needs_sync {
                match self.sync(&session).await {
                    Ok(Some(info)) => return Ok(self.finish(info)),
                    Ok(None) => {}
                    Err(e) => {
                        self.charge(&mut state, e).await?;
                        continue;
                    }
                }
            }

            let chunk = ChunkUpload {
                offset: self.committed,
                data: Bytes::copy_from_slice(&self.buffer),
                total_size: Some(total),
                checksums: Some(checksums.clone()),
            };
            let result = self
                .policy
                .attempt(&self.cancel, self.transport.put_chunk(&session, chunk))
                .await;

            match result {
                Ok(SessionStatus::Finalized(info)) => return Ok(self.finish(info)),
                Ok(SessionStatus::Persisted { committed }) => {
                    let before = self.committed;
                    self.advance_to(committed)?;
                    if committed == before {
                        self.charge(&mut state, TransferError::transient("final chunk not persisted"))
                            .await?;
                    }
                }
                Err(e) if e.status() == Some(410) => {
                    // A lost response may hide an earlier success
                    if let Some(info) = self.sync(&session).await? {
                        return Ok(self.finish(info));
                    }
                    return Err(e);
                }
                Err(e) => {
                    self.needs_sync = true;
                    self.charge(&mut state, e).await?;
                }
            }
        }
    }

    /// Cancel the server session and discard buffered bytes
    pub async fn abort(&mut self) -> TransferResult<()> {
        if self.aborted {
            return Ok(());
        }
        self.ensure_unfinished()?;
        self.aborted = true;
        self.buffer.clear();
        self.cancel.cancel();
        if let Some(session) = self.session.take() {
            match self.transport.cancel_session(&session).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            debug!(object = %self.object, %session, "resumable session cancelled");
        }
        Ok(())
    }

    async fn ensure_session(&mut self) -> TransferResult<SessionHandle> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }

        let request = StartUpload {
            object: self.object.clone(),
            preconditions: self.options.preconditions.clone(),
            content_type: self.options.content_type.clone(),
            content_encoding: self.options.content_encoding.clone(),
        };
        let transport = &self.transport;
        let session = self
            .policy
            .run(&self.cancel, move || transport.start_resumable(request.clone()))
            .await?;

        debug!(object = %self.object, %session, "resumable session started");
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Ship exactly one aligned chunk from the front of the buffer
    #[instrument(skip(self), fields(object = %self.object, committed = self.committed))]
    async fn flush_chunk(&mut self) -> TransferResult<()> {
        let session = self.ensure_session().await?;
        let mut state = self.policy.start();
        let chunk_end = self.committed + self.chunk_size;

        loop {
            if self.needs_sync {
                match self.sync(&session).await {
                    Ok(None) => {}
                    Ok(Some(_)) => {
                        return Err(TransferError::invalid(
                            "session finalized before its final chunk",
                        ))
                    }
                    Err(e) => {
                        self.charge(&mut state, e).await?;
                        continue;
                    }
                }
            }
            if self.committed >= chunk_end {
                return Ok(());
            }

            let len = (chunk_end - self.committed) as usize;
            let chunk = ChunkUpload {
                offset: self.committed,
                data: Bytes::copy_from_slice(&self.buffer[..len]),
                total_size: None,
                checksums: None,
            };
            let result = self
                .policy
                .attempt(&self.cancel, self.transport.put_chunk(&session, chunk))
                .await;

            match result {
                Ok(SessionStatus::Persisted { committed }) => {
                    let before = self.committed;
                    self.advance_to(committed)?;
                    if committed == before {
                        self.charge(&mut state, TransferError::transient("chunk not persisted"))
                            .await?;
                    } else if committed < chunk_end {
                        debug!(committed, chunk_end, "partial acknowledgement, sending the rest");
                    }
                }
                Ok(SessionStatus::Finalized(_)) => {
                    return Err(TransferError::invalid(
                        "session finalized before its final chunk",
                    ))
                }
                Err(e) => {
                    self.needs_sync = true;
                    self.charge(&mut state, e).await?;
                }
            }
        }
    }

    /// Adopt the server's committed offset; `Some` if the object already exists
    async fn sync(&mut self, session: &SessionHandle) -> TransferResult<Option<ObjectInfo>> {
        if !self.session_query {
            self.needs_sync = false;
            return Ok(None);
        }
        let result = self
            .policy
            .attempt(&self.cancel, self.transport.query_session(session))
            .await;
        match result {
            Ok(SessionStatus::Persisted { committed }) => {
                debug!(committed, local = self.committed, "server committed offset");
                self.advance_to(committed)?;
                self.needs_sync = false;
                Ok(None)
            }
            Ok(SessionStatus::Finalized(info)) => {
                self.needs_sync = false;
                Ok(Some(info))
            }
            Err(TransferError::Unsupported) => {
                // Fall back to our own bookkeeping
                self.needs_sync = false;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop bytes the server confirmed; refuse offsets we never sent
    fn advance_to(&mut self, committed: u64) -> TransferResult<()> {
        let buffered_end = self.written();
        if committed < self.committed || committed > buffered_end {
            return Err(TransferError::invalid(format!(
                "server committed offset {committed} outside [{}, {buffered_end}]",
                self.committed
            )));
        }
        self.buffer.advance((committed - self.committed) as usize);
        self.committed = committed;
        Ok(())
    }

    async fn charge(&self, state: &mut RetryState, error: TransferError) -> TransferResult<()> {
        let delay = state.record_failure(&self.policy, error)?;
        self.policy.pause(delay, &self.cancel).await
    }

    fn finish(&mut self, info: ObjectInfo) -> ObjectInfo {
        info!(
            object = %info.id,
            size_bytes = info.size_bytes,
            "resumable upload finalized"
        );
        self.committed = info.size_bytes;
        self.buffer.clear();
        self.finished = Some(info.clone());
        info
    }
}
