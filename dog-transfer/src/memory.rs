//! In-memory transport for tests and local development.
//!
//! Behaves like a strict resumable/multipart object service: generations
//! increase on every write, preconditions are enforced, non-final resumable
//! chunks must be aligned and multipart completion checks every ETag.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::transport::{
    ChunkUpload, MultipartTransport, ReadRequest, ReadResponse, SessionStatus, StartUpload,
    Transport, TransportCapabilities, CHUNK_ALIGNMENT,
};
use crate::{
    CompletedPart, Generation, ObjectChecksums, ObjectId, ObjectInfo, PartInfo, Preconditions,
    SessionHandle, TransferError, TransferResult, UploadId,
};

/// Body pieces handed out per stream item
const STREAM_PIECE: usize = 64 * 1024;

/// Highest part number the service accepts
pub const MAX_PART_NUMBER: u32 = 10_000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: i64,
    metageneration: i64,
    etag: String,
    content_type: Option<String>,
    content_encoding: Option<String>,
    checksums: ObjectChecksums,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ResumableSession {
    object: ObjectId,
    preconditions: Preconditions,
    content_type: Option<String>,
    content_encoding: Option<String>,
    buffer: Vec<u8>,
    finalized: Option<ObjectInfo>,
}

#[derive(Debug)]
struct StoredPart {
    data: Bytes,
    etag: String,
    md5: [u8; 16],
}

#[derive(Debug)]
struct MultipartUpload {
    object: ObjectId,
    preconditions: Preconditions,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, HashMap<String, StoredObject>>,
    last_generation: i64,
    sessions: HashMap<SessionHandle, ResumableSession>,
    uploads: HashMap<UploadId, MultipartUpload>,
}

/// In-memory object service implementing both transport traits
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<RwLock<State>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`create_bucket`](Self::create_bucket)
    pub fn with_bucket<S: Into<String>>(self, bucket: S) -> Self {
        self.create_bucket(bucket);
        self
    }

    pub fn create_bucket<S: Into<String>>(&self, bucket: S) {
        self.state.write().buckets.entry(bucket.into()).or_default();
    }

    /// Store an object directly, bypassing sessions. Bumps the generation.
    pub fn put_object<B: Into<Bytes>>(
        &self,
        bucket: &str,
        name: &str,
        data: B,
        content_encoding: Option<&str>,
    ) -> TransferResult<ObjectInfo> {
        let data = data.into();
        let checksums = ObjectChecksums::compute(&data);
        let etag = quoted(&checksums.md5_hex().unwrap_or_default());
        let mut state = self.state.write();
        state.store(
            &ObjectId::new(bucket, name),
            data,
            etag,
            None,
            content_encoding.map(str::to_string),
            checksums,
        )
    }

    /// Current bytes of the live generation
    pub fn object_bytes(&self, object: &ObjectId) -> Option<Bytes> {
        let state = self.state.read();
        state.live(object).ok().map(|o| o.data.clone())
    }

    pub fn object_info(&self, object: &ObjectId) -> Option<ObjectInfo> {
        let state = self.state.read();
        state
            .live(object)
            .ok()
            .map(|o| object_info(&object.bucket, &object.name, o))
    }

    pub fn delete_object(&self, object: &ObjectId) -> TransferResult<()> {
        let mut state = self.state.write();
        state
            .buckets
            .get_mut(&object.bucket)
            .and_then(|objects| objects.remove(&object.name))
            .map(|_| ())
            .ok_or_else(|| TransferError::not_found(object.to_string()))
    }

    /// Resumable sessions that are neither finalized nor cancelled
    pub fn open_sessions(&self) -> usize {
        self.state
            .read()
            .sessions
            .values()
            .filter(|s| s.finalized.is_none())
            .count()
    }

    /// Multipart uploads that are neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state.read().uploads.len()
    }
}

fn quoted(tag: &str) -> String {
    format!("\"{tag}\"")
}

fn object_info(bucket: &str, name: &str, object: &StoredObject) -> ObjectInfo {
    ObjectInfo {
        id: ObjectId::new(bucket, name).with_generation(object.generation),
        size_bytes: object.data.len() as u64,
        etag: Some(object.etag.clone()),
        content_type: object.content_type.clone(),
        content_encoding: object.content_encoding.clone(),
        checksums: object.checksums.clone(),
        updated_at: object.updated_at,
    }
}

fn precondition_failed(message: impl Into<String>) -> TransferError {
    TransferError::from_status(412, message)
}

fn check_preconditions(existing: Option<&StoredObject>, preconditions: &Preconditions) -> TransferResult<()> {
    let live = existing.map(|o| Generation::from(o.generation));

    if preconditions.does_not_exist && existing.is_some() {
        return Err(precondition_failed("object already exists"));
    }
    if let Some(expected) = &preconditions.if_generation_match {
        let matches = match &live {
            Some(generation) => generation == expected,
            // Generation 0 is the conventional "must not exist"
            None => expected.as_str() == "0",
        };
        if !matches {
            return Err(precondition_failed(format!(
                "generation {expected} does not match"
            )));
        }
    }
    if let Some(rejected) = &preconditions.if_generation_not_match {
        if live.as_ref() == Some(rejected) {
            return Err(precondition_failed(format!(
                "generation {rejected} still live"
            )));
        }
    }
    if let Some(expected) = preconditions.if_metageneration_match {
        if existing.map(|o| o.metageneration) != Some(expected) {
            return Err(precondition_failed(format!(
                "metageneration {expected} does not match"
            )));
        }
    }
    Ok(())
}

impl State {
    fn bucket(&self, bucket: &str) -> TransferResult<&HashMap<String, StoredObject>> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| TransferError::not_found(format!("bucket {bucket}")))
    }

    fn existing(&self, object: &ObjectId) -> TransferResult<Option<&StoredObject>> {
        Ok(self.bucket(&object.bucket)?.get(&object.name))
    }

    /// The live generation, or 404 if absent or not the pinned one
    fn live(&self, object: &ObjectId) -> TransferResult<&StoredObject> {
        let stored = self
            .existing(object)?
            .ok_or_else(|| TransferError::not_found(object.to_string()))?;
        if let Some(pinned) = &object.generation {
            if *pinned != Generation::from(stored.generation) {
                return Err(TransferError::not_found(object.to_string()));
            }
        }
        Ok(stored)
    }

    fn store(
        &mut self,
        object: &ObjectId,
        data: Bytes,
        etag: String,
        content_type: Option<String>,
        content_encoding: Option<String>,
        checksums: ObjectChecksums,
    ) -> TransferResult<ObjectInfo> {
        self.last_generation += 1;
        let generation = self.last_generation;
        let objects = self
            .buckets
            .get_mut(&object.bucket)
            .ok_or_else(|| TransferError::not_found(format!("bucket {}", object.bucket)))?;

        let stored = StoredObject {
            data,
            generation,
            metageneration: 1,
            etag,
            content_type,
            content_encoding,
            checksums,
            updated_at: Utc::now(),
        };
        let info = object_info(&object.bucket, &object.name, &stored);
        objects.insert(object.name.clone(), stored);
        Ok(info)
    }

    fn read(&self, request: &ReadRequest) -> TransferResult<ReadResponse> {
        let stored = self.live(&request.object)?;
        let generation = Generation::from(stored.generation);
        if let Some(expected) = &request.if_generation_match {
            if *expected != generation {
                return Err(precondition_failed(format!(
                    "generation {expected} is no longer live"
                )));
            }
        }

        let size = stored.data.len() as u64;
        let start = request.range.start;
        if start >= size && !(start == 0 && size == 0) {
            return Err(TransferError::from_status(
                416,
                format!("range start {start} beyond object size {size}"),
            ));
        }
        let end = request.range.end.map_or(size, |e| e.min(size)).max(start);
        let slice = stored.data.slice(start as usize..end as usize);
        let pieces: Vec<Bytes> = slice
            .chunks(STREAM_PIECE)
            .map(|piece| slice.slice_ref(piece))
            .collect();

        Ok(ReadResponse {
            generation,
            object_size: size,
            content_encoding: stored.content_encoding.clone(),
            checksums: stored.checksums.clone(),
            body: Box::pin(futures_util::stream::iter(pieces.into_iter().map(Ok))),
        })
    }

    fn put_chunk(&mut self, handle: &SessionHandle, chunk: ChunkUpload) -> TransferResult<SessionStatus> {
        let session = self
            .sessions
            .get_mut(handle)
            .ok_or_else(|| TransferError::not_found(format!("session {handle}")))?;
        if session.finalized.is_some() {
            return Err(TransferError::from_status(410, "session already finalized"));
        }

        let committed = session.buffer.len() as u64;
        if chunk.offset > committed {
            return Err(TransferError::from_status(
                400,
                format!("chunk offset {} past committed {committed}", chunk.offset),
            ));
        }
        if !chunk.is_final() && chunk.data.len() as u64 % CHUNK_ALIGNMENT != 0 {
            return Err(TransferError::from_status(
                400,
                format!("non-final chunk of {} bytes is not aligned", chunk.data.len()),
            ));
        }
        if let Some(total) = chunk.total_size {
            if total != chunk.end() {
                return Err(TransferError::from_status(
                    400,
                    format!("total size {total} does not match final offset {}", chunk.end()),
                ));
            }
        }

        // Bytes before `committed` were already persisted
        let overlap = (committed - chunk.offset) as usize;
        if overlap < chunk.data.len() {
            session.buffer.extend_from_slice(&chunk.data[overlap..]);
        }

        if !chunk.is_final() {
            return Ok(SessionStatus::Persisted {
                committed: session.buffer.len() as u64,
            });
        }

        let object = session.object.clone();
        let data = Bytes::from(std::mem::take(&mut session.buffer));
        let computed = ObjectChecksums::compute(&data);
        let preconditions = session.preconditions.clone();
        let content_type = session.content_type.clone();
        let content_encoding = session.content_encoding.clone();

        let verdict = match &chunk.checksums {
            Some(expected) => expected.verify(&computed),
            None => Ok(()),
        }
        .and_then(|_| check_preconditions(self.existing(&object)?, &preconditions));
        if let Err(error) = verdict {
            self.sessions.remove(handle);
            return Err(error);
        }

        let etag = quoted(&computed.md5_hex().unwrap_or_default());
        let info = self.store(&object, data, etag, content_type, content_encoding, computed)?;
        if let Some(session) = self.sessions.get_mut(handle) {
            session.finalized = Some(info.clone());
        }
        Ok(SessionStatus::Finalized(info))
    }

    fn upload(&self, upload_id: &UploadId) -> TransferResult<&MultipartUpload> {
        self.uploads
            .get(upload_id)
            .ok_or_else(|| TransferError::not_found(format!("upload {upload_id}")))
    }

    fn complete(&mut self, upload_id: &UploadId, parts: &[CompletedPart]) -> TransferResult<ObjectInfo> {
        let upload = self.upload(upload_id)?;
        if parts.is_empty() {
            return Err(TransferError::from_status(400, "MalformedXML: no parts cited"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(TransferError::from_status(400, "InvalidPartOrder"));
        }

        let mut data = Vec::new();
        let mut digests = Md5::new();
        for cited in parts {
            let stored = upload
                .parts
                .get(&cited.part_number)
                .filter(|p| p.etag == cited.etag)
                .ok_or_else(|| {
                    TransferError::from_status(
                        400,
                        format!("InvalidPart: part {} with etag {}", cited.part_number, cited.etag),
                    )
                })?;
            data.extend_from_slice(&stored.data);
            digests.update(stored.md5);
        }

        let object = upload.object.clone();
        check_preconditions(self.existing(&object)?, &upload.preconditions)?;

        let digest: [u8; 16] = digests.finalize().into();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let etag = quoted(&format!("{hex}-{}", parts.len()));
        let checksums = ObjectChecksums::default().with_crc32c(crc32c::crc32c(&data));

        let info = self.store(&object, Bytes::from(data), etag, None, None, checksums)?;
        self.uploads.remove(upload_id);
        Ok(info)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_range(&self, request: ReadRequest) -> TransferResult<ReadResponse> {
        debug!(object = %request.object, range = %request.range.http_header(), "memory read");
        self.state.read().read(&request)
    }

    async fn start_resumable(&self, request: StartUpload) -> TransferResult<SessionHandle> {
        let mut state = self.state.write();
        check_preconditions(state.existing(&request.object)?, &request.preconditions)?;

        let handle = SessionHandle::new();
        state.sessions.insert(
            handle.clone(),
            ResumableSession {
                object: request.object.latest(),
                preconditions: request.preconditions,
                content_type: request.content_type,
                content_encoding: request.content_encoding,
                buffer: Vec::new(),
                finalized: None,
            },
        );
        Ok(handle)
    }

    async fn put_chunk(
        &self,
        session: &SessionHandle,
        chunk: ChunkUpload,
    ) -> TransferResult<SessionStatus> {
        self.state.write().put_chunk(session, chunk)
    }

    async fn query_session(&self, session: &SessionHandle) -> TransferResult<SessionStatus> {
        let state = self.state.read();
        let stored = state
            .sessions
            .get(session)
            .ok_or_else(|| TransferError::not_found(format!("session {session}")))?;
        Ok(match &stored.finalized {
            Some(info) => SessionStatus::Finalized(info.clone()),
            None => SessionStatus::Persisted {
                committed: stored.buffer.len() as u64,
            },
        })
    }

    async fn cancel_session(&self, session: &SessionHandle) -> TransferResult<()> {
        self.state
            .write()
            .sessions
            .remove(session)
            .map(|_| ())
            .ok_or_else(|| TransferError::not_found(format!("session {session}")))
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::basic()
            .with_resumable()
            .with_multipart()
    }
}

#[async_trait]
impl MultipartTransport for MemoryTransport {
    async fn create_multipart(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
    ) -> TransferResult<UploadId> {
        let mut state = self.state.write();
        check_preconditions(state.existing(object)?, preconditions)?;

        let upload_id = UploadId::new();
        state.uploads.insert(
            upload_id.clone(),
            MultipartUpload {
                object: object.latest(),
                preconditions: preconditions.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _object: &ObjectId,
        upload_id: &UploadId,
        part_number: u32,
        data: Bytes,
        checksums: Option<&ObjectChecksums>,
    ) -> TransferResult<String> {
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(TransferError::from_status(
                400,
                format!("part number {part_number} outside 1..={MAX_PART_NUMBER}"),
            ));
        }

        let computed = ObjectChecksums::compute(&data);
        if let Some(expected) = checksums {
            expected.verify(&computed)?;
        }
        let md5 = computed.md5.unwrap_or_default();
        let etag = quoted(&computed.md5_hex().unwrap_or_default());

        let mut state = self.state.write();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| TransferError::not_found(format!("upload {upload_id}")))?;
        upload.parts.insert(
            part_number,
            StoredPart {
                data,
                etag: etag.clone(),
                md5,
            },
        );
        Ok(etag)
    }

    async fn list_parts(
        &self,
        _object: &ObjectId,
        upload_id: &UploadId,
    ) -> TransferResult<Vec<PartInfo>> {
        let state = self.state.read();
        let upload = state.upload(upload_id)?;
        Ok(upload
            .parts
            .iter()
            .map(|(number, part)| PartInfo {
                part_number: *number,
                etag: part.etag.clone(),
                size_bytes: part.data.len() as u64,
            })
            .collect())
    }

    async fn complete_multipart(
        &self,
        _object: &ObjectId,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> TransferResult<ObjectInfo> {
        self.state.write().complete(upload_id, parts)
    }

    async fn abort_multipart(&self, _object: &ObjectId, upload_id: &UploadId) -> TransferResult<()> {
        self.state
            .write()
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| TransferError::not_found(format!("upload {upload_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ByteRange;
    use futures_util::StreamExt;

    async fn collect(response: ReadResponse) -> Vec<u8> {
        let mut body = response.body;
        let mut out = Vec::new();
        while let Some(piece) = body.next().await {
            out.extend_from_slice(&piece.unwrap());
        }
        out
    }

    fn read(object: &ObjectId, start: u64, end: Option<u64>) -> ReadRequest {
        ReadRequest {
            object: object.clone(),
            range: ByteRange::new(start, end),
            if_generation_match: None,
        }
    }

    #[tokio::test]
    async fn range_reads_and_bounds() {
        let transport = MemoryTransport::new().with_bucket("b");
        transport.put_object("b", "o", &b"0123456789"[..], None).unwrap();
        let id = ObjectId::new("b", "o");

        let response = transport.read_range(read(&id, 2, Some(5))).await.unwrap();
        assert_eq!(response.object_size, 10);
        assert_eq!(collect(response).await, b"234");

        let err = transport.read_range(read(&id, 10, None)).await.unwrap_err();
        assert_eq!(err.status(), Some(416));

        let missing = ObjectId::new("b", "nope");
        assert!(transport.read_range(read(&missing, 0, None)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn generation_match_is_enforced() {
        let transport = MemoryTransport::new().with_bucket("b");
        let first = transport.put_object("b", "o", &b"one"[..], None).unwrap();
        transport.put_object("b", "o", &b"two"[..], None).unwrap();

        let mut request = read(&ObjectId::new("b", "o"), 0, None);
        request.if_generation_match = first.generation().cloned();
        let err = transport.read_range(request).await.unwrap_err();
        assert_eq!(err.status(), Some(412));

        let pinned = first.id.clone();
        assert!(transport.read_range(read(&pinned, 0, None)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn resumable_session_rules() {
        let transport = MemoryTransport::new().with_bucket("b");
        let handle = transport
            .start_resumable(StartUpload {
                object: ObjectId::new("b", "o"),
                preconditions: Preconditions::new().does_not_exist(),
                content_type: None,
                content_encoding: None,
            })
            .await
            .unwrap();

        let unaligned = ChunkUpload {
            offset: 0,
            data: Bytes::from(vec![1u8; 10]),
            total_size: None,
            checksums: None,
        };
        let err = transport.put_chunk(&handle, unaligned).await.unwrap_err();
        assert_eq!(err.status(), Some(400));

        let aligned = ChunkUpload {
            offset: 0,
            data: Bytes::from(vec![1u8; CHUNK_ALIGNMENT as usize]),
            total_size: None,
            checksums: None,
        };
        let status = transport.put_chunk(&handle, aligned).await.unwrap();
        assert_eq!(status, SessionStatus::Persisted { committed: CHUNK_ALIGNMENT });

        let last = ChunkUpload {
            offset: CHUNK_ALIGNMENT,
            data: Bytes::from_static(b"tail"),
            total_size: Some(CHUNK_ALIGNMENT + 4),
            checksums: None,
        };
        let info = match transport.put_chunk(&handle, last.clone()).await.unwrap() {
            SessionStatus::Finalized(info) => info,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(info.size_bytes, CHUNK_ALIGNMENT + 4);

        let err = transport.put_chunk(&handle, last).await.unwrap_err();
        assert_eq!(err.status(), Some(410));
        assert!(matches!(
            transport.query_session(&handle).await.unwrap(),
            SessionStatus::Finalized(_)
        ));
    }

    #[tokio::test]
    async fn multipart_completion_checks_etags() {
        let transport = MemoryTransport::new().with_bucket("b");
        let id = ObjectId::new("b", "o");
        let upload = transport.create_multipart(&id, &Preconditions::new()).await.unwrap();
        let etag = transport
            .upload_part(&id, &upload, 1, Bytes::from_static(b"abc"), None)
            .await
            .unwrap();
        assert_eq!(etag, "\"900150983cd24fb0d6963f7d28e17f72\"");

        let wrong = [CompletedPart { part_number: 1, etag: "\"bogus\"".into() }];
        let err = transport.complete_multipart(&id, &upload, &wrong).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(transport.open_uploads(), 1);

        let right = [CompletedPart { part_number: 1, etag }];
        let info = transport.complete_multipart(&id, &upload, &right).await.unwrap();
        assert!(info.etag.unwrap().ends_with("-1\""));
        assert_eq!(transport.object_bytes(&id).unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(transport.open_uploads(), 0);
    }

    #[tokio::test]
    async fn missing_bucket_is_not_found() {
        let transport = MemoryTransport::new();
        let err = transport
            .create_multipart(&ObjectId::new("ghost", "o"), &Preconditions::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
