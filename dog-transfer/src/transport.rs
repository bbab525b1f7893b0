use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    ByteRange, ByteStream, CompletedPart, Generation, ObjectChecksums, ObjectId, ObjectInfo,
    PartInfo, Preconditions, SessionHandle, TransferError, TransferResult, UploadId,
};

/// Every non-final chunk of a resumable session must be a multiple of this
pub const CHUNK_ALIGNMENT: u64 = 256 * 1024;

/// Round `size` up to the next multiple of [`CHUNK_ALIGNMENT`], minimum one unit.
/// Sizes past the largest representable multiple clamp down to it.
pub fn align_chunk_size(size: u64) -> u64 {
    let units = size.div_ceil(CHUNK_ALIGNMENT).max(1);
    units
        .checked_mul(CHUNK_ALIGNMENT)
        .unwrap_or(u64::MAX - u64::MAX % CHUNK_ALIGNMENT)
}

/// Range reads and resumable sessions - the operations both channels need
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch a byte range of the stored (possibly encoded) object
    async fn read_range(&self, request: ReadRequest) -> TransferResult<ReadResponse>;

    /// Open a resumable write session; preconditions apply to the final object
    async fn start_resumable(&self, request: StartUpload) -> TransferResult<SessionHandle>;

    /// Send bytes at `offset`; the server may persist only a prefix
    async fn put_chunk(
        &self,
        session: &SessionHandle,
        chunk: ChunkUpload,
    ) -> TransferResult<SessionStatus>;

    /// Ask the server how far a session got
    async fn query_session(&self, session: &SessionHandle) -> TransferResult<SessionStatus>;

    /// Discard a session and anything it persisted
    async fn cancel_session(&self, session: &SessionHandle) -> TransferResult<()>;

    /// Get transport capabilities
    fn capabilities(&self) -> TransportCapabilities;
}

/// Optional multipart upload support
#[async_trait]
pub trait MultipartTransport: Transport {
    /// Initialize a multipart upload
    async fn create_multipart(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
    ) -> TransferResult<UploadId>;

    /// Upload a part, returning its ETag
    async fn upload_part(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        part_number: u32,
        data: Bytes,
        checksums: Option<&ObjectChecksums>,
    ) -> TransferResult<String>;

    /// Parts stored so far, sorted by part number
    async fn list_parts(&self, object: &ObjectId, upload_id: &UploadId)
        -> TransferResult<Vec<PartInfo>>;

    /// Complete multipart upload
    async fn complete_multipart(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> TransferResult<ObjectInfo>;

    /// Abort multipart upload
    async fn abort_multipart(&self, object: &ObjectId, upload_id: &UploadId) -> TransferResult<()>;
}

/// One range GET
#[derive(Debug, Clone)]
pub struct ReadRequest {
    pub object: ObjectId,
    pub range: ByteRange,
    /// Fail with 412 unless the live generation matches
    pub if_generation_match: Option<Generation>,
}

/// Response headers plus the body of a range GET
pub struct ReadResponse {
    pub generation: Generation,
    /// Full stored size of the object
    pub object_size: u64,
    pub content_encoding: Option<String>,
    pub checksums: ObjectChecksums,
    pub body: ByteStream,
}

impl std::fmt::Debug for ReadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResponse")
            .field("generation", &self.generation)
            .field("object_size", &self.object_size)
            .field("content_encoding", &self.content_encoding)
            .field("checksums", &self.checksums)
            .finish_non_exhaustive()
    }
}

/// Session-start request; the only request that carries preconditions
#[derive(Debug, Clone)]
pub struct StartUpload {
    pub object: ObjectId,
    pub preconditions: Preconditions,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// Bytes sent into a resumable session
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    /// Session offset of `data[0]`
    pub offset: u64,
    pub data: Bytes,
    /// Set on the final chunk only
    pub total_size: Option<u64>,
    /// Whole-object checksums, final chunk only
    pub checksums: Option<ObjectChecksums>,
}

impl ChunkUpload {
    pub fn is_final(&self) -> bool {
        self.total_size.is_some()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Server-side state of a resumable session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// Bytes `[0, committed)` are durable
    Persisted { committed: u64 },
    /// The object exists
    Finalized(ObjectInfo),
}

/// Transport capabilities
#[derive(Debug, Clone, Default)]
pub struct TransportCapabilities {
    pub supports_resumable: bool,
    pub supports_multipart: bool,
    /// Whether `query_session` reports the committed offset
    pub supports_session_query: bool,
    pub max_part_size: Option<u64>,
    pub min_part_size: Option<u64>,
}

impl TransportCapabilities {
    pub fn basic() -> Self {
        Self::default()
    }

    pub fn with_resumable(mut self) -> Self {
        self.supports_resumable = true;
        self.supports_session_query = true;
        self
    }

    pub fn with_multipart(mut self) -> Self {
        self.supports_multipart = true;
        self
    }

    pub fn with_part_limits(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_part_size = min;
        self.max_part_size = max;
        self
    }

    /// Check a part length against the service limits. Only the last part
    /// of an upload may fall below the minimum.
    pub fn check_part_size(&self, size: u64, is_last: bool) -> TransferResult<()> {
        if let Some(max) = self.max_part_size {
            if size > max {
                return Err(TransferError::invalid(format!(
                    "part of {size} bytes exceeds the {max} byte limit"
                )));
            }
        }
        if let Some(min) = self.min_part_size {
            if size < min && !is_last {
                return Err(TransferError::invalid(format!(
                    "part of {size} bytes is below the {min} byte minimum"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_round_up_to_alignment() {
        assert_eq!(align_chunk_size(0), CHUNK_ALIGNMENT);
        assert_eq!(align_chunk_size(1), CHUNK_ALIGNMENT);
        assert_eq!(align_chunk_size(CHUNK_ALIGNMENT), CHUNK_ALIGNMENT);
        assert_eq!(align_chunk_size(CHUNK_ALIGNMENT + 1), 2 * CHUNK_ALIGNMENT);
    }

    #[test]
    fn huge_chunk_sizes_clamp_instead_of_overflowing() {
        let top = align_chunk_size(u64::MAX);
        assert_eq!(top % CHUNK_ALIGNMENT, 0);
        assert!(top > u64::MAX - CHUNK_ALIGNMENT);
        assert_eq!(align_chunk_size(u64::MAX - 1), top);
    }

    #[test]
    fn part_limits_spare_the_last_part() {
        let limits = TransportCapabilities::basic().with_part_limits(Some(100), Some(1_000));
        assert!(limits.check_part_size(99, false).is_err());
        assert!(limits.check_part_size(99, true).is_ok());
        assert!(limits.check_part_size(1_001, true).is_err());
        assert!(TransportCapabilities::basic().check_part_size(1, false).is_ok());
    }
}
