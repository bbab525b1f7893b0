use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use uuid::Uuid;

use crate::ObjectChecksums;

/// Stream of bytes for object content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Opaque version identifier of an object; changes on every overwrite
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Generation(pub String);

impl Generation {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Generation {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Generation {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<i64> for Generation {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Identity of a remote object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub bucket: String,
    pub name: String,
    /// Pins a specific version; `None` means the latest one
    pub generation: Option<Generation>,
}

impl ObjectId {
    pub fn new<B: Into<String>, N: Into<String>>(bucket: B, name: N) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
            generation: None,
        }
    }

    pub fn with_generation<G: Into<Generation>>(mut self, generation: G) -> Self {
        self.generation = Some(generation.into());
        self
    }

    /// Same object, any version
    pub fn latest(&self) -> Self {
        Self {
            bucket: self.bucket.clone(),
            name: self.name.clone(),
            generation: None,
        }
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.generation {
            Some(generation) => write!(f, "{}/{}#{}", self.bucket, self.name, generation),
            None => write!(f, "{}/{}", self.bucket, self.name),
        }
    }
}

/// Caller-supplied request conditions and object options.
///
/// The engine never interprets these beyond handing them to the transport
/// on the first request of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    pub if_generation_match: Option<Generation>,
    pub if_generation_not_match: Option<Generation>,
    pub if_metageneration_match: Option<i64>,
    /// Only succeed if the object does not exist yet
    pub does_not_exist: bool,
    pub predefined_acl: Option<String>,
    /// Base64 customer-supplied encryption key
    pub encryption_key: Option<String>,
    pub kms_key: Option<String>,
}

impl Preconditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_generation_match<G: Into<Generation>>(mut self, generation: G) -> Self {
        self.if_generation_match = Some(generation.into());
        self
    }

    pub fn if_generation_not_match<G: Into<Generation>>(mut self, generation: G) -> Self {
        self.if_generation_not_match = Some(generation.into());
        self
    }

    pub fn if_metageneration_match(mut self, metageneration: i64) -> Self {
        self.if_metageneration_match = Some(metageneration);
        self
    }

    pub fn does_not_exist(mut self) -> Self {
        self.does_not_exist = true;
        self
    }

    pub fn with_predefined_acl<S: Into<String>>(mut self, acl: S) -> Self {
        self.predefined_acl = Some(acl.into());
        self
    }

    pub fn with_encryption_key<S: Into<String>>(mut self, key: S) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_kms_key<S: Into<String>>(mut self, key: S) -> Self {
        self.kms_key = Some(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Byte range for partial content requests, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // None means "to end of object"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn length(&self, total_size: u64) -> u64 {
        let end = self.end.map_or(total_size, |e| e.min(total_size));
        end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.end, Some(end) if end <= self.start)
    }

    /// `Range` header value (`bytes=first-last`, inclusive)
    pub fn http_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Unique identifier for a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side handle of a resumable write session (e.g. a session URI)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn new() -> Self {
        Self(format!("ses_{}", Uuid::new_v4().simple()))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata of a finished object, returned by uploads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Identity including the generation that was written
    pub id: ObjectId,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub checksums: ObjectChecksums,
    pub updated_at: DateTime<Utc>,
}

impl ObjectInfo {
    pub fn generation(&self) -> Option<&Generation> {
        self.id.generation.as_ref()
    }
}

/// Receipt for an uploaded part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartReceipt {
    pub part_number: u32,
    pub etag: String,
    pub size_bytes: u64,
    pub checksums: ObjectChecksums,
}

impl PartReceipt {
    pub fn completed(&self) -> CompletedPart {
        CompletedPart {
            part_number: self.part_number,
            etag: self.etag.clone(),
        }
    }
}

/// A part as reported by the service when listing an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size_bytes: u64,
}

/// Part citation used to complete a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Client-side view of an open multipart upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub object: ObjectId,
    pub created_at: DateTime<Utc>,
    /// Uploaded parts keyed by part number; re-uploads replace earlier receipts
    pub parts: BTreeMap<u32, PartReceipt>,
}

impl UploadSession {
    pub fn new(upload_id: UploadId, object: ObjectId) -> Self {
        Self {
            upload_id,
            object,
            created_at: Utc::now(),
            parts: BTreeMap::new(),
        }
    }

    /// Record a part receipt, returning the one it replaced
    pub fn record(&mut self, receipt: PartReceipt) -> Option<PartReceipt> {
        self.parts.insert(receipt.part_number, receipt)
    }

    /// Parts sorted by part number, ready for completion
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts.values().map(PartReceipt::completed).collect()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.parts.values().map(|p| p.size_bytes).sum()
    }
}
