//! # dog-transfer: Resumable object transfers over unreliable networks
//!
//! `dog-transfer` moves large objects to and from remote object storage without
//! restarting from zero when a connection drops. It is built for DogRS services
//! that stream media and backups through S3-style stores.
//!
//! ## Key Features
//!
//! - **Read channel**: chunked range reads pinned to one object generation, resumed
//!   from the exact byte where a stream broke, with optional gzip decoding
//! - **Write channel**: resumable sessions with aligned chunks, partial-ack handling
//!   and serializable snapshots so an upload can continue in another process
//! - **Multipart uploads**: independent parts, concurrent upload, ETag-checked completion
//! - **Retry policy**: exponential backoff with jitter and a per-operation budget
//! - **Checksums**: CRC32C and MD5 verified over whole objects
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_transfer::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let memory = MemoryTransport::new().with_bucket("media");
//! let client = TransferClient::new(Arc::new(memory), TransferConfig::default())?;
//!
//! let object = ObjectId::new("media", "hello.txt");
//! let mut writer = client.writer(object.clone())?;
//! writer.write(b"Hello, world!").await?;
//! let info = writer.close().await?;
//!
//! let mut reader = client.reader(object);
//! let mut body = Vec::new();
//! reader.read_to_end(&mut body).await?;
//! assert_eq!(body.len() as u64, info.size_bytes);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │              TransferClient               │
//! ├──────────────┬──────────────┬─────────────┤
//! │ ReadChannel  │ WriteChannel │ Coordinator │  ← resume + retry logic
//! ├──────────────┴──────────────┴─────────────┤
//! │     Transport / MultipartTransport        │  ← wire primitives
//! └───────────────────────────────────────────┘
//! ```
//!
//! Transports only speak the wire protocol. Everything about resuming, retrying
//! and verifying lives in the channels, so [`MemoryTransport`] wrapped in a
//! [`FaultTransport`] exercises exactly the code paths a real network would.

mod checksum;
mod client;
mod config;
mod error;
pub mod fault;
mod memory;
pub mod multipart;
pub mod read;
mod retry;
mod s3;
pub mod transport;
mod types;
pub mod write;

// Re-export main types for clean API
pub use checksum::{decode_crc32c, ChecksumHasher, ObjectChecksums};
pub use client::TransferClient;
pub use config::{TransferConfig, UploadRules};
pub use error::{FailureKind, TransferError, TransferResult};
pub use fault::{Fault, FaultTransport, Operation, RecordedRequest};
pub use memory::MemoryTransport;
pub use multipart::{DefaultUploadCoordinator, UploadCoordinator};
pub use read::{AbortHandle, ReadChannel, ReadOptions};
pub use retry::{RetryPolicy, RetryState, Retryability};
pub use s3::{S3Config, S3Transport};
pub use transport::{
    align_chunk_size, ChunkUpload, MultipartTransport, ReadRequest, ReadResponse, SessionStatus,
    StartUpload, Transport, TransportCapabilities, CHUNK_ALIGNMENT,
};
pub use types::{
    ByteRange, ByteStream, CompletedPart, Generation, ObjectId, ObjectInfo, PartInfo,
    PartReceipt, Preconditions, SessionHandle, UploadId, UploadSession,
};
pub use write::{WriteChannel, WriteOptions, WriteSnapshot, SNAPSHOT_VERSION};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        DefaultUploadCoordinator, MemoryTransport, MultipartTransport, ObjectId, Preconditions,
        ReadChannel, ReadOptions, RetryPolicy, TransferClient, TransferConfig, TransferError,
        TransferResult, Transport, UploadCoordinator, WriteChannel, WriteOptions,
    };
}
