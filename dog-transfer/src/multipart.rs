use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::transport::{MultipartTransport, TransportCapabilities};
use crate::{
    CompletedPart, ObjectChecksums, ObjectId, ObjectInfo, PartInfo, PartReceipt, Preconditions,
    RetryPolicy, TransferError, TransferResult, UploadId, UploadRules, UploadSession,
};

/// Coordinates multipart uploads
#[async_trait]
pub trait UploadCoordinator: Send + Sync {
    /// Begin a new upload
    async fn create_upload(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
    ) -> TransferResult<UploadSession>;

    /// Upload one part; re-uploading a part number replaces it
    async fn upload_part(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        part_number: u32,
        data: Bytes,
        expected: Option<ObjectChecksums>,
    ) -> TransferResult<PartReceipt>;

    /// Parts the service holds, sorted by part number
    async fn list_parts(&self, object: &ObjectId, upload_id: &UploadId)
        -> TransferResult<Vec<PartInfo>>;

    /// Assemble the cited parts into the final object
    async fn complete_upload(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> TransferResult<ObjectInfo>;

    /// Abort an upload and discard its parts
    async fn abort_upload(&self, object: &ObjectId, upload_id: &UploadId) -> TransferResult<()>;
}

/// Default coordinator: retries every call and cancels in-flight parts on abort
#[derive(Clone)]
pub struct DefaultUploadCoordinator {
    transport: Arc<dyn MultipartTransport>,
    policy: RetryPolicy,
    rules: UploadRules,
    limits: TransportCapabilities,
    in_flight: Arc<Mutex<HashMap<UploadId, CancellationToken>>>,
}

impl DefaultUploadCoordinator {
    pub fn new<T: MultipartTransport + 'static>(
        transport: Arc<T>,
        policy: RetryPolicy,
        rules: UploadRules,
    ) -> Self {
        let limits = transport.capabilities();
        Self {
            transport,
            policy,
            rules,
            limits,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn rules(&self) -> &UploadRules {
        &self.rules
    }

    /// Part size limits reported by the transport
    pub fn limits(&self) -> &TransportCapabilities {
        &self.limits
    }

    /// Abort token for uploads this coordinator created; others get a detached one
    fn token(&self, upload_id: &UploadId) -> CancellationToken {
        self.in_flight
            .lock()
            .get(upload_id)
            .cloned()
            .unwrap_or_default()
    }

    fn validate_part_number(&self, part_number: u32) -> TransferResult<()> {
        if part_number == 0 || part_number > self.rules.max_parts {
            return Err(TransferError::invalid(format!(
                "part number {part_number} outside 1..={}",
                self.rules.max_parts
            )));
        }
        Ok(())
    }

    /// Abort, treating an upload that is already gone as success
    pub async fn abort_quietly(&self, object: &ObjectId, upload_id: &UploadId) -> TransferResult<()> {
        match self.abort_upload(object, upload_id).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Split `source` into parts, upload them concurrently and complete.
    ///
    /// On any part failure the upload is aborted and the error returned.
    #[instrument(skip(self, object, preconditions, source), fields(object = %object, size = source.len()))]
    pub async fn upload_parallel(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
        source: Bytes,
    ) -> TransferResult<ObjectInfo> {
        let part_size = self.rules.part_size as usize;
        let count = source.len().div_ceil(part_size).max(1);
        if count > self.rules.max_parts as usize {
            return Err(TransferError::invalid(format!(
                "{} bytes need {count} parts of {part_size}, more than {}",
                source.len(),
                self.rules.max_parts
            )));
        }
        if count > 1 {
            self.limits.check_part_size(part_size as u64, false)?;
        }

        let mut session = self.create_upload(object, preconditions).await?;
        let upload_id = &session.upload_id;

        let uploads = futures_util::stream::iter((0..count).map(|index| {
            let start = index * part_size;
            let end = (start + part_size).min(source.len());
            let data = source.slice(start..end);
            async move {
                self.upload_part(object, upload_id, index as u32 + 1, data, None)
                    .await
            }
        }))
        .buffer_unordered(self.rules.max_concurrency.max(1))
        .try_collect::<Vec<PartReceipt>>()
        .await;

        let receipts = match uploads {
            Ok(receipts) => receipts,
            Err(e) => {
                warn!(upload_id = %upload_id, error = %e, "part upload failed, aborting");
                if let Err(abort_error) = self.abort_quietly(object, upload_id).await {
                    warn!(upload_id = %upload_id, error = %abort_error, "abort after failure failed");
                }
                return Err(e);
            }
        };

        for receipt in receipts {
            session.record(receipt);
        }
        let parts = session.completed_parts();
        self.complete_upload(object, &session.upload_id, &parts).await
    }
}

#[async_trait]
impl UploadCoordinator for DefaultUploadCoordinator {
    #[instrument(skip(self, object, preconditions), fields(object = %object))]
    async fn create_upload(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
    ) -> TransferResult<UploadSession> {
        let transport = self.transport.as_ref();
        let upload_id = self
            .policy
            .run(&CancellationToken::new(), move || {
                transport.create_multipart(object, preconditions)
            })
            .await?;

        self.in_flight
            .lock()
            .insert(upload_id.clone(), CancellationToken::new());
        info!(upload_id = %upload_id, "multipart upload created");
        Ok(UploadSession::new(upload_id, object.latest()))
    }

    #[instrument(skip(self, object, upload_id, data, expected), fields(upload_id = %upload_id, size = data.len()))]
    async fn upload_part(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        part_number: u32,
        data: Bytes,
        expected: Option<ObjectChecksums>,
    ) -> TransferResult<PartReceipt> {
        self.validate_part_number(part_number)?;
        self.limits.check_part_size(data.len() as u64, true)?;

        // Without caller digests, ours still catch corruption in transit
        let checksums = expected.unwrap_or_else(|| ObjectChecksums::compute(&data));
        let size_bytes = data.len() as u64;
        let token = self.token(upload_id);
        let transport = self.transport.as_ref();
        let sent = &checksums;

        let etag = self
            .policy
            .run(&token, move || {
                transport.upload_part(object, upload_id, part_number, data.clone(), Some(sent))
            })
            .await?;

        debug!(part_number, etag = %etag, "part uploaded");
        Ok(PartReceipt {
            part_number,
            etag,
            size_bytes,
            checksums,
        })
    }

    async fn list_parts(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
    ) -> TransferResult<Vec<PartInfo>> {
        let transport = self.transport.as_ref();
        let mut parts = self
            .policy
            .run(&CancellationToken::new(), move || transport.list_parts(object, upload_id))
            .await?;
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, object, upload_id, parts), fields(upload_id = %upload_id, parts = parts.len()))]
    async fn complete_upload(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> TransferResult<ObjectInfo> {
        if parts.is_empty() {
            return Err(TransferError::invalid("cannot complete an upload without parts"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(TransferError::invalid(
                "part numbers must be unique and ascending",
            ));
        }
        for part in parts {
            self.validate_part_number(part.part_number)?;
        }

        let token = self.token(upload_id);
        let transport = self.transport.as_ref();
        let info = self
            .policy
            .run(&token, move || transport.complete_multipart(object, upload_id, parts))
            .await?;

        self.in_flight.lock().remove(upload_id);
        info!(
            upload_id = %upload_id,
            object = %info.id,
            size_bytes = info.size_bytes,
            "multipart upload completed"
        );
        Ok(info)
    }

    #[instrument(skip(self, object, upload_id), fields(upload_id = %upload_id))]
    async fn abort_upload(&self, object: &ObjectId, upload_id: &UploadId) -> TransferResult<()> {
        if let Some(token) = self.in_flight.lock().remove(upload_id) {
            token.cancel();
        }

        let transport = self.transport.as_ref();
        self.policy
            .run(&CancellationToken::new(), move || {
                transport.abort_multipart(object, upload_id)
            })
            .await?;

        info!(upload_id = %upload_id, "multipart upload aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;
    use std::time::Duration;

    fn coordinator(memory: &MemoryTransport, rules: UploadRules) -> DefaultUploadCoordinator {
        let policy = RetryPolicy::default().with_initial_backoff(Duration::ZERO);
        DefaultUploadCoordinator::new(Arc::new(memory.clone()), policy, rules)
    }

    #[tokio::test]
    async fn rejects_bad_part_numbers_before_sending() {
        let memory = MemoryTransport::new().with_bucket("b");
        let uploads = coordinator(&memory, UploadRules::new().with_max_parts(3));
        let object = ObjectId::new("b", "o");
        let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();

        for bad in [0, 4] {
            let err = uploads
                .upload_part(&object, &session.upload_id, bad, Bytes::from_static(b"x"), None)
                .await
                .unwrap_err();
            assert!(matches!(err, TransferError::InvalidRequest { status: None, .. }));
        }
    }

    #[tokio::test]
    async fn unsorted_completion_is_rejected() {
        let memory = MemoryTransport::new().with_bucket("b");
        let uploads = coordinator(&memory, UploadRules::new());
        let object = ObjectId::new("b", "o");
        let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();

        let parts = vec![
            CompletedPart { part_number: 2, etag: "\"b\"".into() },
            CompletedPart { part_number: 1, etag: "\"a\"".into() },
        ];
        let err = uploads
            .complete_upload(&object, &session.upload_id, &parts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ascending"));
        assert!(uploads
            .complete_upload(&object, &session.upload_id, &[])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn abort_quietly_tolerates_missing_upload() {
        let memory = MemoryTransport::new().with_bucket("b");
        let uploads = coordinator(&memory, UploadRules::new());
        let object = ObjectId::new("b", "o");
        let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();

        uploads.abort_upload(&object, &session.upload_id).await.unwrap();
        assert!(uploads
            .abort_upload(&object, &session.upload_id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(uploads.abort_quietly(&object, &session.upload_id).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_upload_ids_are_not_registered() {
        let memory = MemoryTransport::new().with_bucket("b");
        let uploads = coordinator(&memory, UploadRules::new());
        let object = ObjectId::new("b", "o");
        let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
        uploads.abort_upload(&object, &session.upload_id).await.unwrap();

        let err = uploads
            .upload_part(&object, &session.upload_id, 1, Bytes::from_static(b"x"), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(uploads.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn parallel_upload_of_empty_source() {
        let memory = MemoryTransport::new().with_bucket("b");
        let uploads = coordinator(&memory, UploadRules::new());
        let object = ObjectId::new("b", "empty");

        let info = uploads
            .upload_parallel(&object, &Preconditions::new(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(info.size_bytes, 0);
        assert_eq!(memory.open_uploads(), 0);
    }
}
