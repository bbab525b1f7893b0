//! Fault-injecting transport decorator.
//!
//! Wraps any transport, forwards every call, and applies scripted faults:
//! stream breaks at byte offsets, short acknowledgements, lost responses,
//! injected status codes and delays. Every request is recorded so tests can
//! assert exactly what went over the wire.

use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::transport::{
    ChunkUpload, MultipartTransport, ReadRequest, ReadResponse, SessionStatus, StartUpload,
    Transport, TransportCapabilities,
};
use crate::{
    ByteRange, ByteStream, CompletedPart, Generation, ObjectChecksums, ObjectId, ObjectInfo,
    PartInfo, Preconditions, SessionHandle, TransferError, TransferResult, UploadId,
};

/// Transport operation, used to target faults and label recorded requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ReadRange,
    StartResumable,
    PutChunk,
    QuerySession,
    CancelSession,
    CreateMultipart,
    UploadPart,
    ListParts,
    CompleteMultipart,
    AbortMultipart,
}

/// A one-shot fault, consumed by the first call it applies to
#[derive(Debug, Clone)]
pub enum Fault {
    /// Deliver stored bytes up to `offset`, then reset the connection
    BreakReadAt { offset: u64 },
    /// Deliver stored bytes up to `offset`, then end the stream early
    TruncateReadAt { offset: u64 },
    /// Persist only the first `persist` bytes of the next chunk and report success
    ShortAck { persist: u64 },
    /// Persist only the first `persist` bytes of the next chunk, then fail
    PartialWrite { persist: u64 },
    /// Fail the next call with this status without forwarding it
    Status { op: Operation, status: u16 },
    /// Forward the next call, then lose its response
    DropResponse { op: Operation },
    /// Hold the next call for `delay` before forwarding it
    Delay { op: Operation, delay: Duration },
}

/// One request as seen by the decorator
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub op: Operation,
    pub object: Option<ObjectId>,
    pub range: Option<ByteRange>,
    pub if_generation_match: Option<Generation>,
    /// Chunk offset and length for `PutChunk`
    pub offset: Option<u64>,
    pub len: Option<u64>,
    pub is_final: bool,
    pub part_number: Option<u32>,
    pub preconditions: Option<Preconditions>,
}

impl RecordedRequest {
    fn new(op: Operation) -> Self {
        Self {
            op,
            object: None,
            range: None,
            if_generation_match: None,
            offset: None,
            len: None,
            is_final: false,
            part_number: None,
            preconditions: None,
        }
    }

    /// Byte span covered by a recorded chunk
    pub fn span(&self) -> Option<std::ops::Range<u64>> {
        match (self.offset, self.len) {
            (Some(offset), Some(len)) => Some(offset..offset + len),
            _ => None,
        }
    }
}

/// Decorator that injects failures into an inner transport
pub struct FaultTransport<T> {
    inner: T,
    faults: Mutex<Vec<Fault>>,
    requests: Mutex<Vec<RecordedRequest>>,
    capabilities: Option<TransportCapabilities>,
}

impl<T> FaultTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            faults: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            capabilities: None,
        }
    }

    /// Report these capabilities instead of the inner transport's
    pub fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Queue a fault
    pub fn inject(&self, fault: Fault) -> &Self {
        self.faults.lock().push(fault);
        self
    }

    /// Fail the next `times` calls of `op` with `status`
    pub fn fail_next(&self, op: Operation, status: u16, times: usize) -> &Self {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push(Fault::Status { op, status });
        }
        self
    }

    pub fn pending_faults(&self) -> usize {
        self.faults.lock().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, op: Operation) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.op == op)
            .cloned()
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn record(&self, request: RecordedRequest) {
        self.requests.lock().push(request);
    }

    fn take<F: Fn(&Fault) -> bool>(&self, matches: F) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let index = faults.iter().position(matches)?;
        Some(faults.remove(index))
    }

    async fn before(&self, op: Operation) -> TransferResult<()> {
        if let Some(Fault::Delay { delay, .. }) =
            self.take(|f| matches!(f, Fault::Delay { op: o, .. } if *o == op))
        {
            tokio::time::sleep(delay).await;
        }
        if let Some(Fault::Status { status, .. }) =
            self.take(|f| matches!(f, Fault::Status { op: o, .. } if *o == op))
        {
            debug!(?op, status, "injecting status fault");
            return Err(TransferError::from_status(status, format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn after<R>(&self, op: Operation, result: TransferResult<R>) -> TransferResult<R> {
        if result.is_ok()
            && self
                .take(|f| matches!(f, Fault::DropResponse { op: o } if *o == op))
                .is_some()
        {
            debug!(?op, "dropping response");
            return Err(TransferError::transient(format!("{op:?} response lost")));
        }
        result
    }
}

/// Pass `body` through until `limit` stored bytes went by, then fail or stop
fn cut_stream(body: ByteStream, limit: u64, reset: bool) -> ByteStream {
    Box::pin(stream! {
        let mut body = body;
        let mut remaining = limit;
        while let Some(item) = body.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            if (bytes.len() as u64) < remaining {
                remaining -= bytes.len() as u64;
                yield Ok(bytes);
                continue;
            }
            let head = bytes.slice(..remaining as usize);
            if !head.is_empty() {
                yield Ok(head);
            }
            break;
        }
        if reset {
            yield Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "injected connection reset",
            ));
        }
    })
}

#[async_trait]
impl<T: Transport> Transport for FaultTransport<T> {
    async fn read_range(&self, request: ReadRequest) -> TransferResult<ReadResponse> {
        let mut recorded = RecordedRequest::new(Operation::ReadRange);
        recorded.object = Some(request.object.clone());
        recorded.range = Some(request.range);
        recorded.if_generation_match = request.if_generation_match.clone();
        self.record(recorded);

        self.before(Operation::ReadRange).await?;
        let start = request.range.start;
        let result = self.inner.read_range(request.clone()).await;
        let mut response = self.after(Operation::ReadRange, result)?;

        let end = request
            .range
            .end
            .map_or(response.object_size, |e| e.min(response.object_size));
        let covers = |offset: u64| offset >= start && offset < end;
        let cut = self.take(|f| match f {
            Fault::BreakReadAt { offset } | Fault::TruncateReadAt { offset } => covers(*offset),
            _ => false,
        });
        match cut {
            Some(Fault::BreakReadAt { offset }) => {
                debug!(offset, "breaking read stream");
                response.body = cut_stream(response.body, offset - start, true);
            }
            Some(Fault::TruncateReadAt { offset }) => {
                debug!(offset, "truncating read stream");
                response.body = cut_stream(response.body, offset - start, false);
            }
            _ => {}
        }
        Ok(response)
    }

    async fn start_resumable(&self, request: StartUpload) -> TransferResult<SessionHandle> {
        let mut recorded = RecordedRequest::new(Operation::StartResumable);
        recorded.object = Some(request.object.clone());
        recorded.preconditions = Some(request.preconditions.clone());
        self.record(recorded);

        self.before(Operation::StartResumable).await?;
        let result = self.inner.start_resumable(request).await;
        self.after(Operation::StartResumable, result)
    }

    async fn put_chunk(
        &self,
        session: &SessionHandle,
        chunk: ChunkUpload,
    ) -> TransferResult<SessionStatus> {
        let mut recorded = RecordedRequest::new(Operation::PutChunk);
        recorded.offset = Some(chunk.offset);
        recorded.len = Some(chunk.data.len() as u64);
        recorded.is_final = chunk.is_final();
        self.record(recorded);

        self.before(Operation::PutChunk).await?;

        let partial = self.take(|f| matches!(f, Fault::ShortAck { .. } | Fault::PartialWrite { .. }));
        if let Some(fault) = partial {
            let (persist, acknowledge) = match fault {
                Fault::ShortAck { persist } => (persist, true),
                Fault::PartialWrite { persist } => (persist, false),
                _ => (0, false),
            };
            let persist = persist.min(chunk.data.len() as u64);
            let mut status = self.inner.query_session(session).await?;
            if persist > 0 {
                let prefix = ChunkUpload {
                    offset: chunk.offset,
                    data: chunk.data.slice(..persist as usize),
                    total_size: None,
                    checksums: None,
                };
                status = self.inner.put_chunk(session, prefix).await?;
            }
            debug!(persist, acknowledge, "partially persisted chunk");
            return if acknowledge {
                Ok(status)
            } else {
                Err(TransferError::transient(format!(
                    "connection lost after {persist} bytes"
                )))
            };
        }

        let result = self.inner.put_chunk(session, chunk).await;
        self.after(Operation::PutChunk, result)
    }

    async fn query_session(&self, session: &SessionHandle) -> TransferResult<SessionStatus> {
        self.record(RecordedRequest::new(Operation::QuerySession));
        self.before(Operation::QuerySession).await?;
        let result = self.inner.query_session(session).await;
        self.after(Operation::QuerySession, result)
    }

    async fn cancel_session(&self, session: &SessionHandle) -> TransferResult<()> {
        self.record(RecordedRequest::new(Operation::CancelSession));
        self.before(Operation::CancelSession).await?;
        let result = self.inner.cancel_session(session).await;
        self.after(Operation::CancelSession, result)
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
            .clone()
            .unwrap_or_else(|| self.inner.capabilities())
    }
}

#[async_trait]
impl<T: MultipartTransport> MultipartTransport for FaultTransport<T> {
    async fn create_multipart(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
    ) -> TransferResult<UploadId> {
        let mut recorded = RecordedRequest::new(Operation::CreateMultipart);
        recorded.object = Some(object.clone());
        recorded.preconditions = Some(preconditions.clone());
        self.record(recorded);

        self.before(Operation::CreateMultipart).await?;
        let result = self.inner.create_multipart(object, preconditions).await;
        self.after(Operation::CreateMultipart, result)
    }

    async fn upload_part(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        part_number: u32,
        data: Bytes,
        checksums: Option<&ObjectChecksums>,
    ) -> TransferResult<String> {
        let mut recorded = RecordedRequest::new(Operation::UploadPart);
        recorded.object = Some(object.clone());
        recorded.part_number = Some(part_number);
        recorded.len = Some(data.len() as u64);
        self.record(recorded);

        self.before(Operation::UploadPart).await?;
        let result = self
            .inner
            .upload_part(object, upload_id, part_number, data, checksums)
            .await;
        self.after(Operation::UploadPart, result)
    }

    async fn list_parts(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
    ) -> TransferResult<Vec<PartInfo>> {
        let mut recorded = RecordedRequest::new(Operation::ListParts);
        recorded.object = Some(object.clone());
        self.record(recorded);

        self.before(Operation::ListParts).await?;
        let result = self.inner.list_parts(object, upload_id).await;
        self.after(Operation::ListParts, result)
    }

    async fn complete_multipart(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> TransferResult<ObjectInfo> {
        let mut recorded = RecordedRequest::new(Operation::CompleteMultipart);
        recorded.object = Some(object.clone());
        self.record(recorded);

        self.before(Operation::CompleteMultipart).await?;
        let result = self.inner.complete_multipart(object, upload_id, parts).await;
        self.after(Operation::CompleteMultipart, result)
    }

    async fn abort_multipart(&self, object: &ObjectId, upload_id: &UploadId) -> TransferResult<()> {
        let mut recorded = RecordedRequest::new(Operation::AbortMultipart);
        recorded.object = Some(object.clone());
        self.record(recorded);

        self.before(Operation::AbortMultipart).await?;
        let result = self.inner.abort_multipart(object, upload_id).await;
        self.after(Operation::AbortMultipart, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTransport;

    async fn drain(mut body: ByteStream) -> (Vec<u8>, Option<std::io::ErrorKind>) {
        let mut out = Vec::new();
        while let Some(item) = body.next().await {
            match item {
                Ok(bytes) => out.extend_from_slice(&bytes),
                Err(e) => return (out, Some(e.kind())),
            }
        }
        (out, None)
    }

    fn setup() -> (FaultTransport<MemoryTransport>, ObjectId) {
        let memory = MemoryTransport::new().with_bucket("b");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        memory.put_object("b", "o", data, None).unwrap();
        (FaultTransport::new(memory), ObjectId::new("b", "o"))
    }

    fn whole(object: &ObjectId, start: u64) -> ReadRequest {
        ReadRequest {
            object: object.clone(),
            range: ByteRange::from_start(start),
            if_generation_match: None,
        }
    }

    #[tokio::test]
    async fn break_delivers_exact_prefix() {
        let (transport, id) = setup();
        transport.inject(Fault::BreakReadAt { offset: 100_000 });

        // A range that does not cover the offset leaves the fault queued
        let early = ReadRequest {
            range: ByteRange::new(0, Some(10)),
            ..whole(&id, 0)
        };
        let (bytes, err) = drain(transport.read_range(early).await.unwrap().body).await;
        assert_eq!(bytes.len(), 10);
        assert!(err.is_none());
        assert_eq!(transport.pending_faults(), 1);

        let (bytes, err) = drain(transport.read_range(whole(&id, 40_000)).await.unwrap().body).await;
        assert_eq!(bytes.len(), 60_000);
        assert_eq!(err, Some(std::io::ErrorKind::ConnectionReset));
        assert_eq!(transport.pending_faults(), 0);
    }

    #[tokio::test]
    async fn truncation_ends_stream_quietly() {
        let (transport, id) = setup();
        transport.inject(Fault::TruncateReadAt { offset: 5 });
        let (bytes, err) = drain(transport.read_range(whole(&id, 0)).await.unwrap().body).await;
        assert_eq!(bytes.len(), 5);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn status_faults_are_one_shot_and_recorded() {
        let (transport, id) = setup();
        transport.fail_next(Operation::ReadRange, 503, 1);

        let err = transport.read_range(whole(&id, 0)).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert!(transport.read_range(whole(&id, 0)).await.is_ok());
        assert_eq!(transport.requests_for(Operation::ReadRange).len(), 2);
    }
}
