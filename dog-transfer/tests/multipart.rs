use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_test::assert_ok;

use dog_transfer::{
    CompletedPart, DefaultUploadCoordinator, Fault, FaultTransport, MemoryTransport,
    ObjectChecksums, ObjectId, Operation, Preconditions, RetryPolicy, TransferError,
    TransportCapabilities, UploadCoordinator, UploadRules,
};

type Transport = FaultTransport<MemoryTransport>;

const MIB: usize = 1024 * 1024;

/// Test factory functions
fn setup(rules: UploadRules) -> (Arc<Transport>, DefaultUploadCoordinator, ObjectId) {
    let memory = MemoryTransport::new().with_bucket("archive");
    let transport = Arc::new(FaultTransport::new(memory));
    let policy = RetryPolicy::default()
        .with_initial_backoff(Duration::ZERO)
        .with_jitter(0.0);
    let uploads = DefaultUploadCoordinator::new(Arc::clone(&transport), policy, rules);
    (transport, uploads, ObjectId::new("archive", "video.mp4"))
}

fn limited_setup(
    limits: TransportCapabilities,
    rules: UploadRules,
) -> (Arc<Transport>, DefaultUploadCoordinator, ObjectId) {
    let memory = MemoryTransport::new().with_bucket("archive");
    let transport = Arc::new(FaultTransport::new(memory).with_capabilities(limits));
    let policy = RetryPolicy::default().with_initial_backoff(Duration::ZERO);
    let uploads = DefaultUploadCoordinator::new(Arc::clone(&transport), policy, rules);
    (transport, uploads, ObjectId::new("archive", "video.mp4"))
}

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 13 % 241) as u8).collect()
}

/// A source that is not a multiple of the part size gets a short last part
#[tokio::test]
async fn test_parallel_upload_with_short_tail() {
    let (transport, uploads, object) = setup(
        UploadRules::new()
            .with_part_size(5 * MIB as u64)
            .with_max_concurrency(4),
    );
    let data = Bytes::from(pattern(12 * 5 * MIB + 37));

    let info = uploads
        .upload_parallel(&object, &Preconditions::new(), data.clone())
        .await
        .unwrap();

    assert_eq!(info.size_bytes, data.len() as u64);
    assert!(info.etag.as_deref().unwrap().ends_with("-13\""));
    assert_eq!(transport.inner().object_bytes(&object).unwrap(), data);

    let mut parts = transport.requests_for(Operation::UploadPart);
    assert_eq!(parts.len(), 13);
    parts.sort_by_key(|p| p.part_number);
    assert_eq!(parts[12].part_number, Some(13));
    assert_eq!(parts[12].len, Some(37));
    assert_eq!(transport.inner().open_uploads(), 0);
}

/// Sequential parts are listed in order before completion assembles them
#[tokio::test]
async fn test_sequential_parts_listed_then_completed() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let part_size = 5 * MIB;
    let data = Bytes::from(pattern(12 * part_size + 37));
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let id = &session.upload_id;

    let mut completed = Vec::new();
    for (index, start) in (0..data.len()).step_by(part_size).enumerate() {
        let end = (start + part_size).min(data.len());
        let receipt = uploads
            .upload_part(&object, id, index as u32 + 1, data.slice(start..end), None)
            .await
            .unwrap();
        completed.push(receipt.completed());
    }

    let parts = uploads.list_parts(&object, id).await.unwrap();
    assert_eq!(parts.len(), 13);
    let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, (1..=13).collect::<Vec<u32>>());
    assert!(parts[..12].iter().all(|p| p.size_bytes == part_size as u64));
    assert_eq!(parts[12].size_bytes, 37);

    let info = uploads.complete_upload(&object, id, &completed).await.unwrap();
    assert_eq!(info.size_bytes, 12 * part_size as u64 + 37);
    assert_eq!(transport.inner().object_bytes(&object).unwrap(), data);
}

/// Part sizes outside the transport's limits are refused before anything is sent
#[tokio::test]
async fn test_part_limits_checked_before_sending() {
    let limits = TransportCapabilities::basic()
        .with_multipart()
        .with_part_limits(Some(5 * MIB as u64), Some(8 * MIB as u64));
    let (transport, uploads, object) =
        limited_setup(limits, UploadRules::new().with_part_size(MIB as u64));

    // Non-final parts under the minimum
    let err = uploads
        .upload_parallel(&object, &Preconditions::new(), Bytes::from(pattern(3 * MIB)))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidRequest { status: None, .. }));
    assert!(transport.requests_for(Operation::CreateMultipart).is_empty());

    // A single short part is also the last one
    let info = uploads
        .upload_parallel(&object, &Preconditions::new(), Bytes::from(pattern(MIB / 2)))
        .await
        .unwrap();
    assert_eq!(info.size_bytes, (MIB / 2) as u64);

    // Oversized parts never reach the wire
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let err = uploads
        .upload_part(&object, &session.upload_id, 1, Bytes::from(pattern(9 * MIB)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::InvalidRequest { status: None, .. }));
    assert_eq!(transport.requests_for(Operation::UploadPart).len(), 1);
}

/// Completion with a stale ETag fails without retry; the corrected list succeeds
#[tokio::test]
async fn test_wrong_etag_then_corrected_completion() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let id = &session.upload_id;

    let first = uploads
        .upload_part(&object, id, 1, Bytes::from_static(b"first "), None)
        .await
        .unwrap();
    let second = uploads
        .upload_part(&object, id, 2, Bytes::from_static(b"second"), None)
        .await
        .unwrap();

    let stale = vec![
        first.completed(),
        CompletedPart {
            part_number: 2,
            etag: "\"0000\"".to_string(),
        },
    ];
    let err = uploads.complete_upload(&object, id, &stale).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(transport.requests_for(Operation::CompleteMultipart).len(), 1);
    assert_eq!(uploads.list_parts(&object, id).await.unwrap().len(), 2);

    let info = uploads
        .complete_upload(&object, id, &[first.completed(), second.completed()])
        .await
        .unwrap();
    assert_eq!(info.size_bytes, 12);
    assert_eq!(
        transport.inner().object_bytes(&object).unwrap(),
        &b"first second"[..]
    );
}

/// Listing reports parts sorted, and re-uploading a part number replaces it
#[tokio::test]
async fn test_list_parts_sorted_and_replaced() {
    let (_transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let id = &session.upload_id;

    for number in [3, 1, 2] {
        uploads
            .upload_part(&object, id, number, Bytes::from(vec![number as u8; 4]), None)
            .await
            .unwrap();
    }
    uploads
        .upload_part(&object, id, 2, Bytes::from_static(b"replaced"), None)
        .await
        .unwrap();

    let parts = uploads.list_parts(&object, id).await.unwrap();
    let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(parts[1].size_bytes, 8);
}

/// After abort the upload is gone; a second abort reports NotFound
#[tokio::test]
async fn test_abort_then_list_and_double_abort() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let id = &session.upload_id;
    uploads
        .upload_part(&object, id, 1, Bytes::from_static(b"data"), None)
        .await
        .unwrap();

    assert_ok!(uploads.abort_upload(&object, id).await);

    assert!(uploads.list_parts(&object, id).await.unwrap_err().is_not_found());
    assert!(uploads.abort_upload(&object, id).await.unwrap_err().is_not_found());
    assert_ok!(uploads.abort_quietly(&object, id).await);
    assert_eq!(transport.inner().open_uploads(), 0);
    assert!(transport.inner().object_bytes(&object).is_none());
}

/// A part whose digest does not match its bytes is rejected and not stored
#[tokio::test]
async fn test_checksum_mismatch_rejects_part() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let id = &session.upload_id;

    let wrong = ObjectChecksums::compute(b"something else");
    let err = uploads
        .upload_part(&object, id, 1, Bytes::from_static(b"actual bytes"), Some(wrong))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    assert_eq!(transport.requests_for(Operation::UploadPart).len(), 1);
    assert!(uploads.list_parts(&object, id).await.unwrap().is_empty());
}

/// A zero-byte part completes into an empty object
#[tokio::test]
async fn test_zero_byte_part() {
    let (_transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    let id = &session.upload_id;

    let receipt = uploads
        .upload_part(&object, id, 1, Bytes::new(), None)
        .await
        .unwrap();
    assert_eq!(receipt.size_bytes, 0);

    let info = uploads
        .complete_upload(&object, id, &[receipt.completed()])
        .await
        .unwrap();
    assert_eq!(info.size_bytes, 0);
}

/// Transient part failures are retried within one budget
#[tokio::test]
async fn test_transient_part_failures_are_retried() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    transport.fail_next(Operation::UploadPart, 503, 2);

    let receipt = uploads
        .upload_part(&object, &session.upload_id, 1, Bytes::from_static(b"retry me"), None)
        .await
        .unwrap();

    assert_eq!(receipt.part_number, 1);
    assert_eq!(transport.requests_for(Operation::UploadPart).len(), 3);
}

/// Preconditions are evaluated at completion time as well
#[tokio::test]
async fn test_precondition_checked_at_completion() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let session = uploads
        .create_upload(&object, &Preconditions::new().does_not_exist())
        .await
        .unwrap();
    let receipt = uploads
        .upload_part(&object, &session.upload_id, 1, Bytes::from_static(b"late"), None)
        .await
        .unwrap();

    // Someone else creates the object in between
    transport
        .inner()
        .put_object("archive", "video.mp4", &b"winner"[..], None)
        .unwrap();

    let err = uploads
        .complete_upload(&object, &session.upload_id, &[receipt.completed()])
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::PreconditionFailed { .. }));
    assert_eq!(
        transport.inner().object_bytes(&object).unwrap(),
        &b"winner"[..]
    );
}

/// Aborting cancels a part that is still in flight
#[tokio::test]
async fn test_abort_cancels_in_flight_part() {
    let (transport, uploads, object) = setup(UploadRules::new());
    let session = uploads.create_upload(&object, &Preconditions::new()).await.unwrap();
    transport.inject(Fault::Delay {
        op: Operation::UploadPart,
        delay: Duration::from_secs(30),
    });

    let task = {
        let uploads = uploads.clone();
        let object = object.clone();
        let id = session.upload_id.clone();
        tokio::spawn(async move {
            uploads
                .upload_part(&object, &id, 1, Bytes::from_static(b"slow"), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    uploads.abort_upload(&object, &session.upload_id).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TransferError::Cancelled)));
    assert_eq!(transport.inner().open_uploads(), 0);
}
