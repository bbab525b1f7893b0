//! S3-compatible transport (AWS S3, RustFS, MinIO).
//!
//! Range reads pin the generation through `If-Match` on the object ETag.
//! S3 has no resumable sessions, so the write-channel operations report
//! `Unsupported`; large writes go through the multipart coordinator.

use async_stream::stream;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, ObjectCannedAcl,
    ServerSideEncryption,
};
use aws_sdk_s3::Client;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::env;
use tracing::debug;

use crate::checksum::decode_crc32c;
use crate::transport::{
    ChunkUpload, MultipartTransport, ReadRequest, ReadResponse, SessionStatus, StartUpload,
    Transport, TransportCapabilities,
};
use crate::{
    CompletedPart, Generation, ObjectChecksums, ObjectId, ObjectInfo, PartInfo, Preconditions,
    SessionHandle, TransferError, TransferResult, UploadId,
};

/// S3 connection settings
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for S3-compatible services; enables path-style addressing
    pub endpoint_url: Option<String>,
}

impl S3Config {
    /// Read `DOG_TRANSFER_S3_*` environment variables
    pub fn from_env() -> TransferResult<Self> {
        fn get_env(key: &str) -> TransferResult<String> {
            env::var(key)
                .map_err(|_| TransferError::invalid(format!("{} environment variable required", key)))
        }

        Ok(Self {
            region: get_env("DOG_TRANSFER_S3_REGION")?,
            access_key_id: get_env("DOG_TRANSFER_S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("DOG_TRANSFER_S3_SECRET_ACCESS_KEY")?,
            endpoint_url: env::var("DOG_TRANSFER_S3_ENDPOINT_URL").ok(),
        })
    }
}

/// Transport over the AWS S3 API
pub struct S3Transport {
    client: Client,
    /// Preconditions of open uploads, applied when they complete
    uploads: Mutex<HashMap<UploadId, Preconditions>>,
}

impl S3Transport {
    pub async fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "dog-transfer",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        let client = Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.endpoint_url.is_some())
                .build(),
        );
        Self::from_client(client)
    }

    pub async fn from_env() -> TransferResult<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            uploads: Mutex::new(HashMap::new()),
        }
    }

    fn preconditions(&self, upload_id: &UploadId) -> Preconditions {
        self.uploads
            .lock()
            .get(upload_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Total object size from a `Content-Range: bytes a-b/total` header
fn total_size(content_range: &str) -> Option<u64> {
    content_range.rsplit('/').next()?.trim().parse().ok()
}

/// Base64 MD5 of a base64 customer key, as SSE-C requires
fn customer_key_md5(key: &str) -> TransferResult<String> {
    let raw = STANDARD
        .decode(key)
        .map_err(|e| TransferError::invalid(format!("bad encryption key: {e}")))?;
    Ok(STANDARD.encode(Md5::digest(&raw)))
}

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(context) = &err {
        let status = context.raw().status().as_u16();
        let code = err.code().unwrap_or("Unknown");
        let message = err.message().unwrap_or_default();
        if matches!(code, "BadDigest" | "InvalidDigest") {
            return TransferError::ChecksumMismatch {
                algorithm: "md5",
                expected: "Content-MD5".to_string(),
                actual: message.to_string(),
            };
        }
        return TransferError::from_status(status, format!("{code}: {message}"));
    }
    if matches!(err, SdkError::TimeoutError(_)) {
        return TransferError::Timeout {
            message: DisplayErrorContext(&err).to_string(),
        };
    }
    if matches!(err, SdkError::DispatchFailure(_) | SdkError::ResponseError(_)) {
        return TransferError::transient(DisplayErrorContext(&err).to_string());
    }
    TransferError::backend(err)
}

#[async_trait]
impl Transport for S3Transport {
    async fn read_range(&self, request: ReadRequest) -> TransferResult<ReadResponse> {
        let mut get = self
            .client
            .get_object()
            .bucket(&request.object.bucket)
            .key(&request.object.name)
            .range(request.range.http_header());
        if let Some(generation) = &request.if_generation_match {
            get = get.if_match(generation.as_str());
        }

        let output = get.send().await.map_err(map_sdk_error)?;
        let generation = output
            .e_tag()
            .map(Generation::from)
            .ok_or_else(|| TransferError::invalid("response carried no ETag"))?;
        let object_size = output
            .content_range()
            .and_then(total_size)
            .or_else(|| output.content_length().map(|l| l as u64))
            .unwrap_or(0);
        let mut checksums = ObjectChecksums::default();
        if let Some(encoded) = output.checksum_crc32_c() {
            checksums.crc32c = Some(decode_crc32c(encoded)?);
        }
        debug!(object = %request.object, range = %request.range.http_header(), object_size, "s3 range read");

        let content_encoding = output.content_encoding().map(str::to_string);
        let mut body = output.body;
        Ok(ReadResponse {
            generation,
            object_size,
            content_encoding,
            checksums,
            body: Box::pin(stream! {
                while let Some(item) = body.next().await {
                    yield item.map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionAborted, e));
                }
            }),
        })
    }

    async fn start_resumable(&self, _request: StartUpload) -> TransferResult<SessionHandle> {
        Err(TransferError::Unsupported)
    }

    async fn put_chunk(
        &self,
        _session: &SessionHandle,
        _chunk: ChunkUpload,
    ) -> TransferResult<SessionStatus> {
        Err(TransferError::Unsupported)
    }

    async fn query_session(&self, _session: &SessionHandle) -> TransferResult<SessionStatus> {
        Err(TransferError::Unsupported)
    }

    async fn cancel_session(&self, _session: &SessionHandle) -> TransferResult<()> {
        Err(TransferError::Unsupported)
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::basic()
            .with_multipart()
            .with_part_limits(Some(5 * 1024 * 1024), Some(5 * 1024 * 1024 * 1024))
    }
}

#[async_trait]
impl MultipartTransport for S3Transport {
    async fn create_multipart(
        &self,
        object: &ObjectId,
        preconditions: &Preconditions,
    ) -> TransferResult<UploadId> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.name);
        if let Some(acl) = &preconditions.predefined_acl {
            create = create.acl(ObjectCannedAcl::from(acl.as_str()));
        }
        if let Some(kms_key) = &preconditions.kms_key {
            create = create
                .server_side_encryption(ServerSideEncryption::AwsKms)
                .ssekms_key_id(kms_key);
        }
        if let Some(key) = &preconditions.encryption_key {
            create = create
                .sse_customer_algorithm("AES256")
                .sse_customer_key(key)
                .sse_customer_key_md5(customer_key_md5(key)?);
        }

        let output = create.send().await.map_err(map_sdk_error)?;
        let upload_id = output
            .upload_id()
            .map(|id| UploadId::from_string(id.to_string()))
            .ok_or_else(|| TransferError::invalid("create response carried no upload id"))?;
        self.uploads.lock().insert(upload_id.clone(), preconditions.clone());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        part_number: u32,
        data: Bytes,
        checksums: Option<&ObjectChecksums>,
    ) -> TransferResult<String> {
        let mut upload = self
            .client
            .upload_part()
            .bucket(&object.bucket)
            .key(&object.name)
            .upload_id(upload_id.as_str())
            .part_number(part_number as i32)
            .body(AwsByteStream::from(data));
        if let Some(md5) = checksums.and_then(|c| c.md5_base64()) {
            upload = upload.content_md5(md5);
        }
        if let Some(key) = self.preconditions(upload_id).encryption_key {
            upload = upload
                .sse_customer_algorithm("AES256")
                .sse_customer_key_md5(customer_key_md5(&key)?)
                .sse_customer_key(key);
        }

        let output = upload.send().await.map_err(map_sdk_error)?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| TransferError::invalid("part response carried no ETag"))
    }

    async fn list_parts(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
    ) -> TransferResult<Vec<PartInfo>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut list = self
                .client
                .list_parts()
                .bucket(&object.bucket)
                .key(&object.name)
                .upload_id(upload_id.as_str());
            if let Some(marker) = &marker {
                list = list.part_number_marker(marker);
            }

            let output = list.send().await.map_err(map_sdk_error)?;
            for part in output.parts() {
                parts.push(PartInfo {
                    part_number: part.part_number().unwrap_or_default() as u32,
                    etag: part.e_tag().unwrap_or_default().to_string(),
                    size_bytes: part.size().unwrap_or_default() as u64,
                });
            }

            marker = output.next_part_number_marker().map(str::to_string);
            if !output.is_truncated().unwrap_or(false) || marker.is_none() {
                break;
            }
        }
        Ok(parts)
    }

    async fn complete_multipart(
        &self,
        object: &ObjectId,
        upload_id: &UploadId,
        parts: &[CompletedPart],
    ) -> TransferResult<ObjectInfo> {
        let cited = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let preconditions = self.preconditions(upload_id);
        let mut complete = self
            .client
            .complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.name)
            .upload_id(upload_id.as_str())
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(cited)).build());
        if preconditions.does_not_exist {
            complete = complete.if_none_match("*");
        }
        if let Some(generation) = &preconditions.if_generation_match {
            complete = complete.if_match(generation.as_str());
        }
        complete.send().await.map_err(map_sdk_error)?;
        self.uploads.lock().remove(upload_id);

        let head = self
            .client
            .head_object()
            .bucket(&object.bucket)
            .key(&object.name)
            .send()
            .await
            .map_err(map_sdk_error)?;
        let etag = head.e_tag().map(str::to_string);
        let updated_at = head
            .last_modified()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0))
            .unwrap_or_else(Utc::now);

        let mut id = object.latest();
        id.generation = etag.as_deref().map(Generation::from);
        Ok(ObjectInfo {
            id,
            size_bytes: head.content_length().unwrap_or_default() as u64,
            etag,
            content_type: head.content_type().map(str::to_string),
            content_encoding: head.content_encoding().map(str::to_string),
            checksums: ObjectChecksums::default(),
            updated_at,
        })
    }

    async fn abort_multipart(&self, object: &ObjectId, upload_id: &UploadId) -> TransferResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.name)
            .upload_id(upload_id.as_str())
            .send()
            .await
            .map_err(map_sdk_error)?;
        self.uploads.lock().remove(upload_id);
        Ok(())
    }
}
