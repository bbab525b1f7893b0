use std::sync::Arc;

use crate::multipart::DefaultUploadCoordinator;
use crate::read::{ReadChannel, ReadOptions};
use crate::transport::{MultipartTransport, Transport};
use crate::write::{WriteChannel, WriteOptions, WriteSnapshot};
use crate::{ObjectId, TransferConfig, TransferError, TransferResult};

/// Entry point that hands out channels sharing one transport and config
pub struct TransferClient<T: Transport + ?Sized = dyn Transport> {
    transport: Arc<T>,
    config: TransferConfig,
}

impl<T: Transport + ?Sized> Clone for TransferClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }
    }
}

impl<T: Transport + ?Sized> TransferClient<T> {
    /// Create a client; the config is validated up front
    pub fn new(transport: Arc<T>, config: TransferConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Open a raw read channel using the configured chunk size
    pub fn reader(&self, object: ObjectId) -> ReadChannel<T> {
        let options = ReadOptions::new().with_chunk_size(self.config.read_chunk_size);
        self.reader_with(object, options)
    }

    pub fn reader_with(&self, object: ObjectId, options: ReadOptions) -> ReadChannel<T> {
        ReadChannel::new(
            Arc::clone(&self.transport),
            object,
            self.config.retry.clone(),
            options,
        )
    }

    /// Open a write channel using the configured chunk size
    pub fn writer(&self, object: ObjectId) -> TransferResult<WriteChannel<T>> {
        let options = WriteOptions::new().with_chunk_size(self.config.write_chunk_size);
        self.writer_with(object, options)
    }

    /// Fails with [`TransferError::Unsupported`] if the transport has no resumable sessions
    pub fn writer_with(&self, object: ObjectId, options: WriteOptions) -> TransferResult<WriteChannel<T>> {
        self.ensure_resumable()?;
        Ok(WriteChannel::new(
            Arc::clone(&self.transport),
            object,
            self.config.retry.clone(),
            options,
        ))
    }

    /// Rebuild a write channel from a captured snapshot
    pub fn restore_writer(&self, snapshot: WriteSnapshot) -> TransferResult<WriteChannel<T>> {
        self.ensure_resumable()?;
        WriteChannel::restore(
            Arc::clone(&self.transport),
            snapshot,
            self.config.retry.clone(),
        )
    }

    fn ensure_resumable(&self) -> TransferResult<()> {
        if !self.transport.capabilities().supports_resumable {
            return Err(TransferError::Unsupported);
        }
        Ok(())
    }
}

impl<T: MultipartTransport + 'static> TransferClient<T> {
    /// Multipart coordinator over the same transport
    pub fn uploads(&self) -> DefaultUploadCoordinator {
        DefaultUploadCoordinator::new(
            Arc::clone(&self.transport),
            self.config.retry.clone(),
            self.config.upload_rules.clone(),
        )
    }
}
