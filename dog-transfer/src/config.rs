use crate::{RetryPolicy, TransferError, TransferResult};

/// Configuration for transfer operations
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Stored bytes requested per range GET
    pub read_chunk_size: u64,

    /// Bytes sent per resumable chunk (rounded up to the chunk alignment)
    pub write_chunk_size: u64,

    /// Retry policy applied to every logical operation
    pub retry: RetryPolicy,

    /// Rules for part-based uploads
    pub upload_rules: UploadRules,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 2 * 1024 * 1024,   // 2MB
            write_chunk_size: 16 * 1024 * 1024, // 16MB
            retry: RetryPolicy::default(),
            upload_rules: UploadRules::default(),
        }
    }
}

/// Rules for multipart uploads
#[derive(Debug, Clone)]
pub struct UploadRules {
    /// Part size used when splitting a source (bytes)
    pub part_size: u64,

    /// Highest part number accepted
    pub max_parts: u32,

    /// Parts in flight at once for parallel uploads
    pub max_concurrency: usize,
}

impl Default for UploadRules {
    fn default() -> Self {
        Self {
            part_size: 8 * 1024 * 1024, // 8MB
            max_parts: 10_000,
            max_concurrency: 4,
        }
    }
}

impl TransferConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from `DOG_TRANSFER_*` environment variables
    pub fn from_env() -> TransferResult<Self> {
        let mut config = Self::default();

        if let Some(size) = env_parse::<u64>("DOG_TRANSFER_READ_CHUNK_SIZE")? {
            config.read_chunk_size = size;
        }
        if let Some(size) = env_parse::<u64>("DOG_TRANSFER_WRITE_CHUNK_SIZE")? {
            config.write_chunk_size = size;
        }
        if let Some(attempts) = env_parse::<u32>("DOG_TRANSFER_MAX_ATTEMPTS")? {
            config.retry = config.retry.with_max_attempts(attempts);
        }
        if let Some(size) = env_parse::<u64>("DOG_TRANSFER_PART_SIZE")? {
            config.upload_rules.part_size = size;
        }
        if let Some(concurrency) = env_parse::<usize>("DOG_TRANSFER_MAX_CONCURRENCY")? {
            config.upload_rules.max_concurrency = concurrency;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_read_chunk_size(mut self, bytes: u64) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    pub fn with_write_chunk_size(mut self, bytes: u64) -> Self {
        self.write_chunk_size = bytes;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set upload rules
    pub fn with_upload_rules(mut self, rules: UploadRules) -> Self {
        self.upload_rules = rules;
        self
    }

    /// Reject settings no transfer could run with
    pub fn validate(&self) -> TransferResult<()> {
        if self.read_chunk_size == 0 {
            return Err(TransferError::invalid("read_chunk_size must be positive"));
        }
        if self.write_chunk_size == 0 {
            return Err(TransferError::invalid("write_chunk_size must be positive"));
        }
        self.upload_rules.validate()
    }
}

impl UploadRules {
    /// Create new upload rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Set part size
    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    /// Set max parts
    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }

    pub fn with_max_concurrency(mut self, concurrency: usize) -> Self {
        self.max_concurrency = concurrency;
        self
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.part_size == 0 {
            return Err(TransferError::invalid("part_size must be positive"));
        }
        if self.max_parts == 0 {
            return Err(TransferError::invalid("max_parts must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(TransferError::invalid("max_concurrency must be positive"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> TransferResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| TransferError::invalid(format!("{key} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}
