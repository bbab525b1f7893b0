//! CRC32C and MD5 digests over whole objects, byte ranges and streams.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::{TransferError, TransferResult};

/// Checksums describing a complete object or part.
///
/// Either digest may be absent; verification only compares the digests
/// present on both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChecksums {
    pub crc32c: Option<u32>,
    pub md5: Option<[u8; 16]>,
}

impl ObjectChecksums {
    /// Compute both digests over `data`
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: Some(crc32c::crc32c(data)),
            md5: Some(Md5::digest(data).into()),
        }
    }

    /// Compute both digests over `data[range]`
    pub fn compute_range(data: &[u8], range: Range<usize>) -> TransferResult<Self> {
        let slice = data.get(range.clone()).ok_or_else(|| {
            TransferError::invalid(format!(
                "range {}..{} outside of {} bytes",
                range.start,
                range.end,
                data.len()
            ))
        })?;
        Ok(Self::compute(slice))
    }

    pub fn with_crc32c(mut self, crc32c: u32) -> Self {
        self.crc32c = Some(crc32c);
        self
    }

    pub fn with_md5(mut self, md5: [u8; 16]) -> Self {
        self.md5 = Some(md5);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.crc32c.is_none() && self.md5.is_none()
    }

    /// CRC32C as base64 of the big-endian bytes (the form object stores use on the wire)
    pub fn crc32c_base64(&self) -> Option<String> {
        self.crc32c.map(|c| STANDARD.encode(c.to_be_bytes()))
    }

    /// MD5 as base64 (`Content-MD5` form)
    pub fn md5_base64(&self) -> Option<String> {
        self.md5.map(|m| STANDARD.encode(m))
    }

    /// MD5 as lowercase hex, the usual single-part ETag form
    pub fn md5_hex(&self) -> Option<String> {
        self.md5
            .map(|m| m.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Fails with `ChecksumMismatch` if any digest present on both sides differs.
    ///
    /// `self` is the expected value, `actual` what was computed.
    pub fn verify(&self, actual: &ObjectChecksums) -> TransferResult<()> {
        if let (Some(expected), Some(got)) = (self.crc32c, actual.crc32c) {
            if expected != got {
                return Err(TransferError::ChecksumMismatch {
                    algorithm: "crc32c",
                    expected: STANDARD.encode(expected.to_be_bytes()),
                    actual: STANDARD.encode(got.to_be_bytes()),
                });
            }
        }
        if let (Some(expected), Some(got)) = (self.md5, actual.md5) {
            if expected != got {
                return Err(TransferError::ChecksumMismatch {
                    algorithm: "md5",
                    expected: STANDARD.encode(expected),
                    actual: STANDARD.encode(got),
                });
            }
        }
        Ok(())
    }
}

/// Decode a base64 CRC32C as sent by object stores
pub fn decode_crc32c(encoded: &str) -> TransferResult<u32> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| TransferError::invalid(format!("bad crc32c encoding: {e}")))?;
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| TransferError::invalid("crc32c must be 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Incremental hasher for data that arrives in pieces.
///
/// The CRC32C state is a plain `u32`, so it survives a write-channel
/// snapshot. MD5 state cannot be serialized; a hasher resumed from a
/// CRC32C value only produces a CRC32C.
#[derive(Clone)]
pub struct ChecksumHasher {
    crc32c: u32,
    md5: Option<Md5>,
    bytes: u64,
}

impl ChecksumHasher {
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            md5: Some(Md5::new()),
            bytes: 0,
        }
    }

    /// Continue a CRC32C computed elsewhere over `bytes` bytes
    pub fn resume_crc32c(crc32c: u32, bytes: u64) -> Self {
        Self {
            crc32c,
            md5: None,
            bytes,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        if let Some(md5) = self.md5.as_mut() {
            md5.update(data);
        }
        self.bytes += data.len() as u64;
    }

    pub fn crc32c(&self) -> u32 {
        self.crc32c
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finish(&self) -> ObjectChecksums {
        ObjectChecksums {
            crc32c: Some(self.crc32c),
            md5: self.md5.clone().map(|m| m.finalize().into()),
        }
    }
}

impl Default for ChecksumHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChecksumHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumHasher")
            .field("crc32c", &self.crc32c)
            .field("md5", &self.md5.is_some())
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        let empty = ObjectChecksums::compute(b"");
        assert_eq!(empty.crc32c_base64().as_deref(), Some("AAAAAA=="));
        assert_eq!(empty.md5_base64().as_deref(), Some("1B2M2Y8AsgTpgAmY7PhCfg=="));

        // RFC 3720 check value
        let check = ObjectChecksums::compute(b"123456789");
        assert_eq!(check.crc32c, Some(0xe306_9283));
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut hasher = ChecksumHasher::new();
        for piece in data.chunks(333) {
            hasher.update(piece);
        }
        assert_eq!(hasher.finish(), ObjectChecksums::compute(&data));
        assert_eq!(hasher.bytes_hashed(), 10_000);
    }

    #[test]
    fn resumed_crc32c_continues() {
        let data = b"hello resumable world";
        let mut first = ChecksumHasher::new();
        first.update(&data[..7]);

        let mut resumed = ChecksumHasher::resume_crc32c(first.crc32c(), 7);
        resumed.update(&data[7..]);
        let result = resumed.finish();

        assert_eq!(result.crc32c, ObjectChecksums::compute(data).crc32c);
        assert_eq!(result.md5, None);
    }

    #[test]
    fn range_digest() {
        let data = b"0123456789";
        let ranged = ObjectChecksums::compute_range(data, 2..6).unwrap();
        assert_eq!(ranged, ObjectChecksums::compute(b"2345"));
        assert!(ObjectChecksums::compute_range(data, 4..20).is_err());
    }

    #[test]
    fn verify_reports_mismatch() {
        let expected = ObjectChecksums::compute(b"abc");
        let actual = ObjectChecksums::compute(b"abd");
        let err = expected.verify(&actual).unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { algorithm: "crc32c", .. }));

        // Only digests present on both sides are compared
        let md5_only = ObjectChecksums::default().with_md5(expected.md5.unwrap());
        assert!(md5_only.verify(&ObjectChecksums::compute(b"abc")).is_ok());
    }

    #[test]
    fn crc32c_base64_round_trip() {
        let sums = ObjectChecksums::compute(b"payload");
        let decoded = decode_crc32c(&sums.crc32c_base64().unwrap()).unwrap();
        assert_eq!(Some(decoded), sums.crc32c);
    }
}
