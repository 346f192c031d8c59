//! Persisted bookkeeping of which bytes of a resource are on disk.
//!
//! The map is rewritten to its metadata file after every mutation, so a
//! crash can leave at most one torn write behind. The binary encoding is
//! versioned and length-checked end to end: any truncation, version skew or
//! internal inconsistency makes decoding fail, and the caller falls back to
//! an empty map rather than trusting bad metadata.

use std::ops::Range;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::range_set::RangeSet;

const MAGIC: u32 = 0x4D43_4D50; // "MCMP"
const FORMAT_VERSION: u32 = 1;
const FLAG_TRUNCATION: u8 = 1 << 0;
const FLAG_PROGRESS: u8 = 1 << 1;

/// Errors produced while decoding or loading a persisted range map.
#[derive(Debug, thiserror::Error)]
pub enum FileMapError {
    /// Metadata file does not start with the expected magic number
    #[error("metadata magic mismatch")]
    BadMagic,

    /// Metadata was written by an unknown format version
    #[error("unsupported metadata version {version}")]
    UnsupportedVersion {
        /// Version number found in the file
        version: u32,
    },

    /// Encoding ended before all announced fields were present
    #[error("metadata encoding is truncated")]
    TruncatedEncoding,

    /// Decoded fields violate the map's invariants
    #[error("metadata is internally inconsistent: {reason}")]
    Inconsistent {
        /// Description of the violated invariant
        reason: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which byte ranges of one resource are present on disk, plus the
/// authoritative total size once known and a coarse progress hint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileRangeMap {
    ranges: RangeSet,
    truncation_size: Option<i64>,
    progress: Option<f32>,
}

impl FileRangeMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes physically present on disk.
    pub fn ranges(&self) -> &RangeSet {
        &self.ranges
    }

    /// Authoritative total resource size, once known.
    pub fn truncation_size(&self) -> Option<i64> {
        self.truncation_size
    }

    /// Best-effort fractional progress supplied by the fetcher.
    pub fn progress(&self) -> Option<f32> {
        self.progress
    }

    /// Total number of stored bytes. Reported to storage accounting as the
    /// resource's size estimate.
    pub fn sum(&self) -> i64 {
        self.ranges.total_len()
    }

    /// Marks `range` as present, merging with adjacent coverage.
    pub fn fill(&mut self, range: Range<i64>) {
        self.ranges.insert(range);
    }

    /// Sets the authoritative size and drops any coverage at or beyond it.
    pub fn truncate(&mut self, size: i64) {
        self.truncation_size = Some(size);
        self.ranges.remove(size..i64::MAX);
    }

    /// Forgets everything: coverage, size and progress.
    pub fn reset(&mut self) {
        self.ranges.clear();
        self.truncation_size = None;
        self.progress = None;
    }

    /// Records a fetcher-supplied progress hint.
    pub fn progress_updated(&mut self, progress: f32) {
        self.progress = Some(progress);
    }

    /// Whether the whole resource is present: the total size is known and
    /// every byte below it is stored.
    pub fn is_complete(&self) -> bool {
        match self.truncation_size {
            Some(size) => self.ranges.covers(&(0..size)),
            None => false,
        }
    }

    /// Returns the readable sub-range for `range` if and only if the whole
    /// of it (clipped to the truncation size) is present.
    ///
    /// A partial prefix is not a match. A request lying entirely at or
    /// beyond the truncation size yields `None`.
    pub fn contains(&self, range: &Range<i64>) -> Option<Range<i64>> {
        let mut upper = range.end;
        if let Some(truncation) = self.truncation_size {
            upper = upper.min(truncation);
        }
        if range.start >= upper {
            return None;
        }
        let clipped = range.start..upper;
        if self.ranges.covers(&clipped) {
            Some(clipped)
        } else {
            None
        }
    }

    /// Encodes the map into its on-disk representation.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(32 + self.ranges.range_count() * 16);
        buffer.put_u32(MAGIC);
        buffer.put_u32(FORMAT_VERSION);

        let mut flags = 0u8;
        if self.truncation_size.is_some() {
            flags |= FLAG_TRUNCATION;
        }
        if self.progress.is_some() {
            flags |= FLAG_PROGRESS;
        }
        buffer.put_u8(flags);

        if let Some(size) = self.truncation_size {
            buffer.put_i64(size);
        }
        if let Some(progress) = self.progress {
            buffer.put_f32(progress);
        }

        buffer.put_u32(self.ranges.range_count() as u32);
        for range in self.ranges.iter() {
            buffer.put_i64(range.start);
            buffer.put_i64(range.end);
        }
        buffer.freeze()
    }

    /// Decodes a map from its on-disk representation, validating every
    /// invariant the encoder maintains.
    pub fn decode(mut buffer: &[u8]) -> Result<Self, FileMapError> {
        if buffer.remaining() < 4 {
            return Err(FileMapError::TruncatedEncoding);
        }
        if buffer.get_u32() != MAGIC {
            return Err(FileMapError::BadMagic);
        }
        if buffer.remaining() < 4 {
            return Err(FileMapError::TruncatedEncoding);
        }
        let version = buffer.get_u32();
        if version != FORMAT_VERSION {
            return Err(FileMapError::UnsupportedVersion { version });
        }
        if buffer.remaining() < 1 {
            return Err(FileMapError::TruncatedEncoding);
        }
        let flags = buffer.get_u8();

        let truncation_size = if flags & FLAG_TRUNCATION != 0 {
            if buffer.remaining() < 8 {
                return Err(FileMapError::TruncatedEncoding);
            }
            Some(buffer.get_i64())
        } else {
            None
        };
        let progress = if flags & FLAG_PROGRESS != 0 {
            if buffer.remaining() < 4 {
                return Err(FileMapError::TruncatedEncoding);
            }
            Some(buffer.get_f32())
        } else {
            None
        };

        if buffer.remaining() < 4 {
            return Err(FileMapError::TruncatedEncoding);
        }
        let count = buffer.get_u32() as usize;
        if buffer.remaining() != count * 16 {
            return Err(FileMapError::TruncatedEncoding);
        }

        let mut ranges = Vec::with_capacity(count);
        let mut previous_end: Option<i64> = None;
        for _ in 0..count {
            let start = buffer.get_i64();
            let end = buffer.get_i64();
            if start >= end {
                return Err(FileMapError::Inconsistent {
                    reason: format!("empty or inverted range {start}..{end}"),
                });
            }
            if let Some(previous) = previous_end
                && previous >= start
            {
                return Err(FileMapError::Inconsistent {
                    reason: format!("ranges out of order or touching at {start}"),
                });
            }
            if let Some(truncation) = truncation_size
                && end > truncation
            {
                return Err(FileMapError::Inconsistent {
                    reason: format!("range ends at {end}, past truncation size {truncation}"),
                });
            }
            previous_end = Some(end);
            ranges.push(start..end);
        }

        Ok(Self {
            ranges: ranges.into_iter().collect(),
            truncation_size,
            progress,
        })
    }

    /// Reads a persisted map from `path`.
    pub fn read(path: &Path) -> Result<Self, FileMapError> {
        let buffer = std::fs::read(path)?;
        Self::decode(&buffer)
    }

    /// Rewrites the metadata file at `path` with the current state.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.encode())
    }

    /// Loads the map for a partial file of length `data_len`, falling back
    /// to an empty map when the metadata is absent, malformed or claims
    /// coverage beyond the file's real length (stale after a crash
    /// mid-write).
    pub fn load_consistent(meta_path: &Path, data_len: u64) -> Self {
        match Self::read(meta_path) {
            Ok(map) => {
                if map
                    .ranges
                    .last_upper_bound()
                    .is_some_and(|upper| upper > data_len as i64)
                {
                    tracing::warn!(
                        meta_path = %meta_path.display(),
                        data_len,
                        "metadata claims bytes beyond partial file, resetting to empty"
                    );
                    Self::new()
                } else {
                    map
                }
            }
            Err(FileMapError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                Self::new()
            }
            Err(error) => {
                tracing::warn!(
                    meta_path = %meta_path.display(),
                    %error,
                    "discarding unreadable metadata"
                );
                Self::new()
            }
        }
    }
}
