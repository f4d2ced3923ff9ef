//! Splits a file into fixed-size chunk ranges.

use std::ops::Range;
use thiserror::Error;

/// Default chunk size: 2.5 MiB, below a 4 MiB request-body ceiling.
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024 / 2;

/// Number of consecutive chunks merged into one multipart part.
pub const MERGE_BATCH_SIZE: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("file size must be greater than zero")]
    EmptyFile,
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}

/// How a file of `file_size` bytes is cut into chunks of `chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, CodecError> {
        if chunk_size == 0 {
            return Err(CodecError::ZeroChunkSize);
        }
        if file_size == 0 {
            return Err(CodecError::EmptyFile);
        }
        Ok(Self {
            file_size,
            chunk_size,
            total_chunks: file_size.div_ceil(chunk_size),
        })
    }

    /// Byte range of chunk `index`, or `None` past the end.
    pub fn range(&self, index: u64) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Some(start..end)
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u64, Range<u64>)> + '_ {
        (0..self.total_chunks).filter_map(|index| self.range(index).map(|r| (index, r)))
    }

    /// Expected byte size of chunk `index`.
    pub fn chunk_len(&self, index: u64) -> Option<u64> {
        self.range(index).map(|r| r.end - r.start)
    }

    /// True when `MERGE_BATCH_SIZE` chunks reach `min_part_size`, or the whole
    /// file fits in a single batch (whose part is then also the last one).
    pub fn conforms_to(&self, min_part_size: u64) -> bool {
        self.total_chunks <= MERGE_BATCH_SIZE as u64
            || self.chunk_size * MERGE_BATCH_SIZE as u64 >= min_part_size
    }
}
