// src/chunk.rs
//
// Chunk planning: partition a file into an ordered sequence of byte ranges.
// Deterministic and side-effect-free; the same (file_size, chunk_size) pair
// always yields an identical plan, which resume logic depends on.

use crate::constants::{MAX_CHUNK_COUNT, MAX_CHUNK_SIZE};
use crate::error::{Result, UploadError};

/// Immutable descriptor for one slice of the source file.
///
/// Chunks of a plan partition the file exactly: offsets are contiguous,
/// lengths sum to the file size, no gaps or overlaps. A chunk is never
/// split or merged once planned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based, contiguous
    pub index: u32,
    /// Byte offset into the source file
    pub offset: u64,
    /// Byte length of the raw range
    pub len: u64,
}

impl Chunk {
    /// Offset one past the last byte of this chunk
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Partition `file_size` bytes into chunks of `chunk_size`, the last chunk
/// possibly shorter. Produces exactly `ceil(file_size / chunk_size)` chunks.
///
/// Zero-length files are rejected: the remote store requires at least one
/// chunk per object.
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(UploadError::configuration("chunk size must be > 0"));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(UploadError::configuration(format!(
            "chunk size {} exceeds service maximum {}",
            chunk_size, MAX_CHUNK_SIZE
        )));
    }
    if file_size == 0 {
        return Err(UploadError::configuration(
            "cannot upload a zero-length file",
        ));
    }
    let count = file_size.div_ceil(chunk_size);
    if count > MAX_CHUNK_COUNT {
        return Err(UploadError::configuration(format!(
            "{} bytes at chunk size {} needs {} chunks, service maximum is {}",
            file_size, chunk_size, count, MAX_CHUNK_COUNT
        )));
    }

    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < file_size {
        let len = (file_size - offset).min(chunk_size);
        chunks.push(Chunk { index, offset, len });
        offset += len;
        index += 1;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partitions(chunks: &[Chunk], file_size: u64, chunk_size: u64) {
        assert_eq!(chunks.len() as u64, file_size.div_ceil(chunk_size));
        let mut expected_offset = 0u64;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index as usize, i);
            assert_eq!(c.offset, expected_offset);
            assert!(c.len > 0);
            assert!(c.len <= chunk_size);
            expected_offset = c.end();
        }
        assert_eq!(expected_offset, file_size);
        assert_eq!(chunks.iter().map(|c| c.len).sum::<u64>(), file_size);
    }

    #[test]
    fn ten_mib_file_four_mib_chunks() {
        let mib = 1024 * 1024;
        let chunks = plan_chunks(10 * mib, 4 * mib).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len, 4 * mib);
        assert_eq!(chunks[1].len, 4 * mib);
        assert_eq!(chunks[2].len, 2 * mib);
        assert_partitions(&chunks, 10 * mib, 4 * mib);
    }

    #[test]
    fn evenly_divisible_file_has_full_tail() {
        let chunks = plan_chunks(8192, 2048).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks.last().unwrap().len, 2048);
        assert_partitions(&chunks, 8192, 2048);
    }

    #[test]
    fn file_smaller_than_chunk_is_single_chunk() {
        let chunks = plan_chunks(100, 4096).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len, 100);
    }

    #[test]
    fn partition_holds_for_awkward_sizes() {
        for &(s, c) in &[(1u64, 1u64), (7, 3), (4097, 4096), (1_000_000, 333)] {
            let chunks = plan_chunks(s, c).unwrap();
            assert_partitions(&chunks, s, c);
        }
    }

    #[test]
    fn planning_is_deterministic() {
        let a = plan_chunks(1_234_567, 65_536).unwrap();
        let b = plan_chunks(1_234_567, 65_536).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            plan_chunks(100, 0),
            Err(UploadError::Configuration { .. })
        ));
    }

    #[test]
    fn zero_length_file_rejected() {
        assert!(matches!(
            plan_chunks(0, 4096),
            Err(UploadError::Configuration { .. })
        ));
    }

    #[test]
    fn oversized_chunk_rejected() {
        assert!(matches!(
            plan_chunks(100, MAX_CHUNK_SIZE + 1),
            Err(UploadError::Configuration { .. })
        ));
    }

    #[test]
    fn too_many_chunks_rejected() {
        // 1-byte chunks over a file larger than the chunk count cap
        assert!(matches!(
            plan_chunks(MAX_CHUNK_COUNT + 1, 1),
            Err(UploadError::Configuration { .. })
        ));
    }
}
