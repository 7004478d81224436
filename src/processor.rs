// src/processor.rs
//
// Per-chunk payload preparation: read the chunk's byte range, optionally
// compress, checksum the exact bytes that will travel the wire.

use crate::chunk::Chunk;
use crate::constants::CHUNK_COMPRESSION_LEVEL;
use crate::error::{Result, UploadError};
use crate::reader::ChunkReader;
use bytes::Bytes;
use md5::{Digest, Md5};

/// The wire form of one chunk attempt.
///
/// `compressed` states what `bytes` actually is, not what the job asked
/// for: when compression is enabled but does not shrink the chunk, the raw
/// form is carried with `compressed == false` and the slot request declares
/// it that way.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub bytes: Bytes,
    /// 32-character lowercase hex MD5 of `bytes`
    pub checksum: String,
    pub compressed: bool,
    /// Length of the raw (pre-compression) range
    pub raw_len: u64,
}

impl ChunkPayload {
    pub fn wire_len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Compress (if asked and profitable), then checksum the transmitted form.
/// Deterministic for fixed input and compression decision.
pub fn prepare_payload(raw: Vec<u8>, compress: bool) -> Result<ChunkPayload> {
    let raw_len = raw.len() as u64;

    let (bytes, compressed) = if compress {
        let packed = zstd::bulk::compress(&raw, CHUNK_COMPRESSION_LEVEL)
            .map_err(|e| UploadError::io("compressing chunk", e))?;
        if packed.len() < raw.len() {
            (Bytes::from(packed), true)
        } else {
            (Bytes::from(raw), false)
        }
    } else {
        (Bytes::from(raw), false)
    };

    let mut hasher = Md5::new();
    hasher.update(&bytes);
    let checksum = hex::encode(hasher.finalize());

    Ok(ChunkPayload {
        bytes,
        checksum,
        compressed,
        raw_len,
    })
}

/// Read one chunk's range and prepare its wire payload. Compression is
/// CPU-bound, so it runs on the blocking pool.
pub async fn process_chunk(
    reader: &ChunkReader,
    chunk: Chunk,
    compress: bool,
) -> Result<ChunkPayload> {
    let raw = reader.read_range(chunk.offset, chunk.len).await?;
    if compress {
        tokio::task::spawn_blocking(move || prepare_payload(raw, true))
            .await
            .map_err(|e| UploadError::io("compression task failed", std::io::Error::other(e)))?
    } else {
        prepare_payload(raw, false)
    }
}
