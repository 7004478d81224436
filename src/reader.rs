// src/reader.rs
//
// Shared random-access reads over the source file. The handle is opened
// once, never mutated, and read positionally so disjoint chunk ranges can
// be read concurrently without seeking.

use crate::error::{Result, UploadError};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read-only random-access view of the source file
#[derive(Debug, Clone)]
pub struct ChunkReader {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
}

impl ChunkReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| UploadError::io(format!("opening {}", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| UploadError::io(format!("stat {}", path.display()), e))?
            .len();
        Ok(Self {
            file: Arc::new(file),
            path,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Positional reads don't touch the shared handle's cursor, so any
    /// number of chunks may read concurrently.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len as usize];
            read_exact_at(&file, &mut buf, offset)
                .map_err(|e| UploadError::io(format!("reading {}", path.display()), e))?;
            Ok(buf)
        })
        .await
        .map_err(|e| UploadError::io("read task failed", std::io::Error::other(e)))?
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "file shorter than planned range",
            ));
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn reads_exact_ranges() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let f = scratch_file(&data);
        let reader = ChunkReader::open(f.path()).unwrap();
        assert_eq!(reader.len(), data.len() as u64);

        let head = reader.read_range(0, 100).await.unwrap();
        assert_eq!(head, &data[..100]);

        let tail = reader.read_range(9_900, 100).await.unwrap();
        assert_eq!(tail, &data[9_900..]);
    }

    #[tokio::test]
    async fn concurrent_reads_share_one_handle() {
        let data: Vec<u8> = (0..64_000u32).map(|i| (i % 256) as u8).collect();
        let f = scratch_file(&data);
        let reader = ChunkReader::open(f.path()).unwrap();

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let reader = reader.clone();
            let expected = data[(i * 8_000) as usize..((i + 1) * 8_000) as usize].to_vec();
            handles.push(tokio::spawn(async move {
                let got = reader.read_range(i * 8_000, 8_000).await.unwrap();
                assert_eq!(got, expected);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn short_file_read_fails() {
        let f = scratch_file(b"tiny");
        let reader = ChunkReader::open(f.path()).unwrap();
        assert!(reader.read_range(0, 100).await.is_err());
    }
}
