//! Read-side endpoint for one transfer item.

use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::CHUNK_SIZE;
use crate::error::Result;

/// Streams an existing file's bytes in fixed-size chunks.
///
/// An empty file still yields exactly one empty chunk so the receiver
/// creates the file.
pub struct FileSource {
    relative_path: String,
    file: Option<File>,
    bytes_read: u64,
    yielded_any: bool,
}

impl FileSource {
    /// Open a file for streaming.
    pub async fn open(path: &Path, relative_path: impl Into<String>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            relative_path: relative_path.into(),
            file: Some(file),
            bytes_read: 0,
            yielded_any: false,
        })
    }

    /// The peer-relative path chunks from this source are tagged with.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// Bytes handed out so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Read the next chunk, up to [`CHUNK_SIZE`] bytes. Returns `None` once
    /// the file is exhausted or the source was cancelled.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            self.file = None;
            if self.yielded_any {
                return Ok(None);
            }
            self.yielded_any = true;
            return Ok(Some(Vec::new()));
        }

        buf.truncate(filled);
        self.bytes_read += filled as u64;
        self.yielded_any = true;
        Ok(Some(buf))
    }

    /// Stop reading; no further chunks are raised.
    pub fn cancel(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_file_in_chunk_sized_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let payload = vec![7u8; CHUNK_SIZE + 100];
        std::fs::write(&path, &payload).unwrap();

        let mut source = FileSource::open(&path, "big.bin").await.unwrap();
        let first = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        let second = source.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 100);
        assert!(source.next_chunk().await.unwrap().is_none());
        assert_eq!(source.bytes_read(), payload.len() as u64);
    }

    #[tokio::test]
    async fn empty_file_yields_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();

        let mut source = FileSource::open(&path, "empty.txt").await.unwrap();
        assert_eq!(source.next_chunk().await.unwrap(), Some(Vec::new()));
        assert!(source.next_chunk().await.unwrap().is_none());
        assert_eq!(source.bytes_read(), 0);
    }

    #[tokio::test]
    async fn cancel_stops_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, vec![1u8; CHUNK_SIZE * 2]).unwrap();

        let mut source = FileSource::open(&path, "doc.txt").await.unwrap();
        assert!(source.next_chunk().await.unwrap().is_some());
        source.cancel();
        assert!(source.next_chunk().await.unwrap().is_none());
    }
}
