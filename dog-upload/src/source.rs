use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::io::ReaderStream;

use crate::ByteStream;

/// Where the bytes of an upload come from.
///
/// `open` is called once per transfer attempt and must start from the first
/// byte every time, so a retried attempt resends the whole file.
#[async_trait]
pub trait UploadSource: Send + Sync {
    async fn open(&self) -> std::io::Result<ByteStream>;
}

#[async_trait]
impl UploadSource for Bytes {
    async fn open(&self) -> std::io::Result<ByteStream> {
        let data = self.clone();
        let stream = futures_util::stream::once(async move { Ok(data) });
        Ok(Box::pin(stream))
    }
}

/// File on disk, read through a buffered tokio reader
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    read_buffer: usize,
}

impl FileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            read_buffer: 64 * 1024,
        }
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer = bytes.max(1);
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl UploadSource for FileSource {
    async fn open(&self) -> std::io::Result<ByteStream> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::pin(ReaderStream::with_capacity(file, self.read_buffer)))
    }
}
