//! Uniform byte storage over a local filesystem or an S3-compatible store
//!
//! The pipeline only ever needs three things from a storage location: a
//! streaming reader, a streaming writer and the size of an object. Both
//! backends implement [`Backend`]; callers never know which one they hold.
//!
//! Writers are explicit about their outcome: [`ObjectWriter::finish`] makes
//! the object visible and [`ObjectWriter::abort`] discards partial data, so a
//! failed copy never leaves orphan parts behind.

use async_trait::async_trait;
use sda_common::checksum::MultiDigester;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, warn};

pub mod config;
pub mod posix;
pub mod s3;

pub use config::StorageConfig;

/// Block size used when streaming between storages.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Storage operation errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Storage transport failure: {0}")]
    Transport(String),

    #[error("Object size unknown: {0}")]
    SizeUnknown(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            _ => StorageError::Transport(err.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Streaming reader over one object
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Streaming writer over one object
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append a block
    async fn write(&mut self, buf: &[u8]) -> StorageResult<()>;

    /// Make the object durable and visible, returning the bytes written
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>);
}

/// A storage location
#[async_trait]
pub trait Backend: Send + Sync {
    async fn open_read(&self, path: &str) -> StorageResult<ObjectReader>;

    async fn open_write(&self, path: &str) -> StorageResult<Box<dyn ObjectWriter>>;

    async fn size(&self, path: &str) -> StorageResult<u64>;

    /// Human readable location for logs
    fn describe(&self) -> String;
}

/// Build the backend described by `config`
pub async fn init(config: &StorageConfig) -> StorageResult<Arc<dyn Backend>> {
    match config {
        StorageConfig::Posix { .. } => Ok(Arc::new(posix::PosixBackend::new(config)?)),
        StorageConfig::S3 { .. } => Ok(Arc::new(s3::S3Backend::new(config).await?)),
    }
}

/// Stream `reader` into `writer` until EOF, feeding `digest` on the way.
///
/// Returns the number of bytes copied. The writer is not finished here; on a
/// read or write failure it is aborted before the error is returned.
pub async fn copy_stream(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    mut writer: Box<dyn ObjectWriter>,
    mut digest: Option<&mut MultiDigester>,
) -> StorageResult<(Box<dyn ObjectWriter>, u64)> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, copied = total, "read failed while streaming, aborting write");
                writer.abort().await;
                return Err(StorageError::Transport(e.to_string()));
            },
        };

        if let Some(digest) = digest.as_deref_mut() {
            digest.update(&buffer[..read]);
        }

        if let Err(e) = writer.write(&buffer[..read]).await {
            writer.abort().await;
            return Err(e);
        }
        total += read as u64;
    }

    debug!(bytes = total, "stream copied");
    Ok((writer, total))
}

/// Reader adapter that feeds every byte it yields into a digest
pub struct HashingReader<R> {
    inner: R,
    digest: MultiDigester,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, digest: MultiDigester) -> Self {
        Self { inner, digest }
    }

    /// Bytes read so far
    pub fn bytes(&self) -> u64 {
        self.digest.bytes()
    }

    pub fn into_digest(self) -> MultiDigester {
        self.digest
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.digest.update(&buf.filled()[before..]);
        }
        poll
    }
}

/// Reject absolute paths and parent traversal in object paths
pub fn sanitize_path(path: &str) -> StorageResult<&str> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.split('/').any(|part| part == "..") {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(trimmed)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sda_common::checksum::{checksum_of, ChecksumAlgorithm};

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/u1/a.c4gh").unwrap(), "u1/a.c4gh");
        assert!(sanitize_path("../etc/passwd").is_err());
        assert!(sanitize_path("u1/../../x").is_err());
        assert!(sanitize_path("/").is_err());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: StorageError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(matches!(err, StorageError::NotFound(_)));
        let err: StorageError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        let err: StorageError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, StorageError::Transport(_)));
    }

    #[tokio::test]
    async fn test_copy_stream_digests_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = posix::PosixBackend::new(&StorageConfig::for_posix(dir.path())).unwrap();

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader: &[u8] = &data;
        let writer = backend.open_write("copy/target").await.unwrap();
        let mut digest = MultiDigester::new(&[ChecksumAlgorithm::Sha256]);

        let (writer, copied) = copy_stream(&mut reader, writer, Some(&mut digest)).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), data.len() as u64);
        assert_eq!(copied, data.len() as u64);
        assert_eq!(digest.finalize()[0], checksum_of(&data, ChecksumAlgorithm::Sha256));
        assert_eq!(backend.size("copy/target").await.unwrap(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_hashing_reader_sees_every_byte() {
        let data = b"header bytes then body bytes".to_vec();
        let mut reader = HashingReader::new(
            &data[..],
            MultiDigester::new(&[ChecksumAlgorithm::Sha256]),
        );

        let mut head = [0u8; 6];
        reader.read_exact(&mut head).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();

        assert_eq!(reader.bytes(), data.len() as u64);
        assert_eq!(
            reader.into_digest().finalize()[0],
            checksum_of(&data, ChecksumAlgorithm::Sha256)
        );
    }
}
