//! Filesystem backend rooted at a configured directory

use super::{
    config::parse_mode, sanitize_path, Backend, ObjectReader, ObjectWriter, StorageConfig,
    StorageError, StorageResult,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct PosixBackend {
    root: PathBuf,
    dir_mode: u32,
}

impl PosixBackend {
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        match config {
            StorageConfig::Posix { location, mode } => Ok(Self {
                root: location.clone(),
                dir_mode: parse_mode(mode).map_err(StorageError::InvalidPath)?,
            }),
            StorageConfig::S3 { .. } => Err(StorageError::InvalidPath(
                "posix backend built from s3 configuration".to_string(),
            )),
        }
    }

    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        Ok(self.root.join(sanitize_path(path)?))
    }

    async fn ensure_parent(&self, target: &Path) -> StorageResult<()> {
        if let Some(parent) = target.parent() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(self.dir_mode);
            builder.create(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for PosixBackend {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn open_read(&self, path: &str) -> StorageResult<ObjectReader> {
        let file = File::open(self.resolve(path)?).await?;
        Ok(Box::new(BufReader::new(file)))
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn open_write(&self, path: &str) -> StorageResult<Box<dyn ObjectWriter>> {
        let target = self.resolve(path)?;
        self.ensure_parent(&target).await?;

        let mut partial = target.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        let file = File::create(&partial).await?;
        debug!(path = %partial.display(), "opened partial file");

        Ok(Box::new(PosixWriter {
            file: BufWriter::new(file),
            partial,
            target,
            written: 0,
        }))
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        let metadata = fs::metadata(self.resolve(path)?).await?;
        if !metadata.is_file() {
            return Err(StorageError::SizeUnknown(format!("{path} is not a regular file")));
        }
        Ok(metadata.len())
    }

    fn describe(&self) -> String {
        format!("posix:{}", self.root.display())
    }
}

/// Writes into `<target>.part` and renames into place on finish
struct PosixWriter {
    file: BufWriter<File>,
    partial: PathBuf,
    target: PathBuf,
    written: u64,
}

#[async_trait]
impl ObjectWriter for PosixWriter {
    async fn write(&mut self, buf: &[u8]) -> StorageResult<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        let placed = async {
            self.file.flush().await?;
            self.file.get_ref().sync_all().await?;
            fs::rename(&self.partial, &self.target).await
        }
        .await;

        if let Err(e) = placed {
            self.abort().await;
            return Err(e.into());
        }
        debug!(path = %self.target.display(), bytes = self.written, "file written");
        Ok(self.written)
    }

    async fn abort(self: Box<Self>) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.partial).await {
            warn!(path = %self.partial.display(), error = %e, "failed to remove partial file");
        }
    }
}
