//! S3-compatible object store backend
//!
//! Writes are buffered into parts of the configured chunk size. Objects that
//! never fill one part are stored with a single `PutObject`; larger ones go
//! through a multipart upload that is completed on `finish` and aborted on
//! `abort`, so a failed transfer does not leave dangling parts in the bucket.

use super::{
    sanitize_path, Backend, ObjectReader, ObjectWriter, StorageConfig, StorageError, StorageResult,
};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region, SharedHttpClient},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use aws_smithy_http_client::{tls, Builder as HttpClientBuilder};
use std::path::Path;
use tracing::{debug, info, instrument, warn};

const MIB: usize = 1024 * 1024;

#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    part_size: usize,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("part_size", &self.part_size)
            .finish()
    }
}

impl S3Backend {
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let StorageConfig::S3 {
            accesskey,
            secretkey,
            bucket,
            region,
            chunksize,
            cacert,
            pathstyle,
            ..
        } = config
        else {
            return Err(StorageError::InvalidPath(
                "s3 backend built from posix configuration".to_string(),
            ));
        };

        let credentials = Credentials::new(accesskey, secretkey, None, None, "sda-storage");

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(region.clone()))
            .force_path_style(*pathstyle);

        if let Some(endpoint) = config.endpoint() {
            builder = builder.endpoint_url(endpoint);
        }

        if let Some(path) = cacert {
            builder = builder.http_client(http_client_trusting(path).await?);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %bucket, part_size_mib = chunksize, "S3 backend initialized");

        Ok(Self {
            client,
            bucket: bucket.clone(),
            part_size: (*chunksize as usize) * MIB,
        })
    }
}

/// HTTPS client that trusts the PEM bundle at `path` on top of the native roots
async fn http_client_trusting(path: &Path) -> StorageResult<SharedHttpClient> {
    let pem = tokio::fs::read(path).await?;
    let trust_store = tls::TrustStore::default().with_pem_certificate(pem.as_slice());
    let context = tls::TlsContext::builder()
        .with_trust_store(trust_store)
        .build()
        .map_err(|e| StorageError::Transport(format!("invalid CA bundle {}: {e}", path.display())))?;

    Ok(HttpClientBuilder::new()
        .tls_provider(tls::Provider::Rustls(tls::rustls_provider::CryptoMode::AwsLc))
        .tls_context(context)
        .build_https())
}

fn map_sdk_error<E>(err: SdkError<E, HttpResponse>, key: &str) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let detail = format!("{key}: {}", DisplayErrorContext(&err));
    match err.code() {
        Some("NoSuchKey" | "NotFound" | "NoSuchBucket") => StorageError::NotFound(detail),
        Some("AccessDenied" | "Forbidden") => StorageError::PermissionDenied(detail),
        _ => StorageError::Transport(detail),
    }
}

#[async_trait]
impl Backend for S3Backend {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn open_read(&self, path: &str) -> StorageResult<ObjectReader> {
        let key = sanitize_path(path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn open_write(&self, path: &str) -> StorageResult<Box<dyn ObjectWriter>> {
        let key = sanitize_path(path)?;
        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            part_size: self.part_size,
            buffer: Vec::with_capacity(self.part_size),
            upload_id: None,
            parts: Vec::new(),
            written: 0,
        }))
    }

    async fn size(&self, path: &str) -> StorageResult<u64> {
        let key = sanitize_path(path)?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key))?;

        output
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| StorageError::SizeUnknown(key.to_string()))
    }

    fn describe(&self) -> String {
        format!("s3:{}", self.bucket)
    }
}

struct S3Writer {
    client: Client,
    bucket: String,
    key: String,
    part_size: usize,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    written: u64,
}

impl S3Writer {
    async fn ensure_upload(&mut self) -> StorageResult<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key))?;

        let id = output
            .upload_id()
            .ok_or_else(|| StorageError::Transport(format!("{}: no upload id returned", self.key)))?
            .to_string();
        debug!(key = %self.key, upload_id = %id, "multipart upload started");
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn flush_part(&mut self) -> StorageResult<()> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as i32 + 1;
        let body = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.part_size));

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key))?;

        self.parts.push(
            CompletedPart::builder()
                .set_e_tag(output.e_tag().map(str::to_string))
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    /// Upload the tail and stitch the parts together
    async fn complete(&mut self) -> StorageResult<()> {
        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }

        let upload_id = self.ensure_upload().await?;
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &self.key))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectWriter for S3Writer {
    async fn write(&mut self, mut buf: &[u8]) -> StorageResult<()> {
        while !buf.is_empty() {
            let room = self.part_size - self.buffer.len();
            let take = room.min(buf.len());
            self.buffer.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            self.written += take as u64;

            if self.buffer.len() == self.part_size {
                self.flush_part().await?;
            }
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if self.upload_id.is_none() {
            let body = std::mem::take(&mut self.buffer);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &self.key))?;
            debug!(key = %self.key, bytes = self.written, "object stored");
            return Ok(self.written);
        }

        if let Err(e) = self.complete().await {
            warn!(key = %self.key, error = %e, "multipart upload failed, aborting");
            self.abort().await;
            return Err(e);
        }
        debug!(key = %self.key, bytes = self.written, "multipart upload completed");
        Ok(self.written)
    }

    async fn abort(self: Box<Self>) {
        let Some(upload_id) = self.upload_id else {
            return;
        };
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .send()
            .await
        {
            warn!(
                key = %self.key,
                upload_id = %upload_id,
                error = %DisplayErrorContext(&e),
                "failed to abort multipart upload"
            );
        }
    }
}
