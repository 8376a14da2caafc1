//! Copy a verified archive object to the backup location
//!
//! In pass-through mode the body is copied as is, under the archive path.
//! In header-copy mode the stored header is re-encrypted for the backup
//! recipient and written in front of the body, and the copy lands under the
//! original submission path so the backup is a self-contained container.

use super::{required_sha256, ROUTE_BACKUP};
use crate::broker::Delivery;
use crate::catalogue::{ArchiveLocation, Catalogue, FileEvent};
use crate::crypt4gh::{self, KeyPair, PublicKey};
use crate::error::{StageError, StageResult};
use crate::service::{Stage, StageContext};
use crate::storage::{copy_stream, sanitize_path, Backend};
use async_trait::async_trait;
use sda_common::messages::{IngestionAccession, IngestionCompletion, SchemaName};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Which message the backup queue carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupInput {
    /// `ingestion-completion` from finalize
    Completion,
    /// `ingestion-accession`, consumed alongside finalize
    Accession,
}

impl BackupInput {
    /// A queue named after accessions carries `ingestion-accession`
    pub fn for_queue(queue: &str) -> Self {
        if queue.to_ascii_lowercase().contains("accession") {
            BackupInput::Accession
        } else {
            BackupInput::Completion
        }
    }
}

/// Header re-encryption settings
pub struct HeaderCopy {
    pub service_key: KeyPair,
    pub recipient: PublicKey,
}

pub struct Backup {
    catalogue: Arc<dyn Catalogue>,
    archive: Arc<dyn Backend>,
    backup: Arc<dyn Backend>,
    input: BackupInput,
    header_copy: Option<HeaderCopy>,
    routing_key: String,
}

impl Backup {
    pub fn new(
        catalogue: Arc<dyn Catalogue>,
        archive: Arc<dyn Backend>,
        backup: Arc<dyn Backend>,
        input: BackupInput,
        header_copy: Option<HeaderCopy>,
        routing_key: Option<&str>,
    ) -> Self {
        Self {
            catalogue,
            archive,
            backup,
            input,
            header_copy,
            routing_key: routing_key.unwrap_or(ROUTE_BACKUP).to_string(),
        }
    }

    fn decode(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<IngestionCompletion> {
        Ok(match self.input {
            BackupInput::Completion => ctx.decode(SchemaName::IngestionCompletion, delivery)?,
            BackupInput::Accession => ctx
                .decode::<IngestionAccession>(SchemaName::IngestionAccession, delivery)?
                .into(),
        })
    }

    async fn header_for(&self, copy: &HeaderCopy, location: &ArchiveLocation, accession: &str) -> StageResult<Vec<u8>> {
        let stored = match self.input {
            BackupInput::Completion => self.catalogue.get_header_by_accession(accession).await?,
            // Finalize may not have recorded the accession yet
            BackupInput::Accession => self.catalogue.get_header(location.file_id).await?,
        };
        Ok(crypt4gh::reencrypt_header(&stored, &copy.service_key, &[copy.recipient])?)
    }

    async fn copy(&self, location: &ArchiveLocation, accession: &str) -> StageResult<(String, u64)> {
        let expected = location.archive_file_size;
        let on_disk = self.archive.size(&location.archive_file_path).await?;
        if on_disk != expected {
            return Err(StageError::SizeMismatch {
                what: "archive",
                expected,
                actual: on_disk,
            });
        }

        let (target, header) = match &self.header_copy {
            Some(copy) => (
                sanitize_path(&location.submission_file_path)?.to_string(),
                Some(self.header_for(copy, location, accession).await?),
            ),
            None => (location.archive_file_path.clone(), None),
        };

        let mut reader = self.archive.open_read(&location.archive_file_path).await?;
        let mut writer = self.backup.open_write(&target).await?;
        let header_len = header.as_ref().map_or(0, |h| h.len() as u64);
        if let Some(header) = header {
            if let Err(e) = writer.write(&header).await {
                writer.abort().await;
                return Err(e.into());
            }
        }

        let (writer, copied) = copy_stream(reader.as_mut(), writer, None).await?;
        if copied != expected {
            writer.abort().await;
            return Err(StageError::SizeMismatch {
                what: "backup",
                expected,
                actual: copied,
            });
        }
        let written = writer.finish().await?;
        if written != expected + header_len {
            return Err(StageError::SizeMismatch {
                what: "backup",
                expected: expected + header_len,
                actual: written,
            });
        }
        debug!(%target, written, "backup written");
        Ok((target, written))
    }
}

#[async_trait]
impl Stage for Backup {
    fn name(&self) -> &'static str {
        "backup"
    }

    #[instrument(name = "backup", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let message = self.decode(ctx, delivery)?;
        let sha256 = required_sha256(&message.decrypted_checksums)?;
        let corr = delivery.correlation_id.as_str();

        let location = self
            .catalogue
            .find_verified(&message.user, &message.filepath, sha256)
            .await?;
        let (target, size) = self.copy(&location, &message.accession_id).await?;

        self.catalogue
            .log_event(
                location.file_id,
                FileEvent::BackedUp,
                Some(corr),
                Some(&message.user),
                &json!({
                    "backup_path": target,
                    "size": size,
                    "header_copy": self.header_copy.is_some(),
                }),
            )
            .await?;
        info!(
            file_id = %location.file_id,
            accession_id = %message.accession_id,
            %target,
            size,
            "File backed up"
        );

        ctx.publish(corr, &self.routing_key, SchemaName::IngestionCompletion, &message)
            .await
    }

    async fn close(&self) {
        self.catalogue.close().await;
    }
}
