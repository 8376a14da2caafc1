//! Copy an inbox submission into the archive
//!
//! The container header is split off and stored in the catalogue; only the
//! ciphertext body lands in the archive, under the file id. Redeliveries of
//! a file that is already archived skip the copy and republish.

use super::{sha256_of, ROUTE_ARCHIVED};
use crate::broker::Delivery;
use crate::catalogue::{ArchivedObject, Catalogue, FileEvent, FileState};
use crate::crypt4gh::{self, KeyPair};
use crate::error::{StageError, StageResult};
use crate::service::{Stage, StageContext};
use crate::storage::{copy_stream, sanitize_path, Backend, HashingReader};
use async_trait::async_trait;
use sda_common::checksum::MultiDigester;
use sda_common::messages::{IngestionTrigger, IngestionVerification, SchemaName};
use sda_common::ChecksumAlgorithm;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct Ingest {
    catalogue: Arc<dyn Catalogue>,
    inbox: Arc<dyn Backend>,
    archive: Arc<dyn Backend>,
    key: KeyPair,
    routing_key: String,
}

impl Ingest {
    pub fn new(
        catalogue: Arc<dyn Catalogue>,
        inbox: Arc<dyn Backend>,
        archive: Arc<dyn Backend>,
        key: KeyPair,
        routing_key: Option<&str>,
    ) -> Self {
        Self {
            catalogue,
            inbox,
            archive,
            key,
            routing_key: routing_key.unwrap_or(ROUTE_ARCHIVED).to_string(),
        }
    }

    async fn announce(
        &self,
        ctx: &StageContext,
        delivery: &Delivery,
        trigger: &IngestionTrigger,
        file_id: Uuid,
        archive_path: &str,
    ) -> StageResult<()> {
        let message = IngestionVerification {
            user: trigger.user.clone(),
            filepath: trigger.filepath.clone(),
            file_id,
            archive_path: archive_path.to_string(),
            encrypted_checksums: trigger.encrypted_checksums.clone(),
            re_verify: false,
        };
        ctx.publish(
            &delivery.correlation_id,
            &self.routing_key,
            SchemaName::IngestionVerification,
            &message,
        )
        .await
    }

    /// Stream the inbox object into the archive. Returns what `set-archived`
    /// records.
    async fn archive_body(&self, file_id: Uuid, inbox_path: &str) -> StageResult<ArchivedObject> {
        let expected = self.inbox.size(inbox_path).await?;
        let reader = self.inbox.open_read(inbox_path).await?;
        let mut reader = HashingReader::new(reader, MultiDigester::new(&[ChecksumAlgorithm::Sha256]));

        let header = crypt4gh::read_header(&mut reader).await?;
        crypt4gh::decrypt_header(&header, &self.key)?;
        self.catalogue.store_header(file_id, &header).await?;

        let archive_path = file_id.to_string();
        let writer = self.archive.open_write(&archive_path).await?;
        let mut body_digest = MultiDigester::new(&[ChecksumAlgorithm::Sha256]);
        let (writer, copied) = copy_stream(&mut reader, writer, Some(&mut body_digest)).await?;

        if reader.bytes() != expected {
            writer.abort().await;
            return Err(StageError::SizeMismatch {
                what: "inbox",
                expected,
                actual: reader.bytes(),
            });
        }
        let written = writer.finish().await?;
        if written != copied {
            return Err(StageError::SizeMismatch {
                what: "archive",
                expected: copied,
                actual: written,
            });
        }

        Ok(ArchivedObject {
            path: archive_path,
            size: written,
            inbox_checksum: sha256_of(reader.into_digest())?,
            archive_checksum: sha256_of(body_digest)?,
        })
    }
}

#[async_trait]
impl Stage for Ingest {
    fn name(&self) -> &'static str {
        "ingest"
    }

    #[instrument(name = "ingest", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let trigger: IngestionTrigger = ctx.decode(SchemaName::IngestionTrigger, delivery)?;
        let inbox_path = sanitize_path(&trigger.filepath)?;
        let corr = delivery.correlation_id.as_str();

        let file_id = self
            .catalogue
            .register_file(&trigger.filepath, &trigger.user)
            .await?;
        let record = self.catalogue.file(file_id).await?;
        if record.state >= FileState::Archived {
            if let Some(archive_path) = record.archive_file_path.as_deref() {
                info!(%file_id, state = %record.state, "File already archived, republishing");
                return self.announce(ctx, delivery, &trigger, file_id, archive_path).await;
            }
            warn!(%file_id, state = %record.state, "Archived file has no archive path, copying again");
        }

        self.catalogue
            .log_event(
                file_id,
                FileEvent::Started,
                Some(corr),
                Some(&trigger.user),
                &json!({ "filepath": trigger.filepath }),
            )
            .await?;

        let archived = self.archive_body(file_id, inbox_path).await?;
        self.catalogue.set_archived(file_id, &archived, corr).await?;
        info!(
            %file_id,
            user = %trigger.user,
            filepath = %trigger.filepath,
            size = archived.size,
            "File archived"
        );

        self.announce(ctx, delivery, &trigger, file_id, &archived.path).await
    }

    async fn close(&self) {
        self.catalogue.close().await;
    }
}
