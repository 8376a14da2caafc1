//! Decrypt an archived object and record its digests
//!
//! The stored header and the archived body are read back as one stream.
//! The encrypted digest is taken over that stream while the plaintext is
//! digested segment by segment and discarded.

use super::{sha256_of, ROUTE_VERIFIED};
use crate::broker::Delivery;
use crate::catalogue::{Catalogue, FileEvent, VerifiedObject};
use crate::crypt4gh::{self, KeyPair};
use crate::error::StageResult;
use crate::service::{Stage, StageContext};
use crate::storage::{Backend, HashingReader};
use async_trait::async_trait;
use sda_common::checksum::{find, MultiDigester};
use sda_common::messages::{IngestionAccessionRequest, IngestionVerification, SchemaName};
use sda_common::ChecksumAlgorithm;
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

pub struct Verify {
    catalogue: Arc<dyn Catalogue>,
    archive: Arc<dyn Backend>,
    key: KeyPair,
    routing_key: String,
}

impl Verify {
    pub fn new(
        catalogue: Arc<dyn Catalogue>,
        archive: Arc<dyn Backend>,
        key: KeyPair,
        routing_key: Option<&str>,
    ) -> Self {
        Self {
            catalogue,
            archive,
            key,
            routing_key: routing_key.unwrap_or(ROUTE_VERIFIED).to_string(),
        }
    }

    async fn digest(&self, message: &IngestionVerification) -> StageResult<VerifiedObject> {
        let stored = self.catalogue.get_header(message.file_id).await?;
        let body = self.archive.open_read(&message.archive_path).await?;
        let mut reader = HashingReader::new(
            stored.as_slice().chain(body),
            MultiDigester::new(&[ChecksumAlgorithm::Sha256]),
        );

        let header = crypt4gh::read_header(&mut reader).await?;
        let decrypted = crypt4gh::decrypt_header(&header, &self.key)?;

        let mut plain = MultiDigester::new(&[ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Md5]);
        let decrypted_size = crypt4gh::decrypt_body(&mut reader, &decrypted, |block| plain.update(block)).await?;

        Ok(VerifiedObject {
            encrypted_checksum: sha256_of(reader.into_digest())?,
            decrypted_checksums: plain.finalize(),
            decrypted_size,
        })
    }
}

#[async_trait]
impl Stage for Verify {
    fn name(&self) -> &'static str {
        "verify"
    }

    #[instrument(name = "verify", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let message: IngestionVerification = ctx.decode(SchemaName::IngestionVerification, delivery)?;
        let corr = delivery.correlation_id.as_str();
        let file_id = message.file_id;

        let verified = self.digest(&message).await?;

        if let Some(claimed) = find(&message.encrypted_checksums, ChecksumAlgorithm::Sha256) {
            if *claimed != verified.encrypted_checksum {
                warn!(
                    %file_id,
                    claimed = %claimed.value,
                    computed = %verified.encrypted_checksum.value,
                    "Submitted checksum differs, keeping the computed one"
                );
                self.catalogue
                    .log_event(
                        file_id,
                        FileEvent::ChecksumMismatch,
                        Some(corr),
                        Some(&message.user),
                        &json!({
                            "claimed": claimed.value,
                            "computed": verified.encrypted_checksum.value,
                        }),
                    )
                    .await?;
            }
        }

        self.catalogue.set_verified(file_id, &verified, corr).await?;
        info!(%file_id, decrypted_size = verified.decrypted_size, re_verify = message.re_verify, "File verified");

        if message.re_verify {
            return Ok(());
        }

        let request = IngestionAccessionRequest {
            user: message.user,
            filepath: message.filepath,
            decrypted_checksums: verified.decrypted_checksums,
        };
        ctx.publish(corr, &self.routing_key, SchemaName::IngestionAccessionRequest, &request)
            .await
    }

    async fn close(&self) {
        self.catalogue.close().await;
    }
}
