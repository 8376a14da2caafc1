//! Record the stable accession of a verified file

use super::{required_sha256, ROUTE_COMPLETED};
use crate::broker::Delivery;
use crate::catalogue::Catalogue;
use crate::error::StageResult;
use crate::service::{Stage, StageContext};
use async_trait::async_trait;
use sda_common::messages::{IngestionAccession, IngestionCompletion, SchemaName};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct Finalize {
    catalogue: Arc<dyn Catalogue>,
    routing_key: String,
}

impl Finalize {
    pub fn new(catalogue: Arc<dyn Catalogue>, routing_key: Option<&str>) -> Self {
        Self {
            catalogue,
            routing_key: routing_key.unwrap_or(ROUTE_COMPLETED).to_string(),
        }
    }
}

#[async_trait]
impl Stage for Finalize {
    fn name(&self) -> &'static str {
        "finalize"
    }

    #[instrument(name = "finalize", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let message: IngestionAccession = ctx.decode(SchemaName::IngestionAccession, delivery)?;
        let sha256 = required_sha256(&message.decrypted_checksums)?;

        let file_id = self
            .catalogue
            .set_accession(
                &message.accession_id,
                &message.user,
                &message.filepath,
                sha256,
                &delivery.correlation_id,
            )
            .await?;
        info!(%file_id, accession_id = %message.accession_id, "Accession recorded");

        let completion = IngestionCompletion::from(message);
        ctx.publish(
            &delivery.correlation_id,
            &self.routing_key,
            SchemaName::IngestionCompletion,
            &completion,
        )
        .await
    }

    async fn close(&self) {
        self.catalogue.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalogue::{ArchivedObject, FileState, VerifiedObject};
    use crate::error::Disposition;
    use crate::stages::testing::Fixture;
    use sda_common::checksum::checksum_of;
    use sda_common::{Checksum, ChecksumAlgorithm};
    use uuid::Uuid;

    async fn verified(fx: &Fixture, path: &str, plain: &[u8]) -> (Uuid, Checksum) {
        let id = fx.catalogue.register_file(path, "u1").await.unwrap();
        let sha = checksum_of(plain, ChecksumAlgorithm::Sha256);
        fx.catalogue
            .set_archived(
                id,
                &ArchivedObject {
                    path: id.to_string(),
                    size: 10,
                    inbox_checksum: sha.clone(),
                    archive_checksum: sha.clone(),
                },
                "c",
            )
            .await
            .unwrap();
        fx.catalogue
            .set_verified(
                id,
                &VerifiedObject {
                    encrypted_checksum: sha.clone(),
                    decrypted_checksums: vec![sha.clone()],
                    decrypted_size: plain.len() as u64,
                },
                "c",
            )
            .await
            .unwrap();
        (id, sha)
    }

    fn accession(path: &str, id: &str, sha: &Checksum) -> Vec<u8> {
        serde_json::to_vec(&IngestionAccession::new("u1", path, id, vec![sha.clone()])).unwrap()
    }

    #[tokio::test]
    async fn test_finalize_sets_accession_and_completes() {
        let fx = Fixture::new().await;
        let (id, sha) = verified(&fx, "u1/a.c4gh", b"a").await;
        let stage = Finalize::new(fx.catalogue.clone(), None);

        stage
            .handle(&fx.ctx, &fx.delivery("accession", accession("u1/a.c4gh", "EGAF01", &sha)))
            .await
            .unwrap();

        let record = fx.catalogue.file(id).await.unwrap();
        assert_eq!(record.stable_id.as_deref(), Some("EGAF01"));
        assert_eq!(record.state, FileState::Completed);
        let published = fx.broker.published_to(ROUTE_COMPLETED).await;
        let completion: IngestionCompletion = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(completion.accession_id, "EGAF01");
    }

    #[tokio::test]
    async fn test_replay_is_noop_and_collision_is_permanent() {
        let fx = Fixture::new().await;
        let (_, sha) = verified(&fx, "u1/a.c4gh", b"a").await;
        let stage = Finalize::new(fx.catalogue.clone(), None);
        let delivery = fx.delivery("accession", accession("u1/a.c4gh", "EGAF01", &sha));

        stage.handle(&fx.ctx, &delivery).await.unwrap();
        stage.handle(&fx.ctx, &delivery).await.unwrap();

        let err = stage
            .handle(&fx.ctx, &fx.delivery("accession", accession("u1/a.c4gh", "EGAF02", &sha)))
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::PermanentData);
    }

    #[tokio::test]
    async fn test_accession_before_verify_waits() {
        let fx = Fixture::new().await;
        let sha = checksum_of(b"not yet", ChecksumAlgorithm::Sha256);
        let err = Finalize::new(fx.catalogue.clone(), None)
            .handle(&fx.ctx, &fx.delivery("accession", accession("u1/b.c4gh", "EGAF03", &sha)))
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::MissingPrecondition);
    }
}
