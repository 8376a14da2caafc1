//! Dataset mapping and dataset lifecycle events

use crate::broker::Delivery;
use crate::catalogue::{Catalogue, DatasetEvent};
use crate::error::{StageError, StageResult};
use crate::service::{Stage, StageContext};
use async_trait::async_trait;
use sda_common::messages::{DatasetMessage, SchemaName};
use std::sync::Arc;
use tracing::{info, instrument};

pub struct Mapper {
    catalogue: Arc<dyn Catalogue>,
}

impl Mapper {
    pub fn new(catalogue: Arc<dyn Catalogue>) -> Self {
        Self { catalogue }
    }
}

/// Validate a dataset message against the schema its `type` names
pub(crate) fn decode_dataset_message(ctx: &StageContext, body: &[u8]) -> StageResult<(DatasetMessage, serde_json::Value)> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| StageError::BadMessage(format!("not JSON: {e}")))?;
    let schema = match value.get("type").and_then(|t| t.as_str()) {
        Some("mapping") => SchemaName::DatasetMapping,
        Some("release") => SchemaName::DatasetRelease,
        Some("deprecate") => SchemaName::DatasetDeprecate,
        Some(other) => return Err(StageError::BadMessage(format!("unknown dataset message type {other}"))),
        None => return Err(StageError::BadMessage("dataset message without type".into())),
    };
    ctx.schemas().validate_value(schema, &value)?;
    let message = serde_json::from_value(value.clone()).map_err(|e| StageError::BadMessage(e.to_string()))?;
    Ok((message, value))
}

#[async_trait]
impl Stage for Mapper {
    fn name(&self) -> &'static str {
        "mapper"
    }

    #[instrument(name = "mapper", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let (message, raw) = decode_dataset_message(ctx, &delivery.body)?;
        let dataset_id = message.dataset_id();

        match &message {
            DatasetMessage::Mapping { accession_ids, .. } => {
                self.catalogue.map_files_to_dataset(dataset_id, accession_ids).await?;
                self.catalogue
                    .update_dataset_event(dataset_id, DatasetEvent::Registered, &raw)
                    .await?;
                info!(%dataset_id, files = accession_ids.len(), "Dataset registered");
            },
            DatasetMessage::Release { .. } => {
                self.catalogue
                    .update_dataset_event(dataset_id, DatasetEvent::Released, &raw)
                    .await?;
                info!(%dataset_id, "Dataset released");
            },
            DatasetMessage::Deprecate { .. } => {
                self.catalogue
                    .update_dataset_event(dataset_id, DatasetEvent::Deprecated, &raw)
                    .await?;
                info!(%dataset_id, "Dataset deprecated");
            },
        }
        Ok(())
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
    use sda_common::ChecksumAlgorithm;
    use serde_json::json;
    use uuid::Uuid;

    async fn completed(fx: &Fixture, path: &str, accession: &str) -> Uuid {
        let id = fx.catalogue.register_file(path, "u1").await.unwrap();
        let sha = checksum_of(path.as_bytes(), ChecksumAlgorithm::Sha256);
        fx.catalogue
            .set_archived(
                id,
                &ArchivedObject {
                    path: id.to_string(),
                    size: 1,
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
                    decrypted_size: 1,
                },
                "c",
            )
            .await
            .unwrap();
        fx.catalogue.set_accession(accession, "u1", path, &sha, "c").await.unwrap();
        id
    }

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[tokio::test]
    async fn test_mapping_makes_files_ready() {
        let fx = Fixture::new().await;
        let a = completed(&fx, "u1/a.c4gh", "A1").await;
        let b = completed(&fx, "u1/b.c4gh", "A2").await;
        let stage = Mapper::new(fx.catalogue.clone());

        let message = json!({"type": "mapping", "dataset_id": "EGAD01", "accession_ids": ["A1", "A2"]});
        stage.handle(&fx.ctx, &fx.delivery("mappings", body(message))).await.unwrap();

        for id in [a, b] {
            assert_eq!(fx.catalogue.file(id).await.unwrap().state, FileState::Ready);
        }
        assert_eq!(
            fx.catalogue.dataset_accessions("EGAD01").await.unwrap(),
            vec!["A1".to_string(), "A2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_partial_mapping_rolls_back_and_waits() {
        let fx = Fixture::new().await;
        let a = completed(&fx, "u1/a.c4gh", "A1").await;
        let stage = Mapper::new(fx.catalogue.clone());

        let message = json!({"type": "mapping", "dataset_id": "EGAD01", "accession_ids": ["A1", "A2-missing"]});
        let err = stage
            .handle(&fx.ctx, &fx.delivery("mappings", body(message)))
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::MissingPrecondition);
        assert!(fx.catalogue.dataset_accessions("EGAD01").await.is_err());
        assert_eq!(fx.catalogue.file(a).await.unwrap().state, FileState::Completed);
    }

    #[tokio::test]
    async fn test_release_and_deprecate() {
        let fx = Fixture::new().await;
        completed(&fx, "u1/a.c4gh", "A1").await;
        let stage = Mapper::new(fx.catalogue.clone());

        for message in [
            json!({"type": "mapping", "dataset_id": "EGAD01", "accession_ids": ["A1"]}),
            json!({"type": "release", "dataset_id": "EGAD01"}),
            json!({"type": "deprecate", "dataset_id": "EGAD01"}),
        ] {
            stage.handle(&fx.ctx, &fx.delivery("mappings", body(message))).await.unwrap();
        }
        assert_eq!(
            fx.catalogue.dataset_events("EGAD01").await,
            vec![DatasetEvent::Registered, DatasetEvent::Released, DatasetEvent::Deprecated]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_is_bad_message() {
        let fx = Fixture::new().await;
        let err = Mapper::new(fx.catalogue.clone())
            .handle(&fx.ctx, &fx.delivery("mappings", body(json!({"type": "merge", "dataset_id": "D"}))))
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::BadMessage);
    }
}
