//! Standalone router: drives a submission through the pipeline without a
//! federated front end
//!
//! | routing key | input | output |
//! |---|---|---|
//! | `inbox` | inbox-upload | ingestion-trigger on `ingest` |
//! | `verified` | ingestion-accession-request | ingestion-accession on `accession` |
//! | `backup`, `completed` | ingestion-completion | dataset-mapping on `mappings` |
//!
//! Inbox renames and removals are validated and acknowledged without output.
//! Output keys are renamed through `broker.routes`.

use super::{required_sha256, ROUTE_ACCESSION, ROUTE_BACKUP, ROUTE_COMPLETED, ROUTE_INGEST, ROUTE_MAPPINGS, ROUTE_VERIFIED};
use crate::broker::Delivery;
use crate::config::Routes;
use crate::error::{StageError, StageResult};
use crate::service::{Stage, StageContext};
use async_trait::async_trait;
use sda_common::Checksum;
use sda_common::messages::{
    DatasetMessage, InboxMessage, IngestionAccession, IngestionAccessionRequest, IngestionCompletion,
    IngestionTrigger, SchemaName,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

const ROUTE_INBOX: &str = "inbox";

/// What an incoming delivery is, judged by its routing key (or queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Input {
    Inbox,
    AccessionRequest,
    Completion,
}

impl Input {
    fn of(delivery: &Delivery) -> StageResult<Self> {
        for key in [delivery.routing_key.as_str(), delivery.queue.as_str()] {
            match key {
                ROUTE_INBOX | "files" => return Ok(Input::Inbox),
                ROUTE_VERIFIED => return Ok(Input::AccessionRequest),
                ROUTE_BACKUP | ROUTE_COMPLETED => return Ok(Input::Completion),
                _ => {},
            }
        }
        Err(StageError::BadMessage(format!(
            "no route for routing key {} on queue {}",
            delivery.routing_key, delivery.queue
        )))
    }
}

/// `urn:<user>:<uuid4>` for one decrypted submission
///
/// The uuid bits are drawn from a name-based hash of user, path and content
/// digest rather than the RNG, so a redelivered accession request yields the
/// accession already handed to finalize.
pub fn accession_for(user: &str, filepath: &str, checksum: &Checksum) -> String {
    let name = format!("{user}\n{filepath}\n{}:{}", checksum.algorithm, checksum.value);
    let seed = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
    let id = uuid::Builder::from_random_bytes(*seed.as_bytes()).into_uuid();
    format!("urn:{user}:{id}")
}

/// Dataset identifier derived from its accessions, independent of order
pub fn dataset_id_for(accessions: &[String]) -> String {
    let mut sorted: Vec<&str> = accessions.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, sorted.join(",").as_bytes());
    format!("urn:dataset:{id}")
}

#[derive(Debug, Default)]
pub struct Orchestrate {
    routes: Routes,
}

impl Orchestrate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(routes: Routes) -> Self {
        Self { routes }
    }

    async fn inbox(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let value = serde_json::from_slice::<serde_json::Value>(&delivery.body)
            .map_err(|e| StageError::BadMessage(format!("not JSON: {e}")))?;
        let message: InboxMessage =
            serde_json::from_value(value.clone()).map_err(|e| StageError::BadMessage(e.to_string()))?;
        ctx.schemas().validate_value(message.schema(), &value)?;

        match message {
            InboxMessage::Upload {
                user,
                filepath,
                encrypted_checksums,
                ..
            } => {
                let trigger = IngestionTrigger::new(user, filepath, encrypted_checksums);
                let routing_key = self.routes.resolve(ROUTE_INGEST);
                ctx.publish(&delivery.correlation_id, routing_key, SchemaName::IngestionTrigger, &trigger)
                    .await?;
                info!(user = %trigger.user, filepath = %trigger.filepath, "Ingestion triggered");
            },
            other => debug!(operation = %other.schema(), "Inbox operation needs no action"),
        }
        Ok(())
    }

    async fn accession(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let request: IngestionAccessionRequest = ctx.decode(SchemaName::IngestionAccessionRequest, delivery)?;
        let checksum = required_sha256(&request.decrypted_checksums)?;

        let accession_id = accession_for(&request.user, &request.filepath, checksum);
        let message = IngestionAccession::new(
            request.user,
            request.filepath,
            accession_id,
            request.decrypted_checksums,
        );
        let routing_key = self.routes.resolve(ROUTE_ACCESSION);
        ctx.publish(&delivery.correlation_id, routing_key, SchemaName::IngestionAccession, &message)
            .await?;
        info!(accession_id = %message.accession_id, filepath = %message.filepath, "Accession generated");
        Ok(())
    }

    async fn mapping(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let completion: IngestionCompletion = ctx.decode(SchemaName::IngestionCompletion, delivery)?;
        let accession_ids = vec![completion.accession_id];
        let message = DatasetMessage::Mapping {
            dataset_id: dataset_id_for(&accession_ids),
            accession_ids,
        };
        let routing_key = self.routes.resolve(ROUTE_MAPPINGS);
        ctx.publish(&delivery.correlation_id, routing_key, SchemaName::DatasetMapping, &message)
            .await?;
        info!(dataset_id = %message.dataset_id(), "Dataset mapping requested");
        Ok(())
    }
}

#[async_trait]
impl Stage for Orchestrate {
    fn name(&self) -> &'static str {
        "orchestrate"
    }

    #[instrument(name = "orchestrate", skip_all, fields(routing_key = %delivery.routing_key))]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        match Input::of(delivery)? {
            Input::Inbox => self.inbox(ctx, delivery).await,
            Input::AccessionRequest => self.accession(ctx, delivery).await,
            Input::Completion => self.mapping(ctx, delivery).await,
        }
    }
}
