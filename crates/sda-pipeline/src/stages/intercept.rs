//! Route federated messages onto the internal routing keys by their `type`

use super::{ROUTE_ACCESSION, ROUTE_INGEST, ROUTE_MAPPINGS};
use crate::broker::Delivery;
use crate::config::Routes;
use crate::error::{StageError, StageResult};
use crate::service::{Stage, StageContext};
use async_trait::async_trait;
use sda_common::messages::SchemaName;
use tracing::{info, instrument};

#[derive(Debug, Default)]
pub struct Intercept {
    routes: Routes,
}

impl Intercept {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(routes: Routes) -> Self {
        Self { routes }
    }

    /// Schema and routing key for a federated `type`; `None` means the
    /// message is deliberately not routed
    pub fn route(&self, kind: &str) -> StageResult<Option<(SchemaName, &str)>> {
        if kind == "cancel" {
            return Ok(None);
        }
        let schema = SchemaName::for_message_type(kind)
            .ok_or_else(|| StageError::BadMessage(format!("unknown message type {kind}")))?;
        let routing_key = match schema {
            SchemaName::IngestionTrigger => ROUTE_INGEST,
            SchemaName::IngestionAccession => ROUTE_ACCESSION,
            _ => ROUTE_MAPPINGS,
        };
        Ok(Some((schema, self.routes.resolve(routing_key))))
    }
}

#[async_trait]
impl Stage for Intercept {
    fn name(&self) -> &'static str {
        "intercept"
    }

    #[instrument(name = "intercept", skip_all)]
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
        let value: serde_json::Value = serde_json::from_slice(&delivery.body)
            .map_err(|e| StageError::BadMessage(format!("not JSON: {e}")))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| StageError::BadMessage("message has no type".into()))?;

        let Some((schema, routing_key)) = self.route(kind)? else {
            info!(kind, "Message not routed");
            return Ok(());
        };
        ctx.schemas().validate_value(schema, &value)?;
        ctx.publish_raw(&delivery.correlation_id, routing_key, delivery.body.clone())
            .await?;
        info!(kind, %routing_key, "Message routed");
        Ok(())
    }
}
