//! Message-driven worker substrate shared by every stage
//!
//! A stage implements [`Stage::handle`] for one delivery and returns a
//! [`StageResult`]. Everything else is common: the [`Consumer`] turns the
//! result into ack / nack-requeue / nack-drop, the [`Supervisor`] owns the
//! broker connection and reconnects when a watcher fires, and [`bootstrap`]
//! wires configuration, logging and signals for the service binaries.

use crate::broker::{Delivery, MessageBroker, Outgoing};
use crate::error::StageResult;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use sda_common::messages::SchemaName;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::debug;

pub mod bootstrap;
pub mod consumer;
pub mod signals;
pub mod supervisor;

pub use consumer::{Consumer, ConsumerSettings, Verdict};
pub use supervisor::{AmqpConnector, BrokerHandle, Connector, Supervisor};

/// One pipeline stage
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Process one delivery. Returning `Ok` means every side effect is
    /// durable and the delivery may be acked.
    async fn handle(&self, ctx: &StageContext, delivery: &Delivery) -> StageResult<()>;

    /// Release catalogue and storage handles on shutdown
    async fn close(&self) {}
}

/// What a handler needs from the broker side, rebuilt on every reconnect
#[derive(Clone)]
pub struct StageContext {
    broker: Arc<dyn MessageBroker>,
    schemas: Arc<SchemaRegistry>,
    exchange: String,
}

impl StageContext {
    pub fn new(broker: Arc<dyn MessageBroker>, schemas: Arc<SchemaRegistry>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            schemas,
            exchange: exchange.into(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Validate the delivery body against `schema` and deserialize it
    pub fn decode<T: DeserializeOwned>(&self, schema: SchemaName, delivery: &Delivery) -> StageResult<T> {
        Ok(self.schemas.decode(schema, &delivery.body)?)
    }

    /// Validate `message` against `schema` and publish it with a confirm
    pub async fn publish<T: Serialize + Sync>(
        &self,
        correlation_id: &str,
        routing_key: &str,
        schema: SchemaName,
        message: &T,
    ) -> StageResult<()> {
        let body = self.schemas.encode(schema, message)?;
        self.publish_raw(correlation_id, routing_key, body).await
    }

    /// Publish an already validated body
    pub async fn publish_raw(&self, correlation_id: &str, routing_key: &str, body: Vec<u8>) -> StageResult<()> {
        self.broker
            .publish(Outgoing::new(correlation_id, &self.exchange, routing_key, body))
            .await?;
        debug!(%correlation_id, %routing_key, "published");
        Ok(())
    }
}
