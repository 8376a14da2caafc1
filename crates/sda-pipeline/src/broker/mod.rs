//! Message broker capability
//!
//! Every stage consumes one queue and publishes onto one exchange. The
//! [`MessageBroker`] trait captures exactly that: a delivery stream with
//! manual acknowledgement, publish with publisher confirms, and liveness
//! watchers. [`AmqpBroker`] talks AMQP 0-9-1; [`MemoryBroker`] is the
//! in-process fake the pipeline tests run against.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

pub mod amqp;
pub mod memory;
pub mod watcher;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use watcher::{Liveness, Scope, Watcher, Watchers};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Queue '{0}' does not exist")]
    QueueMissing(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Publish rejected by broker: {0}")]
    Nacked(String),

    #[error("Publisher confirm not received within {0:?}")]
    ConfirmTimeout(Duration),

    #[error("Broker {scope} lost: {reason}")]
    Lost { scope: Scope, reason: String },

    #[error("Broker client is closed")]
    Closed,
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Channel(err.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// One inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub correlation_id: String,
    pub routing_key: String,
    /// Queue the delivery was consumed from
    pub queue: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// One outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub correlation_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
    pub body: Vec<u8>,
}

impl Outgoing {
    pub fn new(
        correlation_id: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            durable: true,
            body,
        }
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }
}

pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Start consuming `queue` with manual acknowledgement
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream>;

    /// Publish and wait for the broker's confirm
    async fn publish(&self, message: Outgoing) -> BrokerResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    fn watchers(&self) -> Watchers;

    /// Both connection and channel are up
    fn is_healthy(&self) -> bool {
        self.watchers().is_alive()
    }

    async fn close(&self);
}
