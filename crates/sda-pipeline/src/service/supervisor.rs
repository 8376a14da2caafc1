//! Broker connection ownership and reconnection
//!
//! The supervisor is the only place that creates broker connections. When
//! a connection or channel watcher fires it cancels the consumer, lets the
//! in-flight handlers drain, closes the old client and connects again. It
//! gives up after `reconnectattempts` consecutive failed connects.

use super::consumer::{Consumer, ConsumerSettings};
use super::{Stage, StageContext};
use crate::broker::{AmqpBroker, BrokerError, BrokerResult, MessageBroker};
use crate::config::BrokerConfig;
use crate::error::ServiceError;
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Creates broker clients
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn MessageBroker>>;
}

pub struct AmqpConnector {
    config: BrokerConfig,
    name: String,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig, name: impl Into<String>) -> Self {
        Self {
            config,
            name: name.into(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn MessageBroker>> {
        let broker = AmqpBroker::connect(&self.config, &self.name).await?;
        Ok(Arc::new(broker))
    }
}

/// Connect with a bounded number of attempts.
///
/// A missing queue on the very first connection is a deployment error and
/// is reported as an initialisation failure without retrying.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    attempts: u32,
    delay: Duration,
    first: bool,
    shutdown: &CancellationToken,
) -> Result<Arc<dyn MessageBroker>, ServiceError> {
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connector.connect().await {
            Ok(broker) => {
                if attempt > 1 {
                    info!(attempt, "Reconnected to broker");
                }
                return Ok(broker);
            },
            Err(BrokerError::QueueMissing(queue)) if first => {
                return Err(ServiceError::Init(format!("queue {queue} does not exist")));
            },
            Err(e) if attempt >= attempts => {
                error!(attempt, error = %e, "Giving up on broker connection");
                return Err(ServiceError::ReconnectExhausted { attempts, source: e });
            },
            Err(e) => {
                warn!(attempt, of = attempts, error = %e, "Broker connection failed, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(ServiceError::Broker(BrokerError::Closed)),
                    _ = tokio::time::sleep(delay) => {},
                }
            },
        }
    }
}

/// Runs one stage for the lifetime of the process
pub struct Supervisor<S> {
    stage: Arc<S>,
    connector: Arc<dyn Connector>,
    schemas: Arc<SchemaRegistry>,
    queue: String,
    exchange: String,
    settings: ConsumerSettings,
    attempts: u32,
    delay: Duration,
}

impl<S: Stage> Supervisor<S> {
    pub fn new(
        stage: Arc<S>,
        connector: Arc<dyn Connector>,
        schemas: Arc<SchemaRegistry>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            stage,
            connector,
            schemas,
            queue: config.queue.clone(),
            exchange: config.exchange.clone(),
            settings: ConsumerSettings::from_config(config),
            attempts: config.reconnectattempts,
            delay: config.reconnect_delay(),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let mut first = true;
        let result = loop {
            let broker = match connect_with_retry(
                self.connector.as_ref(),
                self.attempts,
                self.delay,
                first,
                &shutdown,
            )
            .await
            {
                Ok(broker) => broker,
                Err(_) if shutdown.is_cancelled() => break Ok(()),
                Err(e) => break Err(e),
            };
            first = false;

            let ctx = StageContext::new(broker.clone(), self.schemas.clone(), self.exchange.clone());
            let consumer = Consumer::new(self.stage.clone(), ctx, self.settings.clone());
            let watchers = broker.watchers();
            let session = shutdown.child_token();

            let run = consumer.run(&self.queue, session.clone());
            tokio::pin!(run);

            let lost = tokio::select! {
                outcome = &mut run => {
                    broker.close().await;
                    match outcome {
                        Ok(()) if shutdown.is_cancelled() => break Ok(()),
                        Ok(()) => {
                            warn!(queue = %self.queue, "Delivery stream closed by broker, reconnecting");
                            continue;
                        },
                        Err(ServiceError::Broker(e)) => {
                            warn!(error = %e, "Consumer lost its broker, reconnecting");
                            continue;
                        },
                        Err(e) => break Err(e),
                    }
                },
                err = watchers.connection.lost() => err,
                err = watchers.channel.lost() => err,
            };

            warn!(error = %lost, "Broker liveness lost, draining and reconnecting");
            session.cancel();
            if let Err(e) = run.await {
                if !matches!(e, ServiceError::Broker(_)) {
                    broker.close().await;
                    break Err(e);
                }
            }
            broker.close().await;
        };

        self.stage.close().await;
        info!(stage = self.stage.name(), "Stage stopped");
        result
    }
}

/// The current broker client for services that publish outside a consume
/// loop. A background task replaces it whenever a watcher fires.
pub struct BrokerHandle {
    current: RwLock<Arc<dyn MessageBroker>>,
}

impl BrokerHandle {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(broker),
        })
    }

    pub async fn get(&self) -> Arc<dyn MessageBroker> {
        self.current.read().await.clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.current.read().await.is_healthy()
    }

    /// Reconnect whenever the current client reports a loss. Returns when
    /// shutdown fires or reconnection is exhausted.
    pub async fn maintain(
        self: Arc<Self>,
        connector: Arc<dyn Connector>,
        attempts: u32,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), ServiceError> {
        loop {
            let watchers = self.get().await.watchers();
            let lost = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.get().await.close().await;
                    return Ok(());
                },
                err = watchers.connection.lost() => err,
                err = watchers.channel.lost() => err,
            };
            warn!(error = %lost, "Broker liveness lost, reconnecting");

            let fresh = match connect_with_retry(connector.as_ref(), attempts, delay, false, &shutdown).await {
                Ok(broker) => broker,
                Err(_) if shutdown.is_cancelled() => return Ok(()),
                Err(e) => return Err(e),
            };
            let old = std::mem::replace(&mut *self.current.write().await, fresh);
            old.close().await;
        }
    }
}
