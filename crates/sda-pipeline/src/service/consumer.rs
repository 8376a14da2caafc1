//! The consume loop: bounded concurrent handlers and verdict mapping
//!
//! A handler never propagates an error into the loop. Its result is mapped
//! to a [`Verdict`] and the delivery is settled right there:
//!
//! | Disposition | Verdict |
//! |---|---|
//! | none (success) | ack |
//! | transient | nack, requeue |
//! | missing precondition | wait `requeuedelay`, nack, requeue |
//! | bad message / permanent data | publish `info-error`, nack, drop |

use super::{Stage, StageContext};
use crate::broker::{BrokerResult, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use crate::error::{Disposition, ServiceError, StageError};
use futures::StreamExt;
use sda_common::messages::{InfoError, SchemaName};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ack,
    Requeue,
    Drop,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub requeue_delay: Duration,
    pub max_transient: u32,
    pub drain_window: Duration,
    pub error_routing_key: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            workers: config.workers,
            requeue_delay: config.requeue_delay(),
            max_transient: config.maxtransient,
            drain_window: config.drain_window(),
            error_routing_key: config.routingerror.clone(),
        }
    }
}

/// Drives one stage over one queue on one broker connection
pub struct Consumer<S> {
    stage: Arc<S>,
    ctx: StageContext,
    settings: Arc<ConsumerSettings>,
    transient: Arc<AtomicU32>,
    give_up: CancellationToken,
}

impl<S> Clone for Consumer<S> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            ctx: self.ctx.clone(),
            settings: self.settings.clone(),
            transient: self.transient.clone(),
            give_up: self.give_up.clone(),
        }
    }
}

async fn next_delivery(
    stream: &mut DeliveryStream,
    permits: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, Option<BrokerResult<Delivery>>)> {
    let permit = permits.clone().acquire_owned().await.ok()?;
    Some((permit, stream.next().await))
}

impl<S: Stage> Consumer<S> {
    pub fn new(stage: Arc<S>, ctx: StageContext, settings: ConsumerSettings) -> Self {
        Self {
            stage,
            ctx,
            settings: Arc::new(settings),
            transient: Arc::new(AtomicU32::new(0)),
            give_up: CancellationToken::new(),
        }
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    /// Consecutive transient failures seen so far
    pub fn transient_failures(&self) -> u32 {
        self.transient.load(Ordering::SeqCst)
    }

    /// Handle and settle one delivery
    #[instrument(
        name = "delivery",
        skip_all,
        fields(
            stage = self.stage.name(),
            correlation_id = %delivery.correlation_id,
            delivery_tag = delivery.delivery_tag,
            routing_key = %delivery.routing_key,
        )
    )]
    pub async fn handle_delivery(&self, delivery: Delivery) -> Verdict {
        let verdict = match self.stage.handle(&self.ctx, &delivery).await {
            Ok(()) => {
                self.transient.store(0, Ordering::SeqCst);
                Verdict::Ack
            },
            Err(err) => self.on_failure(&delivery, err).await,
        };

        let settled = match verdict {
            Verdict::Ack => self.ctx.broker().ack(delivery.delivery_tag).await,
            Verdict::Requeue => self.ctx.broker().nack(delivery.delivery_tag, true).await,
            Verdict::Drop => self.ctx.broker().nack(delivery.delivery_tag, false).await,
        };
        match settled {
            Ok(()) => debug!(?verdict, "delivery settled"),
            // The broker redelivers anything left unsettled on this channel
            Err(e) => warn!(?verdict, error = %e, "failed to settle delivery"),
        }
        verdict
    }

    async fn on_failure(&self, delivery: &Delivery, err: StageError) -> Verdict {
        let disposition = err.disposition();
        match disposition {
            Disposition::Transient => {
                let seen = self.transient.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %err, consecutive = seen, "transient failure, requeueing");
                if seen > self.settings.max_transient {
                    self.give_up.cancel();
                }
                Verdict::Requeue
            },
            Disposition::MissingPrecondition => {
                info!(
                    error = %err,
                    delay_ms = self.settings.requeue_delay.as_millis() as u64,
                    "precondition not met, requeueing after delay"
                );
                tokio::time::sleep(self.settings.requeue_delay).await;
                Verdict::Requeue
            },
            Disposition::BadMessage | Disposition::PermanentData => {
                error!(error = %err, %disposition, "rejecting message");
                match self.report(delivery, disposition, &err).await {
                    Ok(()) => Verdict::Drop,
                    Err(e) => {
                        warn!(error = %e, "could not publish info-error, requeueing instead");
                        Verdict::Requeue
                    },
                }
            },
        }
    }

    async fn report(&self, delivery: &Delivery, disposition: Disposition, err: &StageError) -> Result<(), StageError> {
        let info = InfoError::new(disposition.as_str(), err.to_string(), &delivery.body);
        self.ctx
            .publish(
                &delivery.correlation_id,
                &self.settings.error_routing_key,
                SchemaName::InfoError,
                &info,
            )
            .await
    }

    /// Consume `queue` until `shutdown` fires, the stream ends, or transient
    /// failures exceed the budget. In-flight handlers get the drain window
    /// to settle; whatever is left is abandoned unacked.
    pub async fn run(&self, queue: &str, shutdown: CancellationToken) -> Result<(), ServiceError> {
        let mut stream = self.ctx.broker().consume(queue).await?;
        let permits = Arc::new(Semaphore::new(self.settings.workers));
        let mut tasks = JoinSet::new();
        info!(stage = self.stage.name(), %queue, workers = self.settings.workers, "Consumer started");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting deliveries");
                    break Ok(());
                },
                _ = self.give_up.cancelled() => {
                    break Err(ServiceError::TooManyTransient(self.transient_failures()));
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "handler task failed");
                    }
                },
                next = next_delivery(&mut stream, &permits) => match next {
                    Some((permit, Some(Ok(delivery)))) => {
                        let consumer = self.clone();
                        let span = tracing::Span::current();
                        tasks.spawn(
                            async move {
                                consumer.handle_delivery(delivery).await;
                                drop(permit);
                            }
                            .instrument(span),
                        );
                    },
                    Some((_, Some(Err(e)))) => break Err(e.into()),
                    Some((_, None)) | None => {
                        info!(%queue, "Delivery stream ended");
                        break Ok(());
                    },
                },
            }
        };

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, window_secs = self.settings.drain_window.as_secs(), "Draining handlers");
        }
        let drained = tokio::time::timeout(self.settings.drain_window, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "handler task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(left = tasks.len(), "Drain window elapsed, leaving deliveries unacked");
            tasks.abort_all();
        }

        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::memory::Settlement;
    use crate::broker::MemoryBroker;
    use crate::catalogue::CatalogueError;
    use crate::error::StageResult;
    use crate::schema::SchemaRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Fails according to the body: `ok`, `transient`, `missing`, `bad`
    struct Scripted {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Stage for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _ctx: &StageContext, delivery: &Delivery) -> StageResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match delivery.body.as_slice() {
                b"ok" => Ok(()),
                b"transient" => Err(CatalogueError::Transport("db down".into()).into()),
                b"missing" => Err(CatalogueError::not_found("file", "x").into()),
                _ => Err(StageError::BadMessage("unparseable".into())),
            }
        }
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            workers: 2,
            requeue_delay: Duration::from_millis(5),
            max_transient: 2,
            drain_window: Duration::from_secs(1),
            error_routing_key: "error".into(),
        }
    }

    fn consumer(broker: Arc<MemoryBroker>) -> Consumer<Scripted> {
        let ctx = StageContext::new(broker, Arc::new(SchemaRegistry::bundled().unwrap()), "sda");
        Consumer::new(
            Arc::new(Scripted {
                calls: AtomicUsize::new(0),
            }),
            ctx,
            settings(),
        )
    }

    fn delivery(tag: u64, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: tag,
            correlation_id: "c1".into(),
            routing_key: "files".into(),
            queue: "q".into(),
            redelivered: false,
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_verdicts() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(broker.clone());

        assert_eq!(consumer.handle_delivery(delivery(1, b"ok")).await, Verdict::Ack);
        assert_eq!(consumer.handle_delivery(delivery(2, b"transient")).await, Verdict::Requeue);
        assert_eq!(consumer.handle_delivery(delivery(3, b"missing")).await, Verdict::Requeue);
        assert_eq!(consumer.handle_delivery(delivery(4, b"bad")).await, Verdict::Drop);

        assert_eq!(broker.settlement(1).await, Some(Settlement::Ack));
        assert_eq!(broker.settlement(2).await, Some(Settlement::Nack { requeue: true }));
        assert_eq!(broker.settlement(4).await, Some(Settlement::Nack { requeue: false }));

        let errors = broker.published_to("error").await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].correlation_id, "c1");
        let info: InfoError = serde_json::from_slice(&errors[0].body).unwrap();
        assert_eq!(info.error, "bad-message");
        assert_eq!(info.original_bytes().unwrap(), b"bad".to_vec());
    }

    #[tokio::test]
    async fn test_info_error_publish_failure_requeues() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(broker.clone());
        broker.reject_publishes(true);

        assert_eq!(consumer.handle_delivery(delivery(1, b"bad")).await, Verdict::Requeue);
        assert_eq!(broker.settlement(1).await, Some(Settlement::Nack { requeue: true }));
    }

    #[tokio::test]
    async fn test_success_resets_transient_count() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = consumer(broker);

        consumer.handle_delivery(delivery(1, b"transient")).await;
        consumer.handle_delivery(delivery(2, b"transient")).await;
        assert_eq!(consumer.transient_failures(), 2);
        consumer.handle_delivery(delivery(3, b"ok")).await;
        assert_eq!(consumer.transient_failures(), 0);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_transient_budget() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("q").await;
        for tag in 0..5 {
            broker.deliver("q", &format!("c{tag}"), "files", b"transient".to_vec()).await;
        }
        let consumer = consumer(broker.clone());

        let result = consumer.run("q", CancellationToken::new()).await;
        assert!(matches!(result, Err(ServiceError::TooManyTransient(n)) if n > 2));
    }

    #[tokio::test]
    async fn test_run_drains_until_stream_ends() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("q").await;
        let mut tags = Vec::new();
        for _ in 0..4 {
            tags.push(broker.deliver("q", "c1", "files", b"ok".to_vec()).await);
        }
        broker.finish("q").await;

        consumer(broker.clone())
            .run("q", CancellationToken::new())
            .await
            .unwrap();
        for tag in tags {
            assert_eq!(broker.settlement(tag).await, Some(Settlement::Ack));
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("q").await;
        let shutdown = CancellationToken::new();
        let consumer = consumer(broker);

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run("q", shutdown).await })
        };
        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
