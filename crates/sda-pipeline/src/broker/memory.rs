//! In-process broker used by the pipeline tests
//!
//! Queues are unbounded channels; routing keys are bound to queues with
//! [`MemoryBroker::bind`] so published messages flow into the next stage's
//! queue. Every publish and every ack/nack is recorded for inspection.

use super::watcher::{LivenessSender, Scope, Watchers};
use super::{BrokerError, BrokerResult, Delivery, DeliveryStream, MessageBroker, Outgoing};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

struct MemoryQueue {
    tx: Option<mpsc::UnboundedSender<Delivery>>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, MemoryQueue>,
    bindings: HashMap<String, String>,
    published: Vec<Outgoing>,
    settlements: Vec<(u64, Settlement)>,
}

pub struct MemoryBroker {
    state: Mutex<State>,
    next_tag: AtomicU64,
    reject_publish: AtomicBool,
    connection: LivenessSender,
    channel: LivenessSender,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_tag: AtomicU64::new(1),
            reject_publish: AtomicBool::new(false),
            connection: LivenessSender::new(Scope::Connection),
            channel: LivenessSender::new(Scope::Channel),
        }
    }

    pub async fn declare_queue(&self, queue: &str) {
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_insert_with(MemoryQueue::new);
    }

    /// Route messages published with `routing_key` into `queue`
    pub async fn bind(&self, routing_key: &str, queue: &str) {
        self.declare_queue(queue).await;
        self.state
            .lock()
            .await
            .bindings
            .insert(routing_key.to_string(), queue.to_string());
    }

    /// Put a message on `queue` as if a producer had published it
    pub async fn deliver(
        &self,
        queue: &str,
        correlation_id: &str,
        routing_key: &str,
        body: impl Into<Vec<u8>>,
    ) -> u64 {
        let mut state = self.state.lock().await;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let queue_state = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(MemoryQueue::new);
        if let Some(tx) = &queue_state.tx {
            let _ = tx.send(Delivery {
                delivery_tag: tag,
                correlation_id: correlation_id.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
                redelivered: false,
                body: body.into(),
            });
        }
        tag
    }

    /// Close `queue` so its consumer stream ends once drained
    pub async fn finish(&self, queue: &str) {
        if let Some(queue) = self.state.lock().await.queues.get_mut(queue) {
            queue.tx = None;
        }
    }

    pub async fn published(&self) -> Vec<Outgoing> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_to(&self, routing_key: &str) -> Vec<Outgoing> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub async fn settlement(&self, delivery_tag: u64) -> Option<Settlement> {
        self.state
            .lock()
            .await
            .settlements
            .iter()
            .rev()
            .find(|(tag, _)| *tag == delivery_tag)
            .map(|(_, settlement)| *settlement)
    }

    pub async fn settlements(&self) -> Vec<(u64, Settlement)> {
        self.state.lock().await.settlements.clone()
    }

    /// Make every following publish fail as if the broker never confirmed
    pub fn reject_publishes(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    pub fn drop_connection(&self, reason: &str) {
        self.connection.mark_lost(reason);
        self.channel.mark_lost(reason);
    }

    pub fn restore_connection(&self) {
        self.connection.mark_alive();
        self.channel.mark_alive();
    }

    fn check_alive(&self) -> BrokerResult<()> {
        for sender in [&self.connection, &self.channel] {
            if let super::Liveness::Lost(reason) = sender.current() {
                return Err(BrokerError::Channel(reason));
            }
        }
        Ok(())
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) -> BrokerResult<()> {
        self.check_alive()?;
        self.state
            .lock()
            .await
            .settlements
            .push((delivery_tag, settlement));
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn consume(&self, queue: &str) -> BrokerResult<DeliveryStream> {
        let rx = self
            .state
            .lock()
            .await
            .queues
            .get_mut(queue)
            .and_then(|q| q.rx.take())
            .ok_or_else(|| BrokerError::QueueMissing(queue.to_string()))?;

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn publish(&self, message: Outgoing) -> BrokerResult<()> {
        self.check_alive()?;
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Nacked("publish rejected".to_string()));
        }

        let mut state = self.state.lock().await;
        if let Some(queue) = state.bindings.get(&message.routing_key).cloned() {
            let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = state.queues.get(&queue).and_then(|q| q.tx.as_ref()) {
                let _ = tx.send(Delivery {
                    delivery_tag: tag,
                    correlation_id: message.correlation_id.clone(),
                    routing_key: message.routing_key.clone(),
                    queue,
                    redelivered: false,
                    body: message.body.clone(),
                });
            }
        }
        state.published.push(message);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.settle(delivery_tag, Settlement::Ack).await
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.settle(delivery_tag, Settlement::Nack { requeue }).await
    }

    fn watchers(&self) -> Watchers {
        Watchers {
            connection: self.connection.watcher(),
            channel: self.channel.watcher(),
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        for queue in state.queues.values_mut() {
            queue.tx = None;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let broker = MemoryBroker::new();
        broker.bind("archived", "verify").await;
        let mut stream = broker.consume("verify").await.unwrap();

        broker
            .publish(Outgoing::new("c1", "sda", "archived", b"{}".to_vec()))
            .await
            .unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id, "c1");
        assert_eq!(delivery.queue, "verify");
        assert_eq!(broker.published_to("archived").await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_queue_fails_consume() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.consume("nope").await,
            Err(BrokerError::QueueMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_connection_fails_publish_and_ack() {
        let broker = MemoryBroker::new();
        broker.drop_connection("killed");
        assert!(!broker.is_healthy());
        assert!(broker
            .publish(Outgoing::new("c1", "sda", "x", Vec::new()))
            .await
            .is_err());
        assert!(broker.ack(1).await.is_err());

        broker.restore_connection();
        assert!(broker.is_healthy());
        broker.ack(1).await.unwrap();
        assert_eq!(broker.settlement(1).await, Some(Settlement::Ack));
    }

    #[tokio::test]
    async fn test_finish_ends_stream() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await;
        let mut stream = broker.consume("q").await.unwrap();
        broker.deliver("q", "c1", "files", b"{}".to_vec()).await;
        broker.finish("q").await;

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
    }
}
