//! Connection and channel liveness
//!
//! The broker library reports failures through callbacks. Each callback
//! flips a `watch` channel to [`Liveness::Lost`]; a [`Watcher`] waits for
//! that flip and hands the reason to the supervisor. Watchers never
//! reconnect on their own.

use super::BrokerError;
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Lost(String),
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        matches!(self, Liveness::Alive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Connection,
    Channel,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Connection => f.write_str("connection"),
            Scope::Channel => f.write_str("channel"),
        }
    }
}

/// Write side, held by the broker implementation
#[derive(Debug, Clone)]
pub struct LivenessSender {
    scope: Scope,
    tx: watch::Sender<Liveness>,
}

impl LivenessSender {
    pub fn new(scope: Scope) -> Self {
        let (tx, _) = watch::channel(Liveness::Alive);
        Self { scope, tx }
    }

    pub fn mark_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(scope = %self.scope, %reason, "broker liveness lost");
        self.tx.send_replace(Liveness::Lost(reason));
    }

    pub fn mark_alive(&self) {
        self.tx.send_replace(Liveness::Alive);
    }

    pub fn current(&self) -> Liveness {
        self.tx.borrow().clone()
    }

    pub fn watcher(&self) -> Watcher {
        Watcher {
            scope: self.scope,
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side, awaited by the supervisor
#[derive(Debug, Clone)]
pub struct Watcher {
    scope: Scope,
    rx: watch::Receiver<Liveness>,
}

impl Watcher {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_alive(&self) -> bool {
        self.rx.borrow().is_alive()
    }

    /// Resolve once the watched scope is lost
    pub async fn lost(mut self) -> BrokerError {
        loop {
            if let Liveness::Lost(reason) = &*self.rx.borrow_and_update() {
                return BrokerError::Lost {
                    scope: self.scope,
                    reason: reason.clone(),
                };
            }
            if self.rx.changed().await.is_err() {
                return BrokerError::Lost {
                    scope: self.scope,
                    reason: "liveness sender dropped".to_string(),
                };
            }
        }
    }
}

/// The pair of watchers every broker exposes
#[derive(Debug, Clone)]
pub struct Watchers {
    pub connection: Watcher,
    pub channel: Watcher,
}

impl Watchers {
    pub fn is_alive(&self) -> bool {
        self.connection.is_alive() && self.channel.is_alive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watcher_fires_on_loss() {
        let sender = LivenessSender::new(Scope::Channel);
        let watcher = sender.watcher();
        assert!(watcher.is_alive());

        let task = tokio::spawn(watcher.lost());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        sender.mark_lost("channel closed by server");
        let err = task.await.unwrap();
        assert!(matches!(err, BrokerError::Lost { scope: Scope::Channel, .. }));
    }

    #[tokio::test]
    async fn test_watcher_created_after_loss() {
        let sender = LivenessSender::new(Scope::Connection);
        sender.mark_lost("io error");
        let err = sender.watcher().lost().await;
        assert!(err.to_string().contains("io error"));
    }
}
