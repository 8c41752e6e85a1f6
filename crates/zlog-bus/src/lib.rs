//! Thin publish/subscribe contract over a topic exchange.
//!
//! Backed by `async-nats`: subjects are dot-delimited exactly like this
//! bus's routing keys (`POS.<line>.<rider>`), and NATS's `*`/`>` wildcards
//! play the role of an AMQP topic exchange's wildcard bindings. A
//! `publish` attempts up to [`NatsBus::max_attempts`] times, re-establishing
//! the connection before each retry; on exhaustion the message is dropped
//! (at-most-once) and the failure is only logged, never escalated --
//! publish failures are local and must never interrupt persistence.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connecting to bus: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("publishing: {0}")]
    Publish(#[from] async_nats::PublishError),
    #[error("subscribing: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),
}

/// A single delivered message: the routing key it arrived on and the
/// payload bytes.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// A publish/subscribe client over a topic exchange, with bounded retry and
/// transparent reconnection on the publish path.
pub struct NatsBus {
    server_url: String,
    max_attempts: usize,
    client: Mutex<Option<async_nats::Client>>,
}

impl NatsBus {
    pub fn new(server_url: impl Into<String>) -> Self {
        NatsBus {
            server_url: server_url.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            client: Mutex::new(None),
        }
    }

    /// Overrides the publish-attempt count; exposed for fault-injection tests.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    async fn connected_client(&self) -> Result<async_nats::Client, BusError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = async_nats::connect(&self.server_url).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn drop_client(&self) {
        *self.client.lock().await = None;
    }

    /// Publishes `payload` on `routing_key`. Up to `max_attempts` tries; a
    /// connection failure reconnects before the next attempt, any other
    /// failure drops and re-establishes the client as well. Exhaustion logs
    /// a warning and returns the last error -- callers must treat this as
    /// non-fatal: publish failure is local and never blocks persistence.
    pub async fn publish(
        &self,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        let routing_key = routing_key.into();
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            match self.connected_client().await {
                Ok(client) => {
                    match client
                        .publish(routing_key.clone(), payload.clone().into())
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            warn!(attempt, routing_key = %routing_key, error = %e, "bus publish failed, reconnecting");
                            self.drop_client().await;
                            last_err = Some(BusError::Publish(e));
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt, error = %e, "bus connect failed");
                    last_err = Some(e);
                }
            }
        }
        warn!(
            routing_key = %routing_key,
            attempts = self.max_attempts,
            "dropping message after exhausting publish attempts"
        );
        Err(last_err.expect("loop runs at least once"))
    }

    /// Subscribes to `pattern` (a NATS subject, possibly containing `*`/`>`
    /// wildcards) and returns a stream of deliveries. Plays the role of
    /// declaring an exclusive auto-named queue bound with a routing-key
    /// pattern: each call gets its own ephemeral subscription, and there is
    /// no explicit ack.
    pub async fn subscribe(&self, pattern: impl Into<String>) -> Result<Subscription, BusError> {
        let client = self.connected_client().await?;
        let inner = client.subscribe(pattern.into()).await?;
        Ok(Subscription { inner })
    }
}

pub struct Subscription {
    inner: async_nats::Subscriber,
}

impl Subscription {
    /// Drives a single-threaded callback per delivery, in arrival order,
    /// until the subscription ends.
    pub async fn for_each<F>(mut self, mut handler: F)
    where
        F: FnMut(Delivery),
    {
        use futures::StreamExt;
        while let Some(msg) = self.inner.next().await {
            handler(Delivery {
                routing_key: msg.subject.to_string(),
                payload: msg.payload.to_vec(),
            });
        }
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        use futures::StreamExt;
        self.inner.next().await.map(|msg| Delivery {
            routing_key: msg.subject.to_string(),
            payload: msg.payload.to_vec(),
        })
    }
}

/// Shared-handle convenience so the bus can be cloned into multiple tasks
/// (e.g. the ingestor loop and a chat-replay consumer) without each owning
/// a full reconnect state machine.
pub type SharedBus = Arc<NatsBus>;

pub fn shared(server_url: impl Into<String>) -> SharedBus {
    Arc::new(NatsBus::new(server_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_attempts_matches_spec() {
        let bus = NatsBus::new("nats://localhost:4222");
        assert_eq!(bus.max_attempts, 3);
    }

    #[test]
    fn with_max_attempts_overrides_for_fault_injection() {
        let bus = NatsBus::new("nats://localhost:4222").with_max_attempts(1);
        assert_eq!(bus.max_attempts, 1);
    }
}
