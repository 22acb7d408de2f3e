//! Message-bus contract and an in-memory broker.
//!
//! The engine only depends on the publish/subscribe contract below; the real
//! transport (connect/retry/TLS) lives outside. `MemoryBus` implements the
//! same contract in-process and is what the tests run against.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, trace};
use wildmatch::WildMatch;

use crate::types::Result;

/// One message delivered from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Publish/subscribe handle injected into the engine.
///
/// `subscribe` is the only suspending step that may fail; its error surfaces
/// to the caller and is never retried internally.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Subscribe to a topic pattern (MQTT-style `+`/`#` wildcards).
    async fn subscribe(&self, pattern: &str) -> Result<broadcast::Receiver<BusMessage>>;

    /// Drop a subscription. Safe to call for patterns never subscribed.
    async fn unsubscribe(&self, pattern: &str) -> Result<()>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
}

/// In-process pub-sub broker: one broadcast channel per subscribed pattern.
pub struct MemoryBus {
    /// Topic pattern -> broadcast channel
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
    total_published: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            total_published: AtomicU64::new(0),
        }
    }

    /// Check if a topic matches a pattern (MQTT-style wildcards).
    /// `+` matches one level, `#` matches multiple levels.
    fn topic_matches(topic: &str, pattern: &str) -> bool {
        if pattern.contains('#') || pattern.contains('+') {
            let glob_pattern = pattern.replace('+', "*").replace('#', "**");
            WildMatch::new(&glob_pattern).matches(topic)
        } else {
            topic == pattern
        }
    }

    /// Number of messages published so far.
    pub fn published(&self) -> u64 {
        self.total_published.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn subscribe(&self, pattern: &str) -> Result<broadcast::Receiver<BusMessage>> {
        let sender = self
            .channels
            .entry(pattern.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(100);
                tx
            })
            .clone();

        debug!("new subscription to topic pattern '{}'", pattern);
        Ok(sender.subscribe())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        if self.channels.remove(pattern).is_some() {
            debug!("dropped subscription to topic pattern '{}'", pattern);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut notified = 0;

        for entry in self.channels.iter() {
            let pattern = entry.key();
            if Self::topic_matches(topic, pattern) {
                // broadcast::send errors only when there are no receivers
                if let Ok(n) = entry.value().send(BusMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }) {
                    notified += n;
                }
            }
        }

        self.total_published.fetch_add(1, Ordering::Relaxed);
        trace!("published to topic '{}', notified {} subscribers", topic, notified);
        Ok(())
    }
}

/// Decorator that reference-counts subscriptions per pattern.
///
/// Unsubscribing a topic is global on MQTT-style transports, so a component
/// releasing a state topic that another live component still listens on must
/// not reach the inner bus. The count lock is held across the inner calls so
/// a concurrent release can not retire a pattern between subscribe and count.
pub struct SharedBus {
    inner: Arc<dyn MessageBus>,
    counts: Mutex<HashMap<String, usize>>,
}

impl SharedBus {
    pub fn new(inner: Arc<dyn MessageBus>) -> Self {
        Self {
            inner,
            counts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MessageBus for SharedBus {
    async fn subscribe(&self, pattern: &str) -> Result<broadcast::Receiver<BusMessage>> {
        let mut counts = self.counts.lock().await;
        let rx = self.inner.subscribe(pattern).await?;
        *counts.entry(pattern.to_string()).or_insert(0) += 1;
        Ok(rx)
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let mut counts = self.counts.lock().await;
        match counts.get_mut(pattern) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                counts.remove(pattern);
                self.inner.unsubscribe(pattern).await
            }
            // releasing a pattern never acquired here is a no-op
            None => Ok(()),
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.inner.publish(topic, payload).await
    }
}

/// Bus wrapper that fails every subscribe, for exercising the
/// subscribe-failure path.
#[cfg(test)]
pub(crate) struct RefusingBus;

#[cfg(test)]
#[async_trait]
impl MessageBus for RefusingBus {
    async fn subscribe(&self, pattern: &str) -> Result<broadcast::Receiver<BusMessage>> {
        Err(crate::types::Error::Subscribe {
            pattern: pattern.to_string(),
            reason: "broker unavailable".to_string(),
        })
    }

    async fn unsubscribe(&self, _pattern: &str) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
        Ok(())
    }
}
