//! Discovery listener.
//!
//! Subscribes to wildcard announcement patterns and turns each inbound
//! message into a transient component descriptor: parse the identity from
//! the topic, hand the payload to the external factory, feed the result to
//! the batch scheduler. Malformed topics and rejected payloads are logged
//! and skipped; duplicates are reconciliation's business, not suppressed
//! here.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batching::DelayedBatch;
use crate::bus::{BusMessage, MessageBus};
use crate::component::{Component, ComponentFactory};
use crate::identity::ComponentId;
use crate::types::Result;

struct Subscription {
    pattern: String,
    task: JoinHandle<()>,
}

pub struct DiscoveryListener {
    bus: Arc<dyn MessageBus>,
    factory: Arc<dyn ComponentFactory>,
    scheduler: Arc<DelayedBatch<Component>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DiscoveryListener {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        factory: Arc<dyn ComponentFactory>,
        scheduler: Arc<DelayedBatch<Component>>,
    ) -> Self {
        Self {
            bus,
            factory,
            scheduler,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe every pattern and spawn one forwarding task per
    /// subscription. Subscribing is the only fallible step; on failure the
    /// patterns subscribed so far are torn down again and the error surfaces
    /// to the caller (no internal retry).
    pub async fn start(&self, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            let rx = match self.bus.subscribe(pattern).await {
                Ok(rx) => rx,
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            };

            let factory = Arc::clone(&self.factory);
            let scheduler = Arc::clone(&self.scheduler);
            let task = tokio::spawn(async move {
                forward_announcements(rx, factory, scheduler).await;
            });
            self.subscriptions.lock().push(Subscription {
                pattern: pattern.clone(),
                task,
            });
        }
        debug!("discovery listening on {} patterns", patterns.len());
        Ok(())
    }

    /// Abort the forwarding tasks and drop all subscriptions. Idempotent;
    /// after return no message reaches the scheduler.
    pub async fn stop(&self) {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain(..).collect();
        for subscription in &subscriptions {
            subscription.task.abort();
        }
        for Subscription { pattern, task } in subscriptions {
            // wait out the cancelled task; an announcement it was mid-way
            // through handling must not reach the scheduler after return
            let _ = task.await;
            if let Err(e) = self.bus.unsubscribe(&pattern).await {
                warn!("failed to unsubscribe '{}': {}", pattern, e);
            }
        }
    }
}

async fn forward_announcements(
    mut rx: broadcast::Receiver<BusMessage>,
    factory: Arc<dyn ComponentFactory>,
    scheduler: Arc<DelayedBatch<Component>>,
) {
    loop {
        match rx.recv().await {
            Ok(msg) => handle_announcement(&msg, &factory, &scheduler),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("discovery subscription lagged, {} announcements missed", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn handle_announcement(
    msg: &BusMessage,
    factory: &Arc<dyn ComponentFactory>,
    scheduler: &Arc<DelayedBatch<Component>>,
) {
    let id = match ComponentId::parse(&msg.topic) {
        Ok(id) => id,
        Err(e) => {
            warn!("skipping announcement: {}", e);
            return;
        }
    };
    let channels = match factory.channels(&id, &msg.payload) {
        Ok(channels) => channels,
        Err(e) => {
            warn!("skipping announcement for {}: {}", id, e);
            return;
        }
    };
    debug!("discovered component {} with {} channels", id, channels.len());
    scheduler.accept(Component::new(id, msg.payload.clone(), channels));
}
