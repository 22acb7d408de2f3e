//! Lifecycle coordinator.
//!
//! `DeviceHandler` wires the listener, scheduler and registry together and
//! owns the start-up and shutdown sequences. Start-up restores previously
//! persisted components before any bus traffic, starts them, then begins
//! live discovery. Shutdown is strict: stop discovery first, flush the
//! scheduler, then stop components without waiting for them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use async_trait::async_trait;

use crate::batching::{BatchConsumer, DelayedBatch};
use crate::bus::MessageBus;
use crate::component::{Component, ComponentFactory, StateSink};
use crate::discovery::DiscoveryListener;
use crate::identity::ComponentId;
use crate::registry::{ChannelTypeRegistrar, ComponentRegistry, PersistedGroup, ThingModel};
use crate::status::{AggregateStatus, OfflineReason};
use crate::types::{ChannelState, Result};

fn default_base_topic() -> String {
    "homeassistant".to_string()
}

const fn default_debounce_ms() -> u64 {
    250
}

const fn default_start_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Discovery prefix all announcement topics start with.
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    /// Object ids to discover components for.
    #[serde(default)]
    pub object_topics: Vec<String>,
    /// Debounce window for batching bursts of announcements.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Parallelism bound for component starts within one batch.
    #[serde(default = "default_start_concurrency")]
    pub start_concurrency: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            base_topic: default_base_topic(),
            object_topics: Vec::new(),
            debounce_ms: default_debounce_ms(),
            start_concurrency: default_start_concurrency(),
        }
    }
}

/// Scheduler consumer: each delivered batch is reconciled against the
/// registry. Deliveries are serialized by the scheduler, which is what makes
/// reconciliation single-writer.
struct ReconcileConsumer {
    registry: Arc<ComponentRegistry>,
    sink: Arc<dyn StateSink>,
}

#[async_trait]
impl BatchConsumer<Component> for ReconcileConsumer {
    async fn accept(&self, batch: Vec<Component>) {
        self.registry.reconcile(batch, Arc::clone(&self.sink)).await;
    }
}

/// Channel-update sink handed to starting components. Generic updates are
/// forwarded to the thing model; the reserved `availability` channel drives
/// a status recomputation instead.
struct StatusSink {
    registry: Arc<ComponentRegistry>,
    thing_model: Arc<dyn ThingModel>,
}

impl StateSink for StatusSink {
    fn channel_updated(&self, id: &ComponentId, channel_id: &str, value: &str) {
        let uid = format!("{}#{}", id.group_id(), channel_id);
        self.thing_model.channel_state_changed(&uid, value);
    }

    fn availability_changed(&self, id: &ComponentId, _value: &str) {
        let registry = Arc::clone(&self.registry);
        let id = id.clone();
        tokio::spawn(async move {
            tracing::debug!("availability change on {}, recomputing status", id);
            registry.refresh_status().await;
        });
    }
}

pub struct DeviceHandler {
    config: HandlerConfig,
    registry: Arc<ComponentRegistry>,
    scheduler: Arc<DelayedBatch<Component>>,
    listener: DiscoveryListener,
    thing_model: Arc<dyn ThingModel>,
    sink: Arc<dyn StateSink>,
}

impl DeviceHandler {
    pub fn new(
        config: HandlerConfig,
        bus: Arc<dyn MessageBus>,
        factory: Arc<dyn ComponentFactory>,
        registrar: Arc<dyn ChannelTypeRegistrar>,
        thing_model: Arc<dyn ThingModel>,
    ) -> Self {
        let registry = Arc::new(ComponentRegistry::new(
            Arc::clone(&bus),
            Arc::clone(&factory),
            registrar,
            Arc::clone(&thing_model),
            config.start_concurrency,
        ));
        let sink: Arc<dyn StateSink> = Arc::new(StatusSink {
            registry: Arc::clone(&registry),
            thing_model: Arc::clone(&thing_model),
        });
        let scheduler = Arc::new(DelayedBatch::new(
            Duration::from_millis(config.debounce_ms),
            Arc::new(ReconcileConsumer {
                registry: Arc::clone(&registry),
                sink: Arc::clone(&sink),
            }),
        ));
        let listener = DiscoveryListener::new(bus, factory, Arc::clone(&scheduler));

        Self {
            config,
            registry,
            scheduler,
            listener,
            thing_model,
            sink,
        }
    }

    /// Restore persisted components, start them, then begin live discovery.
    ///
    /// An empty object-topic list is a configuration problem: the handler
    /// goes `Offline(ConfigurationError)` without touching the bus. A failed
    /// discovery subscription surfaces to the caller and leaves the handler
    /// `Offline(Gone)`; retrying is the caller's decision.
    pub async fn initialize(&self, persisted: Vec<PersistedGroup>) -> Result<()> {
        if self.config.object_topics.is_empty() {
            self.thing_model
                .update_status(AggregateStatus::Offline(OfflineReason::ConfigurationError(
                    "device topics unknown".to_string(),
                )));
            return Ok(());
        }

        let restored = self
            .registry
            .restore(&self.config.base_topic, persisted)
            .await;

        self.thing_model
            .update_status(AggregateStatus::Offline(OfflineReason::Gone(
                "no response from the device yet".to_string(),
            )));
        self.registry.start_all(Arc::clone(&self.sink)).await;

        // discover both the configured objects and everything we restored
        let mut patterns = BTreeSet::new();
        for object_id in &self.config.object_topics {
            patterns.extend(ComponentId::discovery_patterns(
                &self.config.base_topic,
                object_id,
            ));
        }
        for id in &restored {
            patterns.extend(ComponentId::discovery_patterns(&id.prefix, &id.object_id));
        }
        let patterns: Vec<String> = patterns.into_iter().collect();

        if let Err(e) = self.listener.start(&patterns).await {
            warn!("discovery subscription failed: {}", e);
            self.thing_model
                .update_status(AggregateStatus::Offline(OfflineReason::Gone(e.to_string())));
            return Err(e);
        }
        info!(
            "initialized with {} restored components, discovering on {} patterns",
            restored.len(),
            patterns.len()
        );
        Ok(())
    }

    /// Shutdown sequence: stop discovery, flush and process any pending
    /// batch, then stop components without waiting for completion and drop
    /// their channel types.
    pub async fn dispose(&self) {
        self.listener.stop().await;
        self.scheduler.join().await;
        self.registry.stop_all().await;
        self.registry.remove_all_channel_types().await;
    }

    /// The discovery listener's outward callback: feed a transient
    /// descriptor into the debounce window.
    pub fn component_discovered(&self, component: Component) {
        self.scheduler.accept(component);
    }

    /// Read-only registry lookup of one channel's definition and cached
    /// value.
    pub async fn channel_state(&self, id: &ComponentId, channel_id: &str) -> Option<ChannelState> {
        self.registry.channel_state(id, channel_id).await
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }
}
