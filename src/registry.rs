//! Reconciliation registry.
//!
//! Owns the authoritative map of live components. Reconciliation is the only
//! writer (batch deliveries are serialized by the scheduler); status
//! derivation and channel-state lookups read concurrently. The write lock is
//! held only for map mutation; component start/stop runs in tasks outside
//! the critical section.

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, SharedBus};
use crate::component::{Component, ComponentFactory, StateSink};
use crate::identity::{ChannelGroupConfig, ComponentId};
use crate::status::{AggregateStatus, ThingTypeDescriptor, aggregate, derive_thing_type, flatten_channels};
use crate::types::{ChannelRef, ChannelState, ComponentState};

/// Channel-type storage of the host framework.
pub trait ChannelTypeRegistrar: Send + Sync {
    fn add_channel_types(&self, component: &Component);
    fn remove_channel_types(&self, component: &Component);
    fn set_thing_type(&self, descriptor: ThingTypeDescriptor);
}

/// The host framework's thing/channel model.
pub trait ThingModel: Send + Sync {
    /// Replace the thing's channel set. Called once per reconciled batch.
    fn update_channels(&self, channels: Vec<ChannelRef>);
    fn update_status(&self, status: AggregateStatus);
    /// Generic channel-state update; `availability` never arrives here.
    fn channel_state_changed(&self, uid: &str, value: &str);
}

/// One channel group as persisted by the host framework across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedGroup {
    pub group_id: String,
    #[serde(default)]
    pub config: Option<ChannelGroupConfig>,
}

/// Mapping from identity to live component, plus the reconciliation rules
/// that keep it consistent with the announcement stream.
pub struct ComponentRegistry {
    components: RwLock<HashMap<ComponentId, Arc<Component>>>,
    bus: Arc<dyn MessageBus>,
    factory: Arc<dyn ComponentFactory>,
    registrar: Arc<dyn ChannelTypeRegistrar>,
    thing_model: Arc<dyn ThingModel>,
    start_concurrency: usize,
}

impl ComponentRegistry {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        factory: Arc<dyn ComponentFactory>,
        registrar: Arc<dyn ChannelTypeRegistrar>,
        thing_model: Arc<dyn ThingModel>,
        start_concurrency: usize,
    ) -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            // components may share state topics, so releases are refcounted
            bus: Arc::new(SharedBus::new(bus)),
            factory,
            registrar,
            thing_model,
            start_concurrency: start_concurrency.max(1),
        }
    }

    /// Apply one delivered batch, in acceptance order.
    ///
    /// Unknown identities are registered and started; a known identity with a
    /// changed fingerprint is replaced (the old descriptor is stopped without
    /// waiting); an unchanged fingerprint only bumps the last-seen marker.
    /// After the batch, the flattened channel list, the derived thing type
    /// and the aggregate status are pushed out.
    pub async fn reconcile(&self, batch: Vec<Component>, sink: Arc<dyn StateSink>) {
        let mut starts: Vec<Arc<Component>> = Vec::new();
        {
            let mut map = self.components.write().await;
            for discovered in batch {
                let discovered = Arc::new(discovered);

                if let Some(known) = map.get(discovered.id()) {
                    if known.fingerprint() == discovered.fingerprint() {
                        debug!("component {} unchanged, marking seen", known.id());
                        known.mark_seen();
                        continue;
                    }

                    let known = Arc::clone(known);
                    if let Some(pos) = starts.iter().position(|c| Arc::ptr_eq(c, &known)) {
                        // superseded within the same batch, it never started
                        starts.remove(pos);
                        known.set_state(ComponentState::Stopped);
                    } else if matches!(
                        known.state(),
                        ComponentState::Active | ComponentState::Starting
                    ) {
                        // fire-and-forget; replacement never waits for a clean stop
                        let bus = Arc::clone(&self.bus);
                        tokio::spawn(async move {
                            if let Err(e) = known.stop(bus).await {
                                warn!("failed to stop replaced component: {}", e);
                            }
                        });
                    } else {
                        // never started, nothing to release
                        known.set_state(ComponentState::Stopped);
                    }
                    info!("component {} configuration changed, replacing", discovered.id());
                }

                self.registrar.add_channel_types(&discovered);
                discovered.set_state(ComponentState::Starting);
                map.insert(discovered.id().clone(), Arc::clone(&discovered));
                starts.push(discovered);
            }
        }

        self.start_components(starts, sink).await;
        self.publish_snapshot().await;
    }

    /// Rebuild registry entries from persisted channel-group configuration,
    /// without contacting the bus. Restored components stay `Pending` until
    /// the start pass that follows. Returns the restored identities.
    pub async fn restore(&self, base_topic: &str, entries: Vec<PersistedGroup>) -> Vec<ComponentId> {
        let mut restored = Vec::new();
        let mut map = self.components.write().await;

        for entry in entries {
            let Some(config) = entry.config else {
                warn!(
                    "skipping restore: {}",
                    crate::types::Error::MissingConfig {
                        group: entry.group_id
                    }
                );
                continue;
            };
            let id = ComponentId::from_group_config(base_topic, &config);

            if let Some(known) = map.get(&id) {
                // types may have been removed by a prior dispose
                self.registrar.add_channel_types(known);
                restored.push(id);
                continue;
            }

            let Some(blob) = config.config else {
                warn!(
                    "skipping restore: {}",
                    crate::types::Error::MissingConfig {
                        group: entry.group_id
                    }
                );
                continue;
            };
            let payload = Bytes::from(blob.into_bytes());
            let channels = match self.factory.channels(&id, &payload) {
                Ok(channels) => channels,
                Err(e) => {
                    warn!("could not restore component {}: {}", id, e);
                    continue;
                }
            };

            let component = Arc::new(Component::new(id.clone(), payload, channels));
            self.registrar.add_channel_types(&component);
            map.insert(id.clone(), Arc::clone(&component));
            info!("restored component {} from persisted config", id);
            restored.push(id);
        }

        restored
    }

    /// Start every component that is not already running (restore follow-up).
    pub async fn start_all(&self, sink: Arc<dyn StateSink>) {
        let pending: Vec<Arc<Component>> = {
            let map = self.components.read().await;
            map.values()
                .filter(|c| {
                    !matches!(c.state(), ComponentState::Active | ComponentState::Starting)
                })
                .cloned()
                .collect()
        };
        for component in &pending {
            component.set_state(ComponentState::Starting);
        }
        self.start_components(pending, sink).await;
        self.refresh_status().await;
    }

    /// Issue `stop()` on every running component without waiting for
    /// completion. Process teardown does not need to observe these finish.
    pub async fn stop_all(&self) {
        let map = self.components.read().await;
        for component in map.values() {
            if matches!(
                component.state(),
                ComponentState::Active | ComponentState::Starting
            ) {
                let component = Arc::clone(component);
                let bus = Arc::clone(&self.bus);
                tokio::spawn(async move {
                    if let Err(e) = component.stop(bus).await {
                        warn!("component stop failed: {}", e);
                    }
                });
            }
        }
    }

    /// Read-only lookup of a channel's definition and cached value.
    pub async fn channel_state(&self, id: &ComponentId, channel_id: &str) -> Option<ChannelState> {
        let component = self.components.read().await.get(id).cloned()?;
        let definition = component.channel(channel_id)?.clone();
        Some(ChannelState {
            definition,
            value: component.value(channel_id),
        })
    }

    pub async fn component(&self, id: &ComponentId) -> Option<Arc<Component>> {
        self.components.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.components.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.components.read().await.is_empty()
    }

    /// Recompute the aggregate status and push it to the thing model.
    /// Triggered after reconciliation and on availability-channel updates.
    pub async fn refresh_status(&self) {
        let map = self.components.read().await;
        self.thing_model.update_status(aggregate(&map));
    }

    /// Remove every component's channel types from the registrar (dispose).
    pub async fn remove_all_channel_types(&self) {
        let map = self.components.read().await;
        for component in map.values() {
            self.registrar.remove_channel_types(component);
        }
    }

    /// Start components with bounded parallelism. One component's failure is
    /// logged and marks it `Failed`; siblings proceed regardless.
    async fn start_components(&self, components: Vec<Arc<Component>>, sink: Arc<dyn StateSink>) {
        futures::stream::iter(components)
            .for_each_concurrent(self.start_concurrency, |component| {
                let bus = Arc::clone(&self.bus);
                let sink = Arc::clone(&sink);
                async move {
                    match component.start(bus, sink).await {
                        Ok(()) => component.set_state(ComponentState::Active),
                        Err(e) => {
                            component.set_state(ComponentState::Failed);
                            warn!("failed to start component {}: {}", component.id(), e);
                        }
                    }
                }
            })
            .await;
    }

    async fn publish_snapshot(&self) {
        let map = self.components.read().await;
        self.thing_model.update_channels(flatten_channels(&map));
        self.registrar.set_thing_type(derive_thing_type(&map));
        self.thing_model.update_status(aggregate(&map));
    }
}
