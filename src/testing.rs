//! Shared test fakes for the three injected capabilities and the bus.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

use crate::bus::{BusMessage, MemoryBus, MessageBus};
use crate::component::{Component, ComponentFactory, StateSink};
use crate::identity::ComponentId;
use crate::registry::{ChannelTypeRegistrar, ThingModel};
use crate::status::{AggregateStatus, ThingTypeDescriptor};
use crate::types::{ChannelDefinition, ChannelRef, Error, Result};

/// Opt-in test logging: `RUST_LOG=mqtt_discovery=debug cargo test -- --nocapture`.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Decodes test payloads of the shape
/// `{"name": .., "state_topic": .., "command_topic"?: .., "availability_topic"?: ..}`
/// into one primary channel plus an optional availability channel.
pub(crate) struct TestFactory;

impl ComponentFactory for TestFactory {
    fn channels(&self, _id: &ComponentId, payload: &[u8]) -> Result<Vec<ChannelDefinition>> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| Error::PayloadRejected {
                reason: e.to_string(),
            })?;
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::PayloadRejected {
                reason: "missing 'name'".to_string(),
            })?;
        let state_topic = value
            .get("state_topic")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::PayloadRejected {
                reason: "missing 'state_topic'".to_string(),
            })?;

        let mut channels = vec![ChannelDefinition {
            id: name.to_string(),
            channel_type: "string".to_string(),
            state_topic: state_topic.to_string(),
            command_topic: value
                .get("command_topic")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }];
        if let Some(topic) = value.get("availability_topic").and_then(|v| v.as_str()) {
            channels.push(ChannelDefinition {
                id: crate::types::AVAILABILITY_CHANNEL.to_string(),
                channel_type: "string".to_string(),
                state_topic: topic.to_string(),
                command_topic: None,
            });
        }
        Ok(channels)
    }
}

/// Build a component the way the discovery listener would.
pub(crate) fn component_from(topic: &str, payload: &str) -> Component {
    let id = ComponentId::parse(topic).unwrap();
    let payload = Bytes::from(payload.to_string());
    let channels = TestFactory.channels(&id, &payload).unwrap();
    Component::new(id, payload, channels)
}

#[derive(Default)]
pub(crate) struct RecordingRegistrar {
    added: AtomicUsize,
    removed: AtomicUsize,
    thing_types: Mutex<Vec<ThingTypeDescriptor>>,
}

impl RecordingRegistrar {
    pub(crate) fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub(crate) fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn last_thing_type(&self) -> Option<ThingTypeDescriptor> {
        self.thing_types.lock().last().cloned()
    }
}

impl ChannelTypeRegistrar for RecordingRegistrar {
    fn add_channel_types(&self, _component: &Component) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_channel_types(&self, _component: &Component) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_thing_type(&self, descriptor: ThingTypeDescriptor) {
        self.thing_types.lock().push(descriptor);
    }
}

#[derive(Default)]
pub(crate) struct RecordingModel {
    statuses: Mutex<Vec<AggregateStatus>>,
    channel_sets: Mutex<Vec<Vec<ChannelRef>>>,
    state_updates: Mutex<Vec<(String, String)>>,
}

impl RecordingModel {
    pub(crate) fn last_status(&self) -> Option<AggregateStatus> {
        self.statuses.lock().last().cloned()
    }

    pub(crate) fn statuses(&self) -> Vec<AggregateStatus> {
        self.statuses.lock().clone()
    }

    pub(crate) fn last_channel_uids(&self) -> Vec<String> {
        self.channel_sets
            .lock()
            .last()
            .map(|set| set.iter().map(|c| c.uid.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn channel_set_updates(&self) -> usize {
        self.channel_sets.lock().len()
    }

    pub(crate) fn state_updates(&self) -> Vec<(String, String)> {
        self.state_updates.lock().clone()
    }
}

impl ThingModel for RecordingModel {
    fn update_channels(&self, channels: Vec<ChannelRef>) {
        self.channel_sets.lock().push(channels);
    }

    fn update_status(&self, status: AggregateStatus) {
        self.statuses.lock().push(status);
    }

    fn channel_state_changed(&self, uid: &str, value: &str) {
        self.state_updates
            .lock()
            .push((uid.to_string(), value.to_string()));
    }
}

/// Sink for tests that do not care about channel traffic.
pub(crate) struct NullSink;

impl StateSink for NullSink {
    fn channel_updated(&self, _id: &ComponentId, _channel_id: &str, _value: &str) {}
    fn availability_changed(&self, _id: &ComponentId, _value: &str) {}
}

/// In-memory bus that refuses subscriptions to topics starting with `!`.
pub(crate) struct FlakyBus {
    inner: MemoryBus,
}

impl FlakyBus {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryBus::new(),
        }
    }
}

#[async_trait]
impl MessageBus for FlakyBus {
    async fn subscribe(&self, pattern: &str) -> Result<broadcast::Receiver<BusMessage>> {
        if pattern.starts_with('!') {
            return Err(Error::Subscribe {
                pattern: pattern.to_string(),
                reason: "refused by test bus".to_string(),
            });
        }
        self.inner.subscribe(pattern).await
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.inner.unsubscribe(pattern).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.inner.publish(topic, payload).await
    }
}
