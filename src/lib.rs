//! MQTT-style component discovery and reconciliation engine.
//!
//! Listens for component announcements on a topic-structured message bus,
//! debounces bursts into batches, and reconciles each batch against a live
//! registry of known components: new ones are registered and started,
//! changed ones replaced, unchanged ones marked as seen. An aggregate
//! online/offline status is derived from the registry after every change.
//!
//! The engine is transport-agnostic: it is constructed with a message-bus
//! handle, a component factory and a channel-type registrar, and pushes its
//! results into a thing-model sink. All four are traits, so the whole core
//! runs against in-process fakes in tests.

// Component identity parsed from announcement topics
pub mod identity;

// Message-bus contract and in-memory broker
pub mod bus;

// Debounce/batch scheduler
pub mod batching;

// Discovered component descriptors
pub mod component;

// Discovery listener
pub mod discovery;

// Reconciliation registry
pub mod registry;

// Aggregate status and thing-type derivation
pub mod status;

// Lifecycle coordinator
pub mod handler;

// Shared value and error types
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use batching::{BatchConsumer, DelayedBatch};
pub use bus::{BusMessage, MemoryBus, MessageBus, SharedBus};
pub use component::{Component, ComponentFactory, Fingerprint, StateSink};
pub use discovery::DiscoveryListener;
pub use handler::{DeviceHandler, HandlerConfig};
pub use identity::{ChannelGroupConfig, ComponentId};
pub use registry::{ChannelTypeRegistrar, ComponentRegistry, PersistedGroup, ThingModel};
pub use status::{AggregateStatus, ChannelGroupDefinition, OfflineReason, ThingTypeDescriptor};
pub use types::{
    AVAILABILITY_CHANNEL, ChannelDefinition, ChannelRef, ChannelState, ComponentState, Error,
    Result,
};
