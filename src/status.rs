//! Aggregate status and thing-type derivation.
//!
//! Both derivations are pure functions over a registry snapshot so they can
//! be tested without any bus or lifecycle machinery in play.

use std::collections::HashMap;
use std::sync::Arc;

use crate::component::Component;
use crate::identity::ComponentId;
use crate::types::ChannelRef;

/// Derived online/offline signal for the whole integration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateStatus {
    Online,
    Offline(OfflineReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineReason {
    /// Registry is empty.
    NoComponents,
    /// At least one component is not active.
    ComponentInactive,
    /// Externally signalled configuration problem (e.g. no topics).
    ConfigurationError(String),
    /// Externally signalled transport loss or missing device.
    Gone(String),
}

/// Channel-group structure of the current registry snapshot, swapped into
/// the external type registrar after each reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingTypeDescriptor {
    pub groups: Vec<ChannelGroupDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroupDefinition {
    pub group_id: String,
    pub channel_ids: Vec<String>,
}

/// `Online` iff the registry is non-empty and every component is active.
pub fn aggregate(snapshot: &HashMap<ComponentId, Arc<Component>>) -> AggregateStatus {
    if snapshot.is_empty() {
        return AggregateStatus::Offline(OfflineReason::NoComponents);
    }
    if snapshot.values().all(|c| c.is_active()) {
        AggregateStatus::Online
    } else {
        AggregateStatus::Offline(OfflineReason::ComponentInactive)
    }
}

/// Derive the thing-type descriptor from a registry snapshot. Groups are
/// ordered by group id so repeated derivations compare equal.
pub fn derive_thing_type(snapshot: &HashMap<ComponentId, Arc<Component>>) -> ThingTypeDescriptor {
    let mut groups: Vec<ChannelGroupDefinition> = snapshot
        .values()
        .map(|component| ChannelGroupDefinition {
            group_id: component.id().group_id(),
            channel_ids: component.channels().iter().map(|c| c.id.clone()).collect(),
        })
        .collect();
    groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    ThingTypeDescriptor { groups }
}

/// Flatten the channel list across all registry entries, ordered by group id.
pub fn flatten_channels(snapshot: &HashMap<ComponentId, Arc<Component>>) -> Vec<ChannelRef> {
    let mut components: Vec<&Arc<Component>> = snapshot.values().collect();
    components.sort_by_key(|c| c.id().group_id());

    components
        .iter()
        .flat_map(|component| {
            let group = component.id().group_id();
            component.channels().iter().map(move |definition| ChannelRef {
                uid: format!("{}#{}", group, definition.id),
                definition: definition.clone(),
            })
        })
        .collect()
}
