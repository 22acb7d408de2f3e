use serde::{Deserialize, Serialize};

/// Reserved channel id. Updates on this channel are intercepted to drive the
/// aggregate status instead of being forwarded as generic state updates.
pub const AVAILABILITY_CHANNEL: &str = "availability";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed announcement topic: {topic}")]
    MalformedIdentity { topic: String },

    #[error("payload rejected: {reason}")]
    PayloadRejected { reason: String },

    #[error("subscribe to '{pattern}' failed: {reason}")]
    Subscribe { pattern: String, reason: String },

    #[error("component {id} failed to start: {reason}")]
    ComponentStart { id: String, reason: String },

    #[error("component {id} failed to stop: {reason}")]
    ComponentStop { id: String, reason: String },

    #[error("channel group '{group}' has no serialized config")]
    MissingConfig { group: String },
}

/// Component lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentState {
    /// Restored from persisted config, not yet started
    Pending,
    /// Start issued, outcome not yet known
    Starting,
    /// All channel subscriptions established
    Active,
    /// Start failed; siblings are unaffected
    Failed,
    /// Stopped, either replaced or torn down
    Stopped,
}

/// A single channel exposed by a discovered component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDefinition {
    pub id: String,
    pub channel_type: String,
    pub state_topic: String,
    #[serde(default)]
    pub command_topic: Option<String>,
}

/// A channel instance materialized on the thing model, addressed as
/// `<group_id>#<channel_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRef {
    pub uid: String,
    pub definition: ChannelDefinition,
}

/// Read-only view of one channel's definition and last cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelState {
    pub definition: ChannelDefinition,
    pub value: Option<String>,
}
