//! Topic-derived component identity.
//!
//! Announcement topics have the fixed shape
//! `<prefix>/<kind>/[<node>/]<object>/config`. The parsed identity is the
//! registry key; equality and hashing are purely structural, so an identity
//! parsed live from the bus and one rebuilt from persisted channel-group
//! configuration are interchangeable.

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// Identity of one discovered component instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentId {
    pub prefix: String,
    pub kind: String,
    pub node_id: Option<String>,
    pub object_id: String,
}

/// Persisted per-channel-group configuration, as serialized by the host
/// framework. `config` holds the raw announcement payload the component was
/// last created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelGroupConfig {
    pub component: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub object_id: String,
    #[serde(default)]
    pub config: Option<String>,
}

impl ChannelGroupConfig {
    /// Parse a channel-group configuration from the JSON document the host
    /// framework persisted it as.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::PayloadRejected {
            reason: e.to_string(),
        })
    }

    /// Serialize for persistence by the host framework.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::PayloadRejected {
            reason: e.to_string(),
        })
    }
}

impl ComponentId {
    /// Parse an identity from an announcement topic.
    ///
    /// Accepts `prefix/kind/object/config` and `prefix/kind/node/object/config`.
    /// Anything else is a `MalformedIdentity` error; callers skip the message
    /// and keep processing.
    pub fn parse(topic: &str) -> Result<Self> {
        let malformed = || Error::MalformedIdentity {
            topic: topic.to_string(),
        };

        let segments: Vec<&str> = topic.split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(malformed());
        }
        match segments.as_slice() {
            [prefix, kind, object, "config"] => Ok(Self {
                prefix: (*prefix).to_string(),
                kind: (*kind).to_string(),
                node_id: None,
                object_id: (*object).to_string(),
            }),
            [prefix, kind, node, object, "config"] => Ok(Self {
                prefix: (*prefix).to_string(),
                kind: (*kind).to_string(),
                node_id: Some((*node).to_string()),
                object_id: (*object).to_string(),
            }),
            _ => Err(malformed()),
        }
    }

    /// Rebuild an identity from a persisted channel-group configuration
    /// (restore path, no bus round trip).
    pub fn from_group_config(base_topic: &str, config: &ChannelGroupConfig) -> Self {
        Self {
            prefix: base_topic.to_string(),
            kind: config.component.clone(),
            node_id: config.node_id.clone(),
            object_id: config.object_id.clone(),
        }
    }

    /// Stable channel-group name for this identity.
    pub fn group_id(&self) -> String {
        match &self.node_id {
            Some(node) => format!("{}_{}_{}", self.kind, node, self.object_id),
            None => format!("{}_{}", self.kind, self.object_id),
        }
    }

    /// The announcement topic this identity was (or would be) parsed from.
    pub fn config_topic(&self) -> String {
        match &self.node_id {
            Some(node) => format!(
                "{}/{}/{}/{}/config",
                self.prefix, self.kind, node, self.object_id
            ),
            None => format!("{}/{}/{}/config", self.prefix, self.kind, self.object_id),
        }
    }

    /// Wildcard subscription patterns covering every announcement for one
    /// object id, with and without a node segment.
    pub fn discovery_patterns(prefix: &str, object_id: &str) -> Vec<String> {
        vec![
            format!("{prefix}/+/{object_id}/config"),
            format!("{prefix}/+/+/{object_id}/config"),
        ]
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.group_id())
    }
}
