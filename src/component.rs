//! Discovered component descriptors.
//!
//! A component is one channel group on the thing model: a set of channels
//! decoded from its announcement payload by the external factory, plus a
//! payload fingerprint for change detection and a lifecycle state. After
//! insertion into the registry everything but the state, last-seen marker
//! and cached channel values is immutable.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::identity::ComponentId;
use crate::types::{AVAILABILITY_CHANNEL, ChannelDefinition, ComponentState, Error, Result};

/// SHA-256 of a raw announcement payload. Two announcements with the same
/// fingerprint describe the same component configuration.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(payload: &[u8]) -> Self {
        Self(Sha256::digest(payload).into())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Decodes an announcement payload into the component's channel set.
/// Supplied by the surrounding integration; the engine treats payloads as
/// opaque blobs.
pub trait ComponentFactory: Send + Sync {
    /// Returns `Error::PayloadRejected` when the payload is not a usable
    /// component configuration (e.g. a required field is absent).
    fn channels(&self, id: &ComponentId, payload: &[u8]) -> Result<Vec<ChannelDefinition>>;
}

/// Receives channel updates from running components. Generic updates are
/// forwarded to the thing model; the reserved `availability` channel is
/// intercepted to recompute aggregate status.
pub trait StateSink: Send + Sync {
    fn channel_updated(&self, id: &ComponentId, channel_id: &str, value: &str);
    fn availability_changed(&self, id: &ComponentId, value: &str);
}

struct SeenMarker {
    at: Instant,
    at_utc: DateTime<Utc>,
}

/// One discovered component instance.
pub struct Component {
    id: ComponentId,
    fingerprint: Fingerprint,
    channels: Vec<ChannelDefinition>,
    raw_config: Bytes,
    state: Mutex<ComponentState>,
    last_seen: Mutex<SeenMarker>,
    values: Arc<DashMap<String, String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Component {
    pub fn new(id: ComponentId, payload: Bytes, channels: Vec<ChannelDefinition>) -> Self {
        Self {
            id,
            fingerprint: Fingerprint::of(&payload),
            channels,
            raw_config: payload,
            state: Mutex::new(ComponentState::Pending),
            last_seen: Mutex::new(SeenMarker {
                at: Instant::now(),
                at_utc: Utc::now(),
            }),
            values: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn channels(&self) -> &[ChannelDefinition] {
        &self.channels
    }

    /// The raw announcement payload this component was created from, as the
    /// host framework persists it per channel group.
    pub fn raw_config(&self) -> &Bytes {
        &self.raw_config
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ComponentState) {
        *self.state.lock() = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == ComponentState::Active
    }

    /// Update the last-seen marker only. Never touches lifecycle state, so a
    /// re-announcement can not revert an `Active` component.
    pub fn mark_seen(&self) {
        let mut seen = self.last_seen.lock();
        seen.at = Instant::now();
        seen.at_utc = Utc::now();
    }

    pub fn last_seen(&self) -> (Instant, DateTime<Utc>) {
        let seen = self.last_seen.lock();
        (seen.at, seen.at_utc)
    }

    pub fn channel(&self, channel_id: &str) -> Option<&ChannelDefinition> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    /// Last cached value received on one of this component's channels.
    pub fn value(&self, channel_id: &str) -> Option<String> {
        self.values.get(channel_id).map(|v| v.clone())
    }

    /// Subscribe all channel state topics and spawn one forwarding task per
    /// channel. Fails on the first subscription the bus refuses; already
    /// spawned tasks and already established subscriptions are torn down
    /// again in that case.
    pub async fn start(
        self: &Arc<Self>,
        bus: Arc<dyn MessageBus>,
        sink: Arc<dyn StateSink>,
    ) -> Result<()> {
        for (established, channel) in self.channels.iter().enumerate() {
            let rx = match bus.subscribe(&channel.state_topic).await {
                Ok(rx) => rx,
                Err(e) => {
                    self.unwind_start(&bus, established).await;
                    return Err(Error::ComponentStart {
                        id: self.id.to_string(),
                        reason: e.to_string(),
                    });
                }
            };

            let id = self.id.clone();
            let channel_id = channel.id.clone();
            let values = Arc::clone(&self.values);
            let sink = Arc::clone(&sink);
            let handle = tokio::spawn(async move {
                let mut rx = rx;
                loop {
                    match rx.recv().await {
                        Ok(msg) => {
                            let value = String::from_utf8_lossy(&msg.payload).into_owned();
                            values.insert(channel_id.clone(), value.clone());
                            if channel_id == AVAILABILITY_CHANNEL {
                                sink.availability_changed(&id, &value);
                            } else {
                                sink.channel_updated(&id, &channel_id, &value);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("channel {}#{} lagged, {} updates missed", id, channel_id, n);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            self.tasks.lock().push(handle);
        }
        debug!("component {} subscribed {} channels", self.id, self.channels.len());
        Ok(())
    }

    /// Unsubscribe all channel state topics and abort the forwarding tasks.
    /// The first bus error is reported; later channels are still torn down.
    pub async fn stop(&self, bus: Arc<dyn MessageBus>) -> Result<()> {
        self.abort_tasks();

        let mut first_error = None;
        for channel in &self.channels {
            if let Err(e) = bus.unsubscribe(&channel.state_topic).await {
                first_error.get_or_insert_with(|| Error::ComponentStop {
                    id: self.id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        self.set_state(ComponentState::Stopped);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down a partially started component: abort the forwarding tasks
    /// and release the subscriptions established before the failure.
    async fn unwind_start(&self, bus: &Arc<dyn MessageBus>, established: usize) {
        self.abort_tasks();
        for channel in &self.channels[..established] {
            if let Err(e) = bus.unsubscribe(&channel.state_topic).await {
                warn!(
                    "failed to release '{}' for {}: {}",
                    channel.state_topic, self.id, e
                );
            }
        }
    }

    fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id.group_id())
            .field("fingerprint", &self.fingerprint)
            .field("channels", &self.channels.len())
            .field("state", &self.state())
            .finish()
    }
}
