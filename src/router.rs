//! Two-tier frame dispatch.
//!
//! Each frame goes to the room-scoped subscriber `TYPE_roomId` if there is
//! one, otherwise to the global `TYPE` subscriber. Never both: a room view
//! that is open suppresses the global handler for that room's events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::channel::{ChannelKey, ChannelRegistry};
use crate::envelope::Envelope;

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    RoomScoped(ChannelKey),
    Global(ChannelKey),
    Dropped(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The frame was not a `{type, data}` envelope.
    Malformed(String),
    /// Nobody is subscribed to either tier.
    NoSubscriber,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub frames_routed: u64,
    pub frames_dropped: u64,
    pub frames_malformed: u64,
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
}

/// Routes decoded frames into a [`ChannelRegistry`]. Cheap to clone.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ChannelRegistry,
    counters: Arc<Counters>,
}

impl MessageRouter {
    pub fn new(registry: ChannelRegistry) -> Self {
        Self { registry, counters: Arc::new(Counters::default()) }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Decode and dispatch one text frame.
    pub fn dispatch(&self, frame: &str) -> Dispatch {
        match Envelope::parse(frame) {
            Ok(envelope) => self.dispatch_envelope(&envelope),
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropping malformed frame");
                Dispatch::Dropped(DropReason::Malformed(e.to_string()))
            }
        }
    }

    pub fn dispatch_envelope(&self, envelope: &Envelope) -> Dispatch {
        if let Some(room_id) = envelope.room_id() {
            let key = ChannelKey::Room(envelope.event_type.clone(), room_id);
            if self.registry.invoke(&key, &envelope.data) {
                self.counters.routed.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %key, "routed to room subscriber");
                return Dispatch::RoomScoped(key);
            }
        }

        let key = ChannelKey::Global(envelope.event_type.clone());
        if self.registry.invoke(&key, &envelope.data) {
            self.counters.routed.fetch_add(1, Ordering::Relaxed);
            debug!(channel = %key, "routed to global subscriber");
            return Dispatch::Global(key);
        }

        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(event_type = %envelope.event_type, room_id = ?envelope.room_id(), "no subscriber for frame");
        Dispatch::Dropped(DropReason::NoSubscriber)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            frames_routed: self.counters.routed.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            frames_malformed: self.counters.malformed.load(Ordering::Relaxed),
        }
    }
}
