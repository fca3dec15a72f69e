//! Channel registry: one callback per channel key.
//!
//! A key is either global (`CREATE_MESSAGE`) or scoped to a room
//! (`CREATE_MESSAGE_<roomId>`). Subscribing to a key that already has a
//! callback replaces it. The returned [`Subscription`] removes the callback
//! when released or dropped, but only while it is still the current owner of
//! the key, so a view that went away cannot unhook its replacement.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

use crate::envelope::RoomId;

/// Event type tag carried in the envelope's `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// A chat message was posted to a room.
    CreateMessage,
    /// Any other server event, kept verbatim.
    Other(String),
}

impl EventType {
    pub const CREATE_MESSAGE: &'static str = "CREATE_MESSAGE";

    pub fn as_str(&self) -> &str {
        match self {
            EventType::CreateMessage => Self::CREATE_MESSAGE,
            EventType::Other(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            Self::CREATE_MESSAGE => EventType::CreateMessage,
            _ => EventType::Other(s),
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        EventType::from(s.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::CreateMessage => EventType::CREATE_MESSAGE.to_string(),
            EventType::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription target.
///
/// `Display` gives the flat `TYPE` / `TYPE_roomId` form. [`ChannelKey::parse`]
/// only inverts it for known event types: an `Other` type may itself contain
/// `_`, so `ROOM_INVITE_abc` cannot be split and reads back as a global key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Every event of this type, whatever the room.
    Global(EventType),
    /// Events of this type for one room only.
    Room(EventType, RoomId),
}

impl ChannelKey {
    pub fn global(event_type: impl Into<EventType>) -> Self {
        ChannelKey::Global(event_type.into())
    }

    pub fn room(event_type: impl Into<EventType>, room_id: impl Into<RoomId>) -> Self {
        ChannelKey::Room(event_type.into(), room_id.into())
    }

    /// Room-scoped channel for new chat messages.
    pub fn chat(room_id: impl Into<RoomId>) -> Self {
        ChannelKey::Room(EventType::CreateMessage, room_id.into())
    }

    pub fn event_type(&self) -> &EventType {
        match self {
            ChannelKey::Global(t) | ChannelKey::Room(t, _) => t,
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            ChannelKey::Global(_) => None,
            ChannelKey::Room(_, room) => Some(room),
        }
    }

    /// Parse the flat `TYPE` / `TYPE_roomId` form.
    ///
    /// Only known event types can be split into a room-scoped key; anything
    /// else is read as a global key of that literal type.
    pub fn parse(s: &str) -> Self {
        let prefix = EventType::CREATE_MESSAGE;
        if let Some(room) = s.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('_')) {
            if !room.is_empty() {
                return ChannelKey::Room(EventType::CreateMessage, room.to_string());
            }
        }
        ChannelKey::Global(EventType::from(s))
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKey::Global(t) => write!(f, "{t}"),
            ChannelKey::Room(t, room) => write!(f, "{t}_{room}"),
        }
    }
}

/// Callback invoked with the envelope's `data` payload.
pub type ChannelCallback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    generation: u64,
    callback: ChannelCallback,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ChannelKey, Entry>,
    next_generation: u64,
}

/// Shared map from channel key to callback. Cloning shares the map.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback` for `key`, replacing any existing one.
    pub fn subscribe<F>(&self, key: ChannelKey, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe_arc(key, Arc::new(callback))
    }

    pub fn subscribe_arc(&self, key: ChannelKey, callback: ChannelCallback) -> Subscription {
        let mut generation = 0;
        if let Ok(mut guard) = self.inner.lock() {
            guard.next_generation += 1;
            generation = guard.next_generation;
            let replaced = guard
                .entries
                .insert(key.clone(), Entry { generation, callback })
                .is_some();
            if replaced {
                debug!(channel = %key, "replaced existing channel subscriber");
            } else {
                debug!(channel = %key, "subscribed");
            }
        }
        Subscription {
            key,
            generation,
            registry: Arc::downgrade(&self.inner),
            armed: true,
        }
    }

    /// Remove whatever callback is registered for `key`. Returns whether one was.
    pub fn unsubscribe(&self, key: &ChannelKey) -> bool {
        let removed = self
            .inner
            .lock()
            .map(|mut g| g.entries.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            debug!(channel = %key, "unsubscribed");
        }
        removed
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.inner.lock().map(|g| g.entries.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        self.inner
            .lock()
            .map(|g| g.entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Call the callback for `key` with `data`. Returns false if none is registered.
    ///
    /// The lock is not held while the callback runs, so callbacks may
    /// subscribe or unsubscribe freely.
    pub fn invoke(&self, key: &ChannelKey, data: &Value) -> bool {
        let callback = self
            .inner
            .lock()
            .ok()
            .and_then(|g| g.entries.get(key).map(|e| Arc::clone(&e.callback)));
        match callback {
            Some(cb) => {
                cb(data);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry").field("keys", &self.keys()).finish()
    }
}

/// Ownership of one channel key.
///
/// Dropping it (or calling [`release`](Self::release)) removes the callback
/// if nobody has subscribed to the same key since.
#[must_use = "dropping a Subscription immediately removes the callback"]
pub struct Subscription {
    key: ChannelKey,
    generation: u64,
    registry: Weak<Mutex<Inner>>,
    armed: bool,
}

impl Subscription {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Whether this handle's callback is still the one installed for its key.
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .and_then(|inner| {
                inner
                    .lock()
                    .ok()
                    .map(|g| g.entries.get(&self.key).map(|e| e.generation) == Some(self.generation))
            })
            .unwrap_or(false)
    }

    /// Remove the callback now. Returns true if this handle still owned the key.
    pub fn release(mut self) -> bool {
        self.remove_if_owner()
    }

    /// Leave the callback installed after this handle is gone.
    pub fn detach(mut self) {
        self.armed = false;
    }

    fn remove_if_owner(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        self.armed = false;
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let Ok(mut guard) = inner.lock() else {
            return false;
        };
        let owns = guard.entries.get(&self.key).map(|e| e.generation) == Some(self.generation);
        if owns {
            guard.entries.remove(&self.key);
            debug!(channel = %self.key, "subscription released");
        }
        owns
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove_if_owner();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("armed", &self.armed)
            .finish()
    }
}
