//! Chat pagination and merge for one open room view.
//!
//! History arrives newest-page-first over REST, live messages arrive over the
//! stream. [`ChatTimeline`] reconciles both into one list ordered by
//! `sentAt`; [`ChatSession`] owns the subscription and page cursor for a
//! mounted room.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::MessageSource;
use crate::channel::{ChannelKey, ChannelRegistry, Subscription};
use crate::connection::ConnectionEvent;
use crate::envelope::{de_string_or_number, RoomId};
use crate::error::{ClientError, Result};

/// Live echoes older or newer than this are not matched to a history entry.
const ECHO_WINDOW_SECS: i64 = 2;

/// One chat message. `id` is assigned by the server and absent on live frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(deserialize_with = "de_string_or_number")]
    pub room_id: RoomId,
    #[serde(deserialize_with = "de_string_or_number")]
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Decode the `data` of a `CREATE_MESSAGE` frame.
    pub fn from_live(data: &Value) -> Result<Self> {
        Ok(Message::deserialize(data)?)
    }

    /// Whether `self` is the live echo of the stored message `stored`.
    fn is_echo_of(&self, stored: &Message) -> bool {
        self.id.is_none()
            && self.sender_id == stored.sender_id
            && self.content == stored.content
            && (self.sent_at - stored.sent_at).num_seconds().abs() <= ECHO_WINDOW_SECS
    }
}

/// Messages sharing one calendar day, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    pub date: NaiveDate,
    pub messages: Vec<&'a Message>,
}

impl DayGroup<'_> {
    /// Separator label, e.g. `Wednesday, May 1`.
    pub fn label(&self) -> String {
        self.date.format("%A, %b %-d").to_string()
    }
}

/// Ordered, deduplicated message list for one room.
#[derive(Debug, Clone, Default)]
pub struct ChatTimeline {
    messages: Vec<Message>,
    is_new: bool,
}

impl ChatTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `incoming` with the current list, dedupe by id, sort by `sent_at`.
    ///
    /// Later occurrences of an id replace earlier ones; the current list is
    /// seen after the page. A message without an id is dropped only when
    /// `incoming` carries its stored copy for the first time; each stored
    /// message absorbs at most one live copy. The sort is stable.
    pub fn merge_page(&mut self, incoming: Vec<Message>, page: u32) {
        let existing: Vec<Message> = {
            let known: HashSet<u64> = self.messages.iter().filter_map(|m| m.id).collect();
            // Stored messages new to the timeline, each able to absorb one live copy.
            let mut unclaimed: Vec<&Message> = incoming
                .iter()
                .filter(|m| m.id.is_some_and(|id| !known.contains(&id)))
                .collect();
            std::mem::take(&mut self.messages)
                .into_iter()
                .filter(|m| {
                    if m.id.is_some() {
                        return true;
                    }
                    match unclaimed.iter().position(|stored| m.is_echo_of(stored)) {
                        Some(slot) => {
                            unclaimed.swap_remove(slot);
                            false
                        }
                        None => true,
                    }
                })
                .collect()
        };

        let mut merged: Vec<Message> = Vec::with_capacity(incoming.len() + existing.len());
        let mut slot_by_id: HashMap<u64, usize> = HashMap::new();
        for msg in incoming.into_iter().chain(existing) {
            match msg.id {
                Some(id) => match slot_by_id.get(&id) {
                    Some(&slot) => merged[slot] = msg,
                    None => {
                        slot_by_id.insert(id, merged.len());
                        merged.push(msg);
                    }
                },
                None => merged.push(msg),
            }
        }
        merged.sort_by_key(|m| m.sent_at);

        self.messages = merged;
        // Only the newest page should pull the view to the bottom.
        self.is_new = page == 1;
    }

    /// Append a message that arrived over the stream.
    pub fn push_live(&mut self, message: Message) {
        self.messages.push(message);
        self.is_new = true;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// True when the last change added messages at the newest end.
    pub fn is_new_message(&self) -> bool {
        self.is_new
    }

    /// Consecutive runs of messages sharing a calendar day in `tz`.
    pub fn group_by_day_in<Tz: TimeZone>(&self, tz: &Tz) -> Vec<DayGroup<'_>> {
        let mut groups: Vec<DayGroup<'_>> = Vec::new();
        for msg in &self.messages {
            let date = msg.sent_at.with_timezone(tz).date_naive();
            match groups.last_mut() {
                Some(group) if group.date == date => group.messages.push(msg),
                _ => groups.push(DayGroup { date, messages: vec![msg] }),
            }
        }
        groups
    }

    /// [`group_by_day_in`](Self::group_by_day_in) using the local timezone.
    pub fn group_by_day(&self) -> Vec<DayGroup<'_>> {
        self.group_by_day_in(&chrono::Local)
    }
}

/// User-facing failure message. Nothing is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    FetchFailed,
    InvalidMessage,
    NotFound,
    SendFailed,
}

impl Notice {
    fn for_send_error(err: &ClientError) -> Self {
        match err {
            ClientError::InvalidInput { .. } => Notice::InvalidMessage,
            ClientError::NotFound { .. } => Notice::NotFound,
            _ => Notice::SendFailed,
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Notice::FetchFailed => "Failed to fetch messages",
            Notice::InvalidMessage => "Invalid message",
            Notice::NotFound => "Room / User not found",
            Notice::SendFailed => "Failed to send message",
        };
        f.write_str(text)
    }
}

/// What a session reports to its view.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Live(Message),
    PageLoaded { page: u32, page_count: u32 },
    Notice(Notice),
}

#[derive(Debug, Default)]
struct Cursor {
    /// Highest history page merged so far (0 before the first load).
    page: u32,
    page_count: Option<u32>,
}

/// One mounted room view.
///
/// Methods take `&self` so the session can be shared with a reconnect
/// follower; [`close`](Self::close) stops everything, including fetches
/// already in flight.
pub struct ChatSession {
    room_id: RoomId,
    source: Arc<dyn MessageSource>,
    timeline: Arc<Mutex<ChatTimeline>>,
    cursor: Mutex<Cursor>,
    subscription: Mutex<Option<Subscription>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    cancel: CancellationToken,
}

impl ChatSession {
    /// Subscribe to the room's live messages and load the newest page.
    pub async fn open(
        registry: &ChannelRegistry,
        source: Arc<dyn MessageSource>,
        room_id: impl Into<RoomId>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let room_id = room_id.into();
        let (events, events_rx) = mpsc::unbounded_channel();
        let timeline = Arc::new(Mutex::new(ChatTimeline::new()));

        let subscription = {
            let timeline = Arc::clone(&timeline);
            let events = events.clone();
            let room = room_id.clone();
            registry.subscribe(ChannelKey::chat(room_id.clone()), move |data| match Message::from_live(data) {
                Ok(message) => {
                    if let Ok(mut t) = timeline.lock() {
                        t.push_live(message.clone());
                        // Queued under the lock so catch_up sees both or neither.
                        let _ = events.send(ChatEvent::Live(message));
                    }
                }
                Err(e) => debug!(room_id = %room, error = %e, "ignoring undecodable chat frame"),
            })
        };
        info!(room_id = %room_id, channel = %subscription.key(), "chat session opened");

        let session = Self {
            room_id,
            source,
            timeline,
            cursor: Mutex::new(Cursor::default()),
            subscription: Mutex::new(Some(subscription)),
            events,
            cancel: CancellationToken::new(),
        };
        session.load_page(1).await;
        (session, events_rx)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Snapshot of the current timeline.
    pub fn timeline(&self) -> ChatTimeline {
        self.timeline.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Timeline snapshot with everything queued on `events` folded in.
    ///
    /// Queued live messages are already part of the snapshot and are
    /// consumed; queued notices are handed back so they can still be shown.
    pub fn catch_up(&self, events: &mut mpsc::UnboundedReceiver<ChatEvent>) -> (ChatTimeline, Vec<Notice>) {
        let Ok(timeline) = self.timeline.lock() else {
            return (ChatTimeline::default(), Vec::new());
        };
        let mut notices = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::Notice(notice) = event {
                notices.push(notice);
            }
        }
        (timeline.clone(), notices)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.timeline().messages().to_vec()
    }

    pub fn page(&self) -> u32 {
        self.cursor.lock().map(|c| c.page).unwrap_or(0)
    }

    pub fn page_count(&self) -> Option<u32> {
        self.cursor.lock().ok().and_then(|c| c.page_count)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Load the next older page. Returns false when there is nothing more to
    /// load, the fetch failed or the session closed.
    pub async fn fetch_more(&self) -> bool {
        let next = match self.cursor.lock() {
            Ok(c) => match c.page_count {
                Some(count) if c.page < count => c.page + 1,
                _ => return false,
            },
            Err(_) => return false,
        };
        self.load_page(next).await
    }

    /// Refetch the newest page and merge it. Used after a reconnect to pick up
    /// messages that were broadcast while the stream was down.
    pub async fn resync(&self) -> bool {
        self.load_page(1).await
    }

    /// Post `text` to the room. Blank input is ignored.
    ///
    /// The message itself shows up via the live stream, not from here.
    pub async fn send(&self, text: &str) -> bool {
        if text.trim().is_empty() || self.is_closed() {
            return false;
        }
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            res = self.source.send_message(self.room_id.clone(), text.to_string()) => res,
        };
        match outcome {
            Ok(()) => true,
            Err(e) => {
                let notice = Notice::for_send_error(&e);
                warn!(room_id = %self.room_id, error = %e, %notice, "failed to send message");
                let _ = self.events.send(ChatEvent::Notice(notice));
                false
            }
        }
    }

    /// Unsubscribe and cancel in-flight work. Idempotent.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Ok(mut slot) = self.subscription.lock() {
            if let Some(sub) = slot.take() {
                sub.release();
            }
        }
        info!(room_id = %self.room_id, "chat session closed");
    }

    /// Resync whenever the connection reports [`ConnectionEvent::Reconnected`].
    /// The task ends when the session closes.
    pub fn follow_reconnects(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    ev = events.recv() => ev,
                };
                match event {
                    Ok(ConnectionEvent::Reconnected { .. }) => {
                        info!(room_id = %session.room_id, "stream reconnected, resyncing newest page");
                        session.resync().await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "connection events lagged, resyncing");
                        session.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn load_page(&self, page: u32) -> bool {
        if self.is_closed() {
            return false;
        }
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            res = self.source.fetch_page(self.room_id.clone(), page) => res,
        };
        // A fetch that resolved as the session closed must not write.
        if self.is_closed() {
            return false;
        }

        match outcome {
            Ok(fetched) => {
                debug!(room_id = %self.room_id, page, count = fetched.messages.len(), "merging history page");
                if let Ok(mut t) = self.timeline.lock() {
                    t.merge_page(fetched.messages, page);
                }
                if let Ok(mut c) = self.cursor.lock() {
                    c.page = c.page.max(page);
                    c.page_count = Some(fetched.page_count);
                }
                let _ = self.events.send(ChatEvent::PageLoaded { page, page_count: fetched.page_count });
                true
            }
            Err(e) => {
                warn!(room_id = %self.room_id, page, error = %e, "failed to fetch messages");
                let _ = self.events.send(ChatEvent::Notice(Notice::FetchFailed));
                false
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("room_id", &self.room_id)
            .field("page", &self.page())
            .field("page_count", &self.page_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
