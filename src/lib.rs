//! Realtime client layer for JustJio rooms.
//!
//! One [`ConnectionManager`] owns the streaming socket for the logged-in user.
//! Inbound frames are decoded into [`Envelope`]s and routed by the
//! [`MessageRouter`] to callbacks in the [`ChannelRegistry`], keyed
//! `TYPE_roomId` with a `TYPE` fallback. A [`ChatSession`] per open room merges
//! live messages with REST history pages into a [`ChatTimeline`].

pub mod api;
pub mod channel;
pub mod chat;
pub mod cli;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod router;
pub mod token;
pub mod transport;

pub use api::{ApiEnvelope, MessagePage, MessageSource, RestClient};
pub use channel::{ChannelCallback, ChannelKey, ChannelRegistry, EventType, Subscription};
pub use chat::{ChatEvent, ChatSession, ChatTimeline, DayGroup, Message, Notice};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{CloseReason, ConnectionEvent, ConnectionManager, ConnectionState};
pub use envelope::{Envelope, RoomId};
pub use error::{ClientError, Result};
pub use router::{Dispatch, DropReason, MessageRouter, RouterStats};
pub use token::{token_source_from_config, Claims, FileToken, Identity, MemoryToken, TokenSource};
pub use transport::{stream_url, Connector, MemoryConnector, MemoryPeer, Transport, WsConnector};
