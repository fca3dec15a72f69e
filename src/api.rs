//! REST boundary: room history and send-message.
//!
//! Every response is wrapped in an [`ApiEnvelope`]. History pages come back
//! newest-first (`asc=false`); ordering for display is the timeline's job.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::chat::Message;
use crate::config::ClientConfig;
use crate::envelope::{de_string_or_number, RoomId};
use crate::error::{ClientError, Result};
use crate::token::TokenSource;

/// `{data, message, status}` wrapper used by every REST response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
}

/// One page of room history.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub page_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageWire {
    #[serde(default)]
    messages: Vec<HistoryMessage>,
    page: u32,
    page_count: u32,
}

#[derive(Debug, Deserialize)]
struct SenderWire {
    #[serde(deserialize_with = "de_string_or_number")]
    id: String,
    #[serde(default)]
    username: String,
}

/// Message as stored server-side: numeric id and a nested sender.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryMessage {
    id: u64,
    #[serde(deserialize_with = "de_string_or_number")]
    room_id: String,
    #[serde(deserialize_with = "de_string_or_number")]
    sender_id: String,
    sender: Option<SenderWire>,
    content: String,
    sent_at: DateTime<Utc>,
}

impl From<HistoryMessage> for Message {
    fn from(wire: HistoryMessage) -> Self {
        let sender_name = wire.sender.map(|s| s.username).unwrap_or_default();
        Message {
            id: Some(wire.id),
            room_id: wire.room_id,
            sender_id: wire.sender_id,
            sender_name,
            content: wire.content,
            sent_at: wire.sent_at,
        }
    }
}

#[derive(Serialize)]
struct SendBody<'a> {
    content: &'a str,
}

/// History and send operations a chat session needs.
pub trait MessageSource: Send + Sync + 'static {
    fn fetch_page(&self, room_id: RoomId, page: u32) -> BoxFuture<'_, Result<MessagePage>>;

    fn send_message(&self, room_id: RoomId, content: String) -> BoxFuture<'_, Result<()>>;
}

/// reqwest-backed client for the JustJio REST API.
#[derive(Clone)]
pub struct RestClient {
    api_url: String,
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl RestClient {
    pub fn new(config: &ClientConfig, tokens: Arc<dyn TokenSource>) -> Self {
        // Builder only fails on TLS backend init; fall back to defaults.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();
        Self { api_url: config.api_url.clone(), client, tokens }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// `{api_url}/rooms/{room_id}/messages`
    fn messages_url(&self, room_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_url)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["rooms", room_id, "messages"]);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.tokens.access_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch history page `page` (1-based, newest first).
    pub async fn fetch_room_messages(&self, room_id: &str, page: u32) -> Result<MessagePage> {
        let mut url = self.messages_url(room_id)?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("asc", "false");

        debug!(room_id, page, "fetching room messages");
        let resp = self.authorize(self.client.get(url.clone())).send().await?;
        let resp = check_status(resp, &url).await?;
        let bytes = resp.bytes().await?;
        let envelope: ApiEnvelope<PageWire> = serde_json::from_slice(&bytes)?;
        let wire = envelope
            .data
            .ok_or_else(|| ClientError::MalformedFrame("message page response without `data`".into()))?;

        Ok(MessagePage {
            messages: wire.messages.into_iter().map(Message::from).collect(),
            page: wire.page,
            page_count: wire.page_count,
        })
    }

    /// Post a chat message. Delivery back to this client happens over the stream.
    pub async fn send_message(&self, room_id: &str, content: &str) -> Result<()> {
        let url = self.messages_url(room_id)?;
        debug!(room_id, "sending message");
        let resp = self
            .authorize(self.client.post(url.clone()))
            .json(&SendBody { content })
            .send()
            .await?;
        check_status(resp, &url).await?;
        Ok(())
    }
}

impl MessageSource for RestClient {
    fn fetch_page(&self, room_id: RoomId, page: u32) -> BoxFuture<'_, Result<MessagePage>> {
        async move { self.fetch_room_messages(&room_id, page).await }.boxed()
    }

    fn send_message(&self, room_id: RoomId, content: String) -> BoxFuture<'_, Result<()>> {
        async move { RestClient::send_message(self, &room_id, &content).await }.boxed()
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient").field("api_url", &self.api_url).finish()
    }
}

/// Map non-2xx responses: 400 and 404 carry the server's message.
async fn check_status(resp: Response, url: &Url) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<ApiEnvelope<serde_json::Value>>()
        .await
        .ok()
        .map(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    warn!(status = status.as_u16(), %url, %message, "REST request failed");
    Err(match status {
        StatusCode::BAD_REQUEST => ClientError::InvalidInput { message },
        StatusCode::NOT_FOUND => ClientError::NotFound { message },
        other => ClientError::Http { status: other.as_u16(), url: url.to_string() },
    })
}
