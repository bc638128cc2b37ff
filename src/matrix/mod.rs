//! Minimal Matrix client-server API client.
//!
//! Covers what the relay needs: joining the bridged rooms, sending `m.text` messages and a
//! long-poll `/sync` loop that turns new room messages into [`ChatEvent`]s. Relayed messages
//! carry the originating node and meshnet in extra content keys so other bridges (and this
//! one) can recognise them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use crate::config::MatrixConfig;
use crate::error::RelayError;
use crate::logutil::escape_log;
use crate::relay::{ChatEvent, ChatRelay};

const SYNC_TIMEOUT_MS: u64 = 30_000;
const SYNC_RETRY: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub const KEY_LONGNAME: &str = "meshtastic_longname";
pub const KEY_SHORTNAME: &str = "meshtastic_shortname";
pub const KEY_MESHNET: &str = "meshtastic_meshnet";

pub struct MatrixClient {
    http: reqwest::Client,
    homeserver: String,
    access_token: String,
    user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

fn chat_err(e: reqwest::Error) -> RelayError {
    RelayError::Chat(e.to_string())
}

impl MatrixClient {
    pub fn new(config: &MatrixConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            http,
            homeserver: config.homeserver.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            user_id: config.bot_user_id.clone(),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{}", self.homeserver, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RelayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RelayError::Chat(format!(
            "homeserver returned {}: {}",
            status,
            escape_log(&body)
        )))
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), RelayError> {
        let url = self.url(&format!("/join/{}", urlencoding::encode(room_id)));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&json!({}))
            .send()
            .await
            .map_err(chat_err)?;
        Self::check(response).await?;
        info!("Joined room {}", room_id);
        Ok(())
    }

    /// Send an `m.room.message` event; returns the new event id.
    pub async fn send_message(&self, room_id: &str, content: &Value) -> Result<String, RelayError> {
        let txn = uuid::Uuid::new_v4();
        let url = self.url(&format!(
            "/rooms/{}/send/m.room.message/{}",
            urlencoding::encode(room_id),
            txn
        ));
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(content)
            .send()
            .await
            .map_err(chat_err)?;
        let sent: SendResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(chat_err)?;
        trace!("sent {} to {}", sent.event_id, room_id);
        Ok(sent.event_id)
    }

    pub async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncResponse, RelayError> {
        let mut url = self.url(&format!("/sync?timeout={}", timeout_ms));
        match since {
            Some(token) => {
                url.push_str("&since=");
                url.push_str(&urlencoding::encode(token));
            }
            None => {
                // Only the position matters on the first sync; keep the backlog small.
                let filter = r#"{"room":{"timeline":{"limit":1}}}"#;
                url.push_str("&filter=");
                url.push_str(&urlencoding::encode(filter));
            }
        }
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(chat_err)?;
        Self::check(response).await?.json().await.map_err(chat_err)
    }

    /// Long-poll `/sync` until shutdown, forwarding new messages from `rooms`.
    ///
    /// The initial sync only establishes a position; messages sent before startup are never
    /// relayed.
    pub async fn run_sync(
        self: Arc<Self>,
        rooms: Vec<String>,
        events: mpsc::Sender<ChatEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut since: Option<String> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let timeout_ms = if since.is_some() { SYNC_TIMEOUT_MS } else { 0 };
            let result = tokio::select! {
                r = self.sync(since.as_deref(), timeout_ms) => r,
                _ = shutdown.changed() => break,
            };
            match result {
                Ok(resp) => {
                    if since.is_some() {
                        for event in chat_events(&resp, &self.user_id, &rooms) {
                            if events.send(event).await.is_err() {
                                debug!("chat event receiver gone; stopping sync");
                                return;
                            }
                        }
                    } else {
                        debug!("initial sync complete; relaying new messages only");
                    }
                    since = Some(resp.next_batch);
                }
                Err(e) => {
                    warn!("Matrix sync failed: {}; retrying in {:?}", e, SYNC_RETRY);
                    tokio::select! {
                        _ = sleep(SYNC_RETRY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        debug!("matrix sync stopped");
    }
}

/// Text messages in `rooms` not sent by `own_user`, in timeline order.
pub fn chat_events(resp: &SyncResponse, own_user: &str, rooms: &[String]) -> Vec<ChatEvent> {
    let mut out = Vec::new();
    for room_id in rooms {
        let Some(joined) = resp.rooms.join.get(room_id) else {
            continue;
        };
        for ev in &joined.timeline.events {
            if ev.kind != "m.room.message" || ev.sender == own_user {
                continue;
            }
            if ev.content.get("msgtype").and_then(Value::as_str) != Some("m.text") {
                continue;
            }
            let Some(body) = ev.content.get("body").and_then(Value::as_str) else {
                continue;
            };
            out.push(ChatEvent {
                room_id: room_id.clone(),
                event_id: ev.event_id.clone(),
                sender: ev.sender.clone(),
                sender_display: display_name(&ev.sender),
                body: body.to_string(),
                meshnet: ev
                    .content
                    .get(KEY_MESHNET)
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
    }
    out
}

/// `@alice:example.org` → `alice`
fn display_name(user_id: &str) -> String {
    let local = user_id.strip_prefix('@').unwrap_or(user_id);
    local.split(':').next().unwrap_or(local).to_string()
}

#[async_trait]
impl ChatRelay for MatrixClient {
    async fn relay(
        &self,
        room_id: &str,
        text: &str,
        display_name: &str,
        short_name: &str,
        meshnet_name: &str,
    ) -> Result<(), RelayError> {
        let content = json!({
            "msgtype": "m.text",
            "body": text,
            KEY_LONGNAME: display_name,
            KEY_SHORTNAME: short_name,
            KEY_MESHNET: meshnet_name,
        });
        self.send_message(room_id, &content).await?;
        info!("Sent inbound radio message to matrix room: {}", room_id);
        Ok(())
    }

    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), RelayError> {
        let content = json!({ "msgtype": "m.text", "body": text });
        self.send_message(room_id, &content).await.map(|_| ())
    }

    async fn send_html(&self, room_id: &str, body: &str, html: &str) -> Result<(), RelayError> {
        self.send_message(room_id, &html_content(body, html))
            .await
            .map(|_| ())
    }
}

fn html_content(body: &str, html: &str) -> Value {
    json!({
        "msgtype": "m.text",
        "body": body,
        "format": "org.matrix.custom.html",
        "formatted_body": html,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_fixture() -> SyncResponse {
        serde_json::from_value(json!({
            "next_batch": "s2",
            "rooms": { "join": {
                "!ops:example.org": { "timeline": { "events": [
                    { "type": "m.room.message", "event_id": "$1", "sender": "@alice:example.org",
                      "content": { "msgtype": "m.text", "body": "hello mesh" } },
                    { "type": "m.room.message", "event_id": "$2", "sender": "@bot:example.org",
                      "content": { "msgtype": "m.text", "body": "[Bob/Mesh]: hi" } },
                    { "type": "m.room.member", "event_id": "$3", "sender": "@carol:example.org",
                      "content": { "membership": "join" } },
                    { "type": "m.room.message", "event_id": "$4", "sender": "@other:bridge.org",
                      "content": { "msgtype": "m.text", "body": "[Dan/Far]: yo",
                                   "meshtastic_meshnet": "Far" } }
                ]}},
                "!elsewhere:example.org": { "timeline": { "events": [
                    { "type": "m.room.message", "event_id": "$5", "sender": "@eve:example.org",
                      "content": { "msgtype": "m.text", "body": "not bridged" } }
                ]}}
            }}
        }))
        .unwrap()
    }

    #[test]
    fn extracts_text_messages_from_bridged_rooms() {
        let events = chat_events(
            &sync_fixture(),
            "@bot:example.org",
            &["!ops:example.org".to_string()],
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sender_display, "alice");
        assert_eq!(events[0].body, "hello mesh");
        assert_eq!(events[0].meshnet, None);
        assert_eq!(events[1].meshnet.as_deref(), Some("Far"));
    }

    #[test]
    fn html_messages_carry_both_renderings() {
        let content = html_content("|a|", "<table><tr><td>a</td></tr></table>");
        assert_eq!(content["format"], "org.matrix.custom.html");
        assert_eq!(content["body"], "|a|");
        assert_eq!(
            content["formatted_body"],
            "<table><tr><td>a</td></tr></table>"
        );
    }

    #[test]
    fn display_name_is_localpart() {
        assert_eq!(display_name("@alice:example.org"), "alice");
        assert_eq!(display_name("bare"), "bare");
    }

    #[test]
    fn urls_use_v3_client_api() {
        let client = MatrixClient::new(&MatrixConfig {
            homeserver: "https://matrix.example.org/".into(),
            access_token: "t".into(),
            bot_user_id: "@bot:example.org".into(),
        })
        .unwrap();
        assert_eq!(
            client.url("/join/x"),
            "https://matrix.example.org/_matrix/client/v3/join/x"
        );
    }
}
