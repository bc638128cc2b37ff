//! # Relay Core
//!
//! The [`Dispatcher`] turns mesh packets into chat messages and chat messages into mesh
//! broadcasts. Per packet it classifies, routes through the [`ChannelRouter`], offers the event
//! to the [`PluginChain`] and, when nobody claims it, hands it to the [`RelayQueue`].
//!
//! The collaborators it needs from the outside world are the traits declared here:
//! [`ChatRelay`] (the chat network), [`NameResolver`] (node names) and [`MeshSender`] (the
//! radio, implemented by the connection manager).

pub mod plugins;
pub mod queue;
pub mod router;

pub use plugins::{matches_command, Plugin, PluginChain, RoomContext};
pub use queue::{RelayQueue, RelayRequest};
pub use router::{ChannelRouter, RoomMapping};

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};

use crate::error::RelayError;
use crate::logutil::{escape_log, truncate_utf8};
use crate::meshtastic::{InboundPacket, PortType, MAX_TEXT_BYTES};
use crate::metrics;

/// Outbound side of the chat network.
#[async_trait]
pub trait ChatRelay: Send + Sync {
    /// Post a relayed mesh message, tagged with its origin.
    async fn relay(
        &self,
        room_id: &str,
        text: &str,
        display_name: &str,
        short_name: &str,
        meshnet_name: &str,
    ) -> Result<(), RelayError>;

    /// Post a plain bot message (plugin replies).
    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), RelayError>;

    /// Post a bot message with an HTML rendering; `body` is the plain-text fallback.
    async fn send_html(&self, room_id: &str, body: &str, html: &str) -> Result<(), RelayError>;
}

pub trait NameResolver: Send + Sync {
    fn long_name(&self, sender_id: &str) -> Option<String>;
    fn short_name(&self, sender_id: &str) -> Option<String>;
}

#[async_trait]
pub trait MeshSender: Send + Sync {
    async fn send_text(&self, channel: u8, text: &str) -> Result<(), RelayError>;
}

/// A text message observed in a bridged chat room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    pub sender_display: String,
    pub body: String,
    /// Set when the message is itself a relay from some meshnet.
    pub meshnet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NonText { claimed: bool },
    Unclassifiable,
    Unmapped { channel: u8 },
    Claimed { channel: u8 },
    Relayed { channel: u8, rooms: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatOutcome {
    Ignored,
    Unmapped,
    Claimed,
    NotConnected,
    Relayed { channels: Vec<u8> },
}

pub struct Dispatcher {
    router: Arc<ChannelRouter>,
    plugins: PluginChain,
    names: Arc<dyn NameResolver>,
    relay: RelayQueue,
    mesh: Arc<dyn MeshSender>,
    meshnet_name: String,
}

impl Dispatcher {
    pub fn new(
        router: Arc<ChannelRouter>,
        plugins: PluginChain,
        names: Arc<dyn NameResolver>,
        relay: RelayQueue,
        mesh: Arc<dyn MeshSender>,
        meshnet_name: impl Into<String>,
    ) -> Self {
        Self {
            router,
            plugins,
            names,
            relay,
            mesh,
            meshnet_name: meshnet_name.into(),
        }
    }

    pub fn meshnet_name(&self) -> &str {
        &self.meshnet_name
    }

    /// Handle one packet from the radio.
    pub async fn on_inbound_packet(&self, packet: InboundPacket) -> DispatchOutcome {
        metrics::inc_packets_received();

        let Some(text) = packet.text_body() else {
            metrics::inc_packets_non_text();
            let claimed = self.plugins.dispatch_mesh(&packet, None, None, None).await;
            trace!(
                "{} packet from {} offered to plugins (claimed: {})",
                packet.port.as_str(),
                packet.sender_id,
                claimed
            );
            return DispatchOutcome::NonText { claimed };
        };

        let channel = match packet.channel {
            Some(channel) => channel,
            None if packet.port == PortType::TextMessage => 0,
            None => {
                debug!(
                    "Discarding {} packet from {} without a channel",
                    packet.port.as_str(),
                    packet.sender_id
                );
                return DispatchOutcome::Unclassifiable;
            }
        };

        if !self.router.is_mapped(channel) {
            debug!(
                "Skipping message from unmapped channel {} (sender {})",
                channel, packet.sender_id
            );
            metrics::inc_packets_unmapped();
            return DispatchOutcome::Unmapped { channel };
        }
        let rooms = self.router.rooms_for(channel);

        let display_name = self
            .names
            .long_name(&packet.sender_id)
            .unwrap_or_else(|| packet.sender_id.clone());
        let short_name = self
            .names
            .short_name(&packet.sender_id)
            .unwrap_or_else(|| packet.sender_id.clone());
        let formatted = format!("[{}/{}]: {}", display_name, self.meshnet_name, text);

        info!(
            "Processing inbound radio message from {} on channel {}",
            packet.sender_id, channel
        );
        debug!("{}", escape_log(&formatted));

        if self
            .plugins
            .dispatch_mesh(
                &packet,
                Some(&formatted),
                Some(&display_name),
                Some(&self.meshnet_name),
            )
            .await
        {
            metrics::inc_packets_claimed();
            return DispatchOutcome::Claimed { channel };
        }

        let rooms: Vec<String> = rooms.into_iter().map(str::to_string).collect();
        for room_id in &rooms {
            self.relay.submit(RelayRequest {
                room_id: room_id.clone(),
                text: formatted.clone(),
                display_name: display_name.clone(),
                short_name: short_name.clone(),
                meshnet_name: self.meshnet_name.clone(),
            });
        }
        metrics::inc_packets_relayed();
        DispatchOutcome::Relayed { channel, rooms }
    }

    /// Handle one chat message from a bridged room.
    pub async fn on_chat_message(&self, event: ChatEvent) -> ChatOutcome {
        if event.meshnet.as_deref() == Some(self.meshnet_name.as_str()) {
            trace!("ignoring our own relay {} in {}", event.event_id, event.room_id);
            return ChatOutcome::Ignored;
        }

        let channels = self.router.channels_for(&event.room_id);
        if channels.is_empty() {
            debug!("Message in unmapped room {} ignored", event.room_id);
            return ChatOutcome::Unmapped;
        }

        let full_text = format!("{}: {}", event.sender_display, event.body);
        let room = RoomContext {
            room_id: event.room_id.clone(),
            channels: channels.clone(),
        };
        if self.plugins.dispatch_chat(&room, &event, &full_text).await {
            return ChatOutcome::Claimed;
        }

        let outbound = format!("{}[M]: {}", event.sender_display, event.body);
        let outbound = truncate_utf8(&outbound, MAX_TEXT_BYTES);
        info!(
            "Sending message from {} in {} to mesh channels {:?}",
            event.sender, event.room_id, channels
        );

        let mut sent = Vec::with_capacity(channels.len());
        for channel in channels {
            match self.mesh.send_text(channel, outbound).await {
                Ok(()) => {
                    metrics::inc_chat_to_mesh();
                    sent.push(channel);
                }
                Err(RelayError::NotConnected) => {
                    warn!(
                        "Not connected to the mesh; dropping message {} from {}",
                        event.event_id, event.room_id
                    );
                    return ChatOutcome::NotConnected;
                }
                Err(e) => error!("Error sending to mesh channel {}: {}", channel, e),
            }
        }
        ChatOutcome::Relayed { channels: sent }
    }

    /// Stop accepting work and flush queued relays.
    pub async fn shutdown(self) {
        self.relay.shutdown().await;
    }
}
