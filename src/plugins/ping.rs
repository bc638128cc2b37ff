use std::sync::Arc;

use async_trait::async_trait;

use crate::meshtastic::InboundPacket;
use crate::relay::{matches_command, ChatEvent, ChatRelay, Plugin, RoomContext};

/// `!ping` in a bridged room answers `pong!`.
pub struct PingPlugin {
    chat: Arc<dyn ChatRelay>,
}

impl PingPlugin {
    pub fn new(chat: Arc<dyn ChatRelay>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn handle_mesh_message(
        &self,
        _packet: &InboundPacket,
        _formatted: Option<&str>,
        _display_name: Option<&str>,
        _meshnet_name: Option<&str>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn handle_chat_message(
        &self,
        room: &RoomContext,
        _event: &ChatEvent,
        full_text: &str,
    ) -> anyhow::Result<bool> {
        if !matches_command(full_text.trim(), "ping") {
            return Ok(false);
        }
        self.chat.send_text(&room.room_id, "pong!").await?;
        Ok(true)
    }
}
