use serde::{Deserialize, Serialize};

/// One mesh channel ↔ chat room pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomMapping {
    pub mesh_channel: u8,
    pub room_id: String,
}

impl RoomMapping {
    pub fn new(mesh_channel: u8, room_id: impl Into<String>) -> Self {
        Self {
            mesh_channel,
            room_id: room_id.into(),
        }
    }
}

/// Static channel/room table. Many-to-many: one channel may feed several rooms and one room
/// may be bridged to several channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelRouter {
    mappings: Vec<RoomMapping>,
}

impl ChannelRouter {
    /// Build the table; exact duplicate entries are collapsed.
    pub fn new(mappings: impl IntoIterator<Item = RoomMapping>) -> Self {
        let mut unique: Vec<RoomMapping> = Vec::new();
        for mapping in mappings {
            if !unique.contains(&mapping) {
                unique.push(mapping);
            }
        }
        Self { mappings: unique }
    }

    pub fn rooms_for(&self, channel: u8) -> Vec<&str> {
        self.mappings
            .iter()
            .filter(|m| m.mesh_channel == channel)
            .map(|m| m.room_id.as_str())
            .collect()
    }

    pub fn channels_for(&self, room_id: &str) -> Vec<u8> {
        self.mappings
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.mesh_channel)
            .collect()
    }

    pub fn is_mapped(&self, channel: u8) -> bool {
        self.mappings.iter().any(|m| m.mesh_channel == channel)
    }

    /// Every distinct room, in table order.
    pub fn rooms(&self) -> Vec<&str> {
        let mut rooms: Vec<&str> = Vec::new();
        for m in &self.mappings {
            if !rooms.contains(&m.room_id.as_str()) {
                rooms.push(&m.room_id);
            }
        }
        rooms
    }

    pub fn mappings(&self) -> &[RoomMapping] {
        &self.mappings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> ChannelRouter {
        ChannelRouter::new([
            RoomMapping::new(0, "!general:example"),
            RoomMapping::new(2, "!ops:example"),
            RoomMapping::new(2, "!archive:example"),
            RoomMapping::new(3, "!ops:example"),
            RoomMapping::new(2, "!ops:example"),
        ])
    }

    #[test]
    fn channel_fans_out_to_every_room_once() {
        let r = router();
        assert_eq!(r.rooms_for(2), vec!["!ops:example", "!archive:example"]);
        assert!(r.rooms_for(5).is_empty());
        assert!(!r.is_mapped(5));
    }

    #[test]
    fn room_lookup_is_reverse_of_channel_lookup() {
        let r = router();
        assert_eq!(r.channels_for("!ops:example"), vec![2, 3]);
        assert!(r.channels_for("!nope:example").is_empty());
        assert_eq!(
            r.rooms(),
            vec!["!general:example", "!ops:example", "!archive:example"]
        );
    }
}
