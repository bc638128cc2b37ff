//! Process-wide relay counters.
//!
//! Plain atomics bumped from the dispatch loop, the relay lanes and the connection manager.
//! The bridge logs a [`snapshot`] periodically.
use std::sync::atomic::{AtomicU64, Ordering};

static PACKETS_RECEIVED: AtomicU64 = AtomicU64::new(0);
static PACKETS_RELAYED: AtomicU64 = AtomicU64::new(0);
static PACKETS_CLAIMED: AtomicU64 = AtomicU64::new(0);
static PACKETS_UNMAPPED: AtomicU64 = AtomicU64::new(0);
static PACKETS_NON_TEXT: AtomicU64 = AtomicU64::new(0);
static PLUGIN_ERRORS: AtomicU64 = AtomicU64::new(0);
static RELAY_DROPS: AtomicU64 = AtomicU64::new(0);
static CONNECTION_LOSSES: AtomicU64 = AtomicU64::new(0);
static RECONNECTS: AtomicU64 = AtomicU64::new(0);
static CHAT_TO_MESH: AtomicU64 = AtomicU64::new(0);

pub fn inc_packets_received() {
    PACKETS_RECEIVED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_relayed() {
    PACKETS_RELAYED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_claimed() {
    PACKETS_CLAIMED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_unmapped() {
    PACKETS_UNMAPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_non_text() {
    PACKETS_NON_TEXT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_plugin_errors() {
    PLUGIN_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_relay_drops() {
    RELAY_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connection_losses() {
    CONNECTION_LOSSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects() {
    RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_chat_to_mesh() {
    CHAT_TO_MESH.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayCounters {
    pub packets_received: u64,
    pub packets_relayed: u64,
    pub packets_claimed: u64,
    pub packets_unmapped: u64,
    pub packets_non_text: u64,
    pub plugin_errors: u64,
    pub relay_drops: u64,
    pub connection_losses: u64,
    pub reconnects: u64,
    pub chat_to_mesh: u64,
}

pub fn snapshot() -> RelayCounters {
    RelayCounters {
        packets_received: PACKETS_RECEIVED.load(Ordering::Relaxed),
        packets_relayed: PACKETS_RELAYED.load(Ordering::Relaxed),
        packets_claimed: PACKETS_CLAIMED.load(Ordering::Relaxed),
        packets_unmapped: PACKETS_UNMAPPED.load(Ordering::Relaxed),
        packets_non_text: PACKETS_NON_TEXT.load(Ordering::Relaxed),
        plugin_errors: PLUGIN_ERRORS.load(Ordering::Relaxed),
        relay_drops: RELAY_DROPS.load(Ordering::Relaxed),
        connection_losses: CONNECTION_LOSSES.load(Ordering::Relaxed),
        reconnects: RECONNECTS.load(Ordering::Relaxed),
        chat_to_mesh: CHAT_TO_MESH.load(Ordering::Relaxed),
    }
}

impl std::fmt::Display for RelayCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} relayed={} claimed={} unmapped={} non_text={} plugin_errors={} relay_drops={} losses={} reconnects={} chat_to_mesh={}",
            self.packets_received,
            self.packets_relayed,
            self.packets_claimed,
            self.packets_unmapped,
            self.packets_non_text,
            self.plugin_errors,
            self.relay_drops,
            self.connection_losses,
            self.reconnects,
            self.chat_to_mesh
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_packets_received();
        inc_relay_drops();
        let after = snapshot();
        assert!(after.packets_received > before.packets_received);
        assert!(after.relay_drops > before.relay_drops);
        assert!(after.to_string().contains("received="));
    }
}
