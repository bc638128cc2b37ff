//! # Meshtastic Side of the Relay
//!
//! Everything that touches the mesh radio lives here: the typed connection settings, the
//! packet model handed to the dispatcher, the transport traits, the stream transport for
//! serial and TCP links, the Bluetooth transport (`ble` feature), the node directory, and the
//! [`ConnectionManager`] that keeps one transport alive.
//!
//! ## Connection lifecycle
//!
//! ```text
//!  Disconnected ──connect()──▶ Connecting ──ok──▶ Connected
//!        ▲                         │                  │ lost / probe failed
//!        └──────exhausted──────────┘                  ▼
//!                                   Connected ◀──ok── Reconnecting (10s, 20s, … 300s)
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [meshtastic]
//! connection_type = "tcp"   # serial | ble | tcp
//! host = "meshtastic.local"
//! retry_limit = 3
//! meshnet_name = "Downtown Mesh"
//! ```

pub mod backoff;
#[cfg(feature = "ble")]
pub mod ble;
pub mod connection;
pub mod framer;
pub mod nodes;
pub mod stream;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use connection::{ConnectionManager, ConnectionState, ConnectionTuning};
pub use nodes::{NodeDirectory, NodeEntry};
pub use stream::StreamTransportFactory;
pub use transport::{EventSink, TransportError, TransportFactory, TransportHandle};

use crate::protobuf::meshtastic::PortNum;
use serde::{Deserialize, Serialize};

/// Meshtastic broadcast destination.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Largest text payload a single mesh packet carries.
pub const MAX_TEXT_BYTES: usize = 227;

/// Physical link kind to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Ble,
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Ble => write!(f, "ble"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Where to reach the radio. One variant per [`TransportKind`], so exactly one target is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTarget {
    Serial { port: String, baud_rate: u32 },
    /// BLE MAC address or advertised device name.
    Ble { address: String },
    /// `host` or `host:port`; the port defaults to 4403.
    Tcp { host: String },
}

impl TransportTarget {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportTarget::Serial { .. } => TransportKind::Serial,
            TransportTarget::Ble { .. } => TransportKind::Ble,
            TransportTarget::Tcp { .. } => TransportKind::Tcp,
        }
    }

    fn endpoint(&self) -> &str {
        match self {
            TransportTarget::Serial { port, .. } => port,
            TransportTarget::Ble { address } => address,
            TransportTarget::Tcp { host } => host,
        }
    }
}

impl std::fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.endpoint())
    }
}

/// Immutable connection settings for one radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub target: TransportTarget,
    pub retry_limit: u32,
    pub meshnet_name: String,
}

impl ConnectionConfig {
    pub const DEFAULT_RETRY_LIMIT: u32 = 3;

    pub fn transport_kind(&self) -> TransportKind {
        self.target.kind()
    }

    /// Reject targets that can never connect. Callers must not retry on error.
    pub fn validate(&self) -> Result<(), String> {
        if self.target.endpoint().trim().is_empty() {
            return Err(format!(
                "no {} target configured for the mesh connection",
                self.transport_kind()
            ));
        }
        Ok(())
    }

    /// Number of open attempts per `connect()`; zero is treated as one.
    pub fn effective_retry_limit(&self) -> u32 {
        self.retry_limit.max(1)
    }
}

/// Application port a packet arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    TextMessage,
    NodeInfo,
    Position,
    Telemetry,
    Routing,
    Admin,
    Other(i32),
}

impl PortType {
    pub fn from_wire(portnum: i32) -> Self {
        match PortNum::try_from(portnum) {
            Ok(PortNum::TextMessageApp) => PortType::TextMessage,
            Ok(PortNum::NodeinfoApp) => PortType::NodeInfo,
            Ok(PortNum::PositionApp) => PortType::Position,
            Ok(PortNum::TelemetryApp) => PortType::Telemetry,
            Ok(PortNum::RoutingApp) => PortType::Routing,
            Ok(PortNum::AdminApp) => PortType::Admin,
            _ => PortType::Other(portnum),
        }
    }

    /// Upstream enum name, e.g. `TEXT_MESSAGE_APP`.
    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::TextMessage => "TEXT_MESSAGE_APP",
            PortType::NodeInfo => "NODEINFO_APP",
            PortType::Position => "POSITION_APP",
            PortType::Telemetry => "TELEMETRY_APP",
            PortType::Routing => "ROUTING_APP",
            PortType::Admin => "ADMIN_APP",
            PortType::Other(_) => "UNKNOWN_APP",
        }
    }
}

/// One packet received from the mesh, as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPacket {
    /// Sender node id in `!xxxxxxxx` form.
    pub sender_id: String,
    /// Channel index; `None` when the radio elided it (index 0).
    pub channel: Option<u8>,
    pub port: PortType,
    pub text: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundPacket {
    /// Text message convenience constructor.
    pub fn text(sender_id: impl Into<String>, channel: Option<u8>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            sender_id: sender_id.into(),
            channel,
            port: PortType::TextMessage,
            payload: text.as_bytes().to_vec(),
            text: Some(text),
        }
    }

    /// Text that is present and non-empty.
    pub fn text_body(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }
}

/// Identity of the locally attached radio, logged after connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub node_num: u32,
    pub long_name: String,
    pub short_name: String,
    pub hw_model: i32,
}

impl std::fmt::Display for NodeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} ({}, hw model {})",
            self.short_name,
            self.long_name,
            format_node_id(self.node_num),
            self.hw_model
        )
    }
}

/// `0x1234abcd` → `!1234abcd`
pub fn format_node_id(num: u32) -> String {
    format!("!{:08x}", num)
}

/// Inverse of [`format_node_id`]; the `!` prefix is optional.
pub fn parse_node_id(id: &str) -> Option<u32> {
    let hex = id.strip_prefix('!').unwrap_or(id);
    if hex.is_empty() || hex.len() > 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_round_trip_through_bang_form() {
        assert_eq!(format_node_id(0xaaaa), "!0000aaaa");
        assert_eq!(parse_node_id("!0000aaaa"), Some(0xaaaa));
        assert_eq!(parse_node_id("!aaaa"), Some(0xaaaa));
        assert_eq!(parse_node_id("!"), None);
        assert_eq!(parse_node_id("!zz"), None);
    }

    #[test]
    fn empty_target_is_a_config_error() {
        let cfg = ConnectionConfig {
            target: TransportTarget::Ble {
                address: "  ".to_string(),
            },
            retry_limit: 0,
            meshnet_name: "Mesh".to_string(),
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("ble"), "{err}");
        assert_eq!(cfg.effective_retry_limit(), 1);
    }

    #[test]
    fn port_types_map_from_wire_values() {
        assert_eq!(PortType::from_wire(1), PortType::TextMessage);
        assert_eq!(PortType::from_wire(4), PortType::NodeInfo);
        assert_eq!(PortType::from_wire(4242), PortType::Other(4242));
        assert_eq!(PortType::TextMessage.as_str(), "TEXT_MESSAGE_APP");
    }

    #[test]
    fn empty_text_counts_as_absent() {
        let mut packet = InboundPacket::text("!0000aaaa", None, "");
        assert_eq!(packet.text_body(), None);
        packet.text = Some("hi".into());
        assert_eq!(packet.text_body(), Some("hi"));
    }
}
