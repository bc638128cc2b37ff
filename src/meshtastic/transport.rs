//! Transport seam between the connection manager and a physical radio link.
//!
//! A [`TransportFactory`] opens one [`TransportHandle`] per connect attempt and hands the link
//! an [`EventSink`]. The sink is the only way a link talks back: inbound packets go into the
//! bounded dispatch queue, and a lost link is reported to the connection supervisor tagged
//! with the generation of the handle that died, so late reports from a replaced handle are
//! ignored.

use std::sync::Arc;

use async_trait::async_trait;
use log::{trace, warn};
use thiserror::Error;
use tokio::sync::mpsc;

use super::{ConnectionConfig, InboundPacket, NodeSummary};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The link can never be opened with this configuration.
    #[error("transport configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The handle was closed or its reader has exited.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn is_config(&self) -> bool {
        matches!(self, TransportError::Config(_))
    }
}

/// One open link to the radio.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Human readable endpoint, e.g. `tcp:meshtastic.local`.
    fn describe(&self) -> String;

    /// Identity of the attached node once the radio has reported it.
    fn node_summary(&self) -> Option<NodeSummary>;

    /// Lightweight liveness check. Any error means the link is gone.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Broadcast a text message on a channel index.
    async fn send_text(&self, channel: u8, text: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Opens transport handles for a [`ConnectionConfig`].
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError>;
}

/// Callback side of a transport: where packets and loss notifications go.
#[derive(Debug, Clone)]
pub struct EventSink {
    packets: mpsc::Sender<InboundPacket>,
    lost: mpsc::UnboundedSender<u64>,
    generation: u64,
}

impl EventSink {
    pub fn new(
        packets: mpsc::Sender<InboundPacket>,
        lost: mpsc::UnboundedSender<u64>,
        generation: u64,
    ) -> Self {
        Self {
            packets,
            lost,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a packet from an async reader. Waits while the dispatch queue is full.
    /// Returns false once the dispatcher has gone away.
    pub async fn packet(&self, packet: InboundPacket) -> bool {
        trace!("queueing packet from {} (gen {})", packet.sender_id, self.generation);
        self.packets.send(packet).await.is_ok()
    }

    /// Queue a packet from a blocking listener thread. Must not be called from async context.
    pub fn packet_blocking(&self, packet: InboundPacket) -> bool {
        self.packets.blocking_send(packet).is_ok()
    }

    /// Report that this link is gone.
    pub fn lost(&self) {
        if self.lost.send(self.generation).is_err() {
            warn!(
                "connection supervisor is gone; dropping loss report for generation {}",
                self.generation
            );
        }
    }
}
