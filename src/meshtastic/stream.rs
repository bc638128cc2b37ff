//! Stream API transports: USB serial and TCP (port 4403).
//!
//! Both speak the same framed protobuf protocol, so they share the decoder in [`RadioState`]
//! and differ only in how bytes are read and written. Serial I/O is blocking and runs on the
//! blocking pool; TCP uses tokio sockets. Bluetooth links reuse [`RadioState`] without the
//! stream framing (see the `ble` module).

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, info, trace, warn};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::framer::{encode_frame, StreamFramer};
use super::nodes::NodeDirectory;
use super::transport::{EventSink, TransportError, TransportFactory, TransportHandle};
use super::{
    format_node_id, ConnectionConfig, InboundPacket, NodeSummary, PortType, TransportTarget,
    BROADCAST_ADDR, MAX_TEXT_BYTES,
};
use crate::logutil::truncate_utf8;
use crate::protobuf::meshtastic::{
    from_radio, mesh_packet, to_radio, Data, FromRadio, Heartbeat, MeshPacket, PortNum, Telemetry,
    ToRadio, User,
};

pub const DEFAULT_TCP_PORT: u16 = 4403;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `open` waits for the radio to report its identity before carrying on without it.
pub(super) const HANDSHAKE_WAIT: Duration = Duration::from_secs(5);
const HOP_LIMIT: u32 = 3;

/// Opens the link named by the configured target: serial, TCP, or Bluetooth when built with
/// the `ble` feature.
pub struct StreamTransportFactory {
    nodes: Arc<NodeDirectory>,
}

impl StreamTransportFactory {
    pub fn new(nodes: Arc<NodeDirectory>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl TransportFactory for StreamTransportFactory {
    async fn open(
        &self,
        config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        let radio = Arc::new(RadioState::new(Arc::clone(&self.nodes)));
        let handle = match &config.target {
            TransportTarget::Tcp { host } => open_tcp(host, radio, sink).await?,
            TransportTarget::Serial { port, baud_rate } => {
                open_serial(port, *baud_rate, radio, sink).await?
            }
            TransportTarget::Ble { address } => return open_ble(address, radio, sink).await,
        };
        handle.handshake().await?;
        Ok(handle as Arc<dyn TransportHandle>)
    }
}

#[cfg(feature = "ble")]
async fn open_ble(
    target: &str,
    radio: Arc<RadioState>,
    sink: EventSink,
) -> Result<Arc<dyn TransportHandle>, TransportError> {
    let handle = super::ble::open(target, radio, sink).await?;
    handle.handshake().await?;
    Ok(handle as Arc<dyn TransportHandle>)
}

#[cfg(not(feature = "ble"))]
async fn open_ble(
    target: &str,
    _radio: Arc<RadioState>,
    _sink: EventSink,
) -> Result<Arc<dyn TransportHandle>, TransportError> {
    Err(TransportError::Config(format!(
        "bluetooth support is not compiled in (target {}); rebuild with the `ble` feature",
        target
    )))
}

/// Decoder state shared by a link's reader and its handle.
pub struct RadioState {
    nodes: Arc<NodeDirectory>,
    my_node: AtomicU32,
    my_hw_model: AtomicI32,
    pub(super) alive: AtomicBool,
    pub(super) closed: AtomicBool,
    pub(super) identified: Notify,
}

impl RadioState {
    pub fn new(nodes: Arc<NodeDirectory>) -> Self {
        Self {
            nodes,
            my_node: AtomicU32::new(0),
            my_hw_model: AtomicI32::new(0),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            identified: Notify::new(),
        }
    }

    pub(super) fn node_summary(&self) -> Option<NodeSummary> {
        let num = self.my_node.load(Ordering::Acquire);
        if num == 0 {
            return None;
        }
        let known = self.nodes.get(num);
        Some(NodeSummary {
            node_num: num,
            long_name: known.as_ref().map(|n| n.long_name.clone()).unwrap_or_default(),
            short_name: known.map(|n| n.short_name).unwrap_or_default(),
            hw_model: self.my_hw_model.load(Ordering::Acquire),
        })
    }

    /// Decode one frame payload. Node database traffic updates the directory; mesh packets
    /// come back as [`InboundPacket`]s.
    pub fn handle_frame(&self, frame: &[u8]) -> Option<InboundPacket> {
        let msg = match FromRadio::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("undecodable frame ({} bytes): {}", frame.len(), e);
                return None;
            }
        };
        match msg.payload_variant? {
            from_radio::PayloadVariant::MyInfo(info) => {
                debug!("radio node is {}", format_node_id(info.my_node_num));
                self.my_node.store(info.my_node_num, Ordering::Release);
                self.identified.notify_one();
                None
            }
            from_radio::PayloadVariant::NodeInfo(info) => {
                if let Some(user) = info.user {
                    self.nodes.update(info.num, &user.long_name, &user.short_name);
                    self.nodes.set_hardware(info.num, user.hw_model);
                    if info.num == self.my_node.load(Ordering::Acquire) {
                        self.my_hw_model.store(user.hw_model, Ordering::Release);
                    }
                }
                let snr = Some(info.snr).filter(|s| *s != 0.0);
                // last_heard is 0 for nodes the radio only knows from its database.
                let heard = Some(info.last_heard)
                    .filter(|t| *t != 0)
                    .and_then(|t| Utc.timestamp_opt(t as i64, 0).single());
                self.nodes.observe(info.num, snr, heard);
                if let Some(metrics) = info.device_metrics {
                    self.nodes
                        .record_power(info.num, metrics.battery_level, metrics.voltage);
                }
                None
            }
            from_radio::PayloadVariant::ConfigCompleteId(id) => {
                debug!("radio config complete (id {})", id);
                self.identified.notify_one();
                None
            }
            from_radio::PayloadVariant::Rebooted(_) => {
                warn!("radio reported a reboot");
                None
            }
            from_radio::PayloadVariant::Packet(pkt) => self.inbound(pkt),
        }
    }

    fn inbound(&self, pkt: MeshPacket) -> Option<InboundPacket> {
        let data = match pkt.payload_variant {
            Some(mesh_packet::PayloadVariant::Decoded(data)) => data,
            Some(mesh_packet::PayloadVariant::Encrypted(_)) => {
                trace!("skipping encrypted packet from {}", format_node_id(pkt.from));
                return None;
            }
            None => return None,
        };
        let port = PortType::from_wire(data.portnum);

        match port {
            PortType::NodeInfo => {
                if let Ok(user) = User::decode(data.payload.as_slice()) {
                    self.nodes.update(pkt.from, &user.long_name, &user.short_name);
                    self.nodes.set_hardware(pkt.from, user.hw_model);
                }
            }
            PortType::Telemetry => {
                if let Some(metrics) = Telemetry::decode(data.payload.as_slice())
                    .ok()
                    .and_then(|t| t.device_metrics)
                {
                    self.nodes
                        .record_power(pkt.from, metrics.battery_level, metrics.voltage);
                }
            }
            _ => {}
        }
        let snr = Some(pkt.rx_snr).filter(|s| *s != 0.0);
        self.nodes.observe(pkt.from, snr, Some(Utc::now()));

        let text = (port == PortType::TextMessage)
            .then(|| String::from_utf8_lossy(&data.payload).into_owned());
        Some(InboundPacket {
            sender_id: format_node_id(pkt.from),
            channel: u8::try_from(pkt.channel).ok().filter(|c| *c != 0),
            port,
            text,
            payload: data.payload,
        })
    }
}

enum FrameWriter {
    Tcp(AsyncMutex<OwnedWriteHalf>),
    #[cfg(feature = "serial")]
    Serial(Arc<Mutex<Box<dyn serialport::SerialPort>>>),
}

impl FrameWriter {
    async fn write(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self {
            FrameWriter::Tcp(stream) => {
                let mut stream = stream.lock().await;
                stream.write_all(&frame).await?;
                stream.flush().await?;
                Ok(())
            }
            #[cfg(feature = "serial")]
            FrameWriter::Serial(port) => {
                let port = Arc::clone(port);
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    use std::io::Write;
                    let mut guard = port.lock().unwrap_or_else(|p| p.into_inner());
                    guard.write_all(&frame)?;
                    guard.flush()
                })
                .await
                .map_err(|e| TransportError::Protocol(format!("serial writer task failed: {}", e)))??;
                Ok(())
            }
        }
    }
}

/// A live serial or TCP link.
pub struct StreamHandle {
    describe: String,
    writer: FrameWriter,
    radio: Arc<RadioState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU32,
}

impl StreamHandle {
    fn new(describe: String, writer: FrameWriter, radio: Arc<RadioState>) -> Self {
        let seed = Utc::now().timestamp_subsec_nanos() | 1;
        Self {
            describe,
            writer,
            radio,
            reader: Mutex::new(None),
            next_id: AtomicU32::new(seed),
        }
    }

    fn set_reader(&self, reader: JoinHandle<()>) {
        *self.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(reader);
    }

    async fn send_to_radio(&self, msg: ToRadio) -> Result<(), TransportError> {
        if self.radio.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.writer.write(encode_frame(&msg.encode_to_vec())).await
    }

    /// Ask for the node database and wait briefly for the radio to identify itself.
    async fn handshake(&self) -> Result<(), TransportError> {
        let nonce = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send_to_radio(ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::WantConfigId(nonce)),
        })
        .await?;
        let waited = timeout(HANDSHAKE_WAIT, self.radio.identified.notified()).await;
        if !self.radio.alive.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if waited.is_err() {
            warn!(
                "{} did not report its identity within {:?}",
                self.describe, HANDSHAKE_WAIT
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TransportHandle for StreamHandle {
    fn describe(&self) -> String {
        self.describe.clone()
    }

    fn node_summary(&self) -> Option<NodeSummary> {
        self.radio.node_summary()
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if !self.radio.alive.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let nonce = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send_to_radio(ToRadio {
            payload_variant: Some(to_radio::PayloadVariant::Heartbeat(Heartbeat { nonce })),
        })
        .await
    }

    async fn send_text(&self, channel: u8, text: &str) -> Result<(), TransportError> {
        let body = truncate_utf8(text, MAX_TEXT_BYTES);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send_to_radio(text_to_radio(channel, id, body)).await?;
        debug!(
            "sent text on channel {} via {} (id 0x{:08x}, {} bytes)",
            channel,
            self.describe,
            id,
            body.len()
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.radio.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = self
            .send_to_radio(ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
            })
            .await;
        self.radio.closed.store(true, Ordering::Release);
        self.radio.alive.store(false, Ordering::Release);
        if let Some(reader) = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }
        debug!("closed {}", self.describe);
        // The radio may already be gone; that is not worth surfacing.
        if let Err(e) = result {
            trace!("disconnect notice to {} failed: {}", self.describe, e);
        }
        Ok(())
    }
}

/// Broadcast text packet on `channel`; `body` must already fit one packet.
pub(super) fn text_to_radio(channel: u8, id: u32, body: &str) -> ToRadio {
    let packet = MeshPacket {
        to: BROADCAST_ADDR,
        channel: channel as u32,
        id,
        hop_limit: HOP_LIMIT,
        payload_variant: Some(mesh_packet::PayloadVariant::Decoded(Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: body.as_bytes().to_vec(),
            ..Default::default()
        })),
        ..Default::default()
    };
    ToRadio {
        payload_variant: Some(to_radio::PayloadVariant::Packet(packet)),
    }
}

fn tcp_address(host: &str) -> String {
    if host.starts_with('[') || host.matches(':').count() == 1 {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_TCP_PORT)
    }
}

async fn open_tcp(
    host: &str,
    radio: Arc<RadioState>,
    sink: EventSink,
) -> Result<Arc<StreamHandle>, TransportError> {
    let addr = tcp_address(host);
    debug!("opening tcp link to {}", addr);
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect to {} timed out", addr),
            )
        })??;
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();

    let handle = Arc::new(StreamHandle::new(
        format!("tcp:{}", addr),
        FrameWriter::Tcp(AsyncMutex::new(write)),
        Arc::clone(&radio),
    ));
    handle.set_reader(tokio::spawn(tcp_reader(read, radio, sink)));
    info!("TCP link to {} open", addr);
    Ok(handle)
}

async fn tcp_reader(mut read: OwnedReadHalf, radio: Arc<RadioState>, sink: EventSink) {
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 1024];
    let reason = loop {
        match read.read(&mut buf).await {
            Ok(0) => break "connection closed by radio".to_string(),
            Ok(n) => {
                framer.push(&buf[..n]);
                while let Some(frame) = framer.next_frame() {
                    if let Some(packet) = radio.handle_frame(&frame) {
                        if !sink.packet(packet).await {
                            debug!("dispatcher gone; stopping tcp reader");
                            radio.alive.store(false, Ordering::Release);
                            return;
                        }
                    }
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    finish_reader(&radio, &sink, &reason);
}

pub(super) fn finish_reader(radio: &RadioState, sink: &EventSink, reason: &str) {
    radio.alive.store(false, Ordering::Release);
    // Wake a handshake still waiting on this link.
    radio.identified.notify_one();
    if !radio.closed.load(Ordering::Acquire) {
        warn!("mesh link reader stopped: {}", reason);
        sink.lost();
    }
}

#[cfg(feature = "serial")]
async fn open_serial(
    port_name: &str,
    baud_rate: u32,
    radio: Arc<RadioState>,
    sink: EventSink,
) -> Result<Arc<StreamHandle>, TransportError> {
    debug!("opening serial port {} at {} baud", port_name, baud_rate);
    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(500));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = tokio::task::spawn_blocking(move || builder.open())
        .await
        .map_err(|e| TransportError::Protocol(format!("serial open task failed: {}", e)))?
        .map_err(|e| TransportError::Io(e.into()))?;

    // Wake the device; some boards reset on DTR.
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let reader = port.try_clone().map_err(|e| TransportError::Io(e.into()))?;
    let handle = Arc::new(StreamHandle::new(
        format!("serial:{}", port_name),
        FrameWriter::Serial(Arc::new(Mutex::new(port))),
        Arc::clone(&radio),
    ));
    handle.set_reader(tokio::task::spawn_blocking(move || {
        serial_reader(reader, radio, sink)
    }));
    info!("Serial port {} open", port_name);
    Ok(handle)
}

#[cfg(not(feature = "serial"))]
async fn open_serial(
    port_name: &str,
    _baud_rate: u32,
    _radio: Arc<RadioState>,
    _sink: EventSink,
) -> Result<Arc<StreamHandle>, TransportError> {
    Err(TransportError::Config(format!(
        "serial support is not compiled in (port {}); rebuild with the `serial` feature",
        port_name
    )))
}

/// Blocking read loop; the port's read timeout bounds how long a close takes to notice.
#[cfg(feature = "serial")]
fn serial_reader(mut port: Box<dyn serialport::SerialPort>, radio: Arc<RadioState>, sink: EventSink) {
    use std::io::Read;

    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 1024];
    let reason = loop {
        if radio.closed.load(Ordering::Acquire) {
            return;
        }
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                framer.push(&buf[..n]);
                while let Some(frame) = framer.next_frame() {
                    if let Some(packet) = radio.handle_frame(&frame) {
                        if !sink.packet_blocking(packet) {
                            radio.alive.store(false, Ordering::Release);
                            return;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => break e.to_string(),
        }
    };
    finish_reader(&radio, &sink, &reason);
}
