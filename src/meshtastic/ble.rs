//! Bluetooth LE link to the radio.
//!
//! The radio exposes one GATT service with three characteristics. `toRadio` takes one
//! `ToRadio` protobuf per write. `fromRadio` yields one `FromRadio` per read and reads empty
//! once the queue is drained. `fromNum` notifies whenever the radio has queued something new.
//! Payloads carry no stream framing, so frames go straight into [`RadioState`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::Utc;
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use prost::Message;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use super::stream::{finish_reader, text_to_radio, RadioState, HANDSHAKE_WAIT};
use super::transport::{EventSink, TransportError, TransportHandle};
use super::{NodeSummary, MAX_TEXT_BYTES};
use crate::logutil::truncate_utf8;
use crate::protobuf::meshtastic::{to_radio, ToRadio};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1b218_15a8_461f_9fa8_5dcae273eafd);
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c76d2_129e_4dad_a1dd_7866124401e7);
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2c55e69e_4993_11ed_b878_0242ac120002);
pub const FROM_NUM_UUID: Uuid = Uuid::from_u128(0xed9da18c_a800_4f66_a670_aa7547e34453);

const SCAN_TIME: Duration = Duration::from_secs(10);
const SCAN_POLL: Duration = Duration::from_millis(500);

fn ble_error(e: btleplug::Error) -> TransportError {
    TransportError::Protocol(format!("bluetooth: {}", e))
}

fn not_found(what: String) -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, what))
}

/// True when a scanned device is the configured radio: a MAC address compared without regard
/// to case, or an exact advertised name.
pub fn matches_target(target: &str, address: &str, name: Option<&str>) -> bool {
    let target = target.trim();
    address.eq_ignore_ascii_case(target) || name == Some(target)
}

/// A live Bluetooth link.
pub struct BleHandle {
    describe: String,
    peripheral: Peripheral,
    to_radio: Characteristic,
    from_num: Characteristic,
    radio: Arc<RadioState>,
    /// Wakes the reader to drain `fromRadio` after a write.
    kick: Arc<Notify>,
    reader: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU32,
}

/// Scan for the radio, connect, and start the reader. The caller runs the handshake.
pub async fn open(
    target: &str,
    radio: Arc<RadioState>,
    sink: EventSink,
) -> Result<Arc<BleHandle>, TransportError> {
    let manager = Manager::new().await.map_err(ble_error)?;
    let adapter = manager
        .adapters()
        .await
        .map_err(ble_error)?
        .into_iter()
        .next()
        .ok_or_else(|| not_found("no bluetooth adapter".to_string()))?;

    adapter
        .start_scan(ScanFilter {
            services: vec![SERVICE_UUID],
        })
        .await
        .map_err(ble_error)?;
    let found = find_radio(&adapter, target).await;
    if let Err(e) = adapter.stop_scan().await {
        trace!("stopping bluetooth scan failed: {}", e);
    }
    let peripheral = found?;

    peripheral.connect().await.map_err(ble_error)?;
    peripheral.discover_services().await.map_err(ble_error)?;
    let characteristics = peripheral.characteristics();
    let pick = |uuid: Uuid| {
        characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| TransportError::Protocol(format!("radio lacks characteristic {}", uuid)))
    };
    let to_radio = pick(TO_RADIO_UUID)?;
    let from_radio = pick(FROM_RADIO_UUID)?;
    let from_num = pick(FROM_NUM_UUID)?;
    peripheral.subscribe(&from_num).await.map_err(ble_error)?;

    let describe = format!("ble:{}", peripheral.address());
    let kick = Arc::new(Notify::new());
    let seed = Utc::now().timestamp_subsec_nanos() | 1;
    let handle = Arc::new(BleHandle {
        describe: describe.clone(),
        peripheral: peripheral.clone(),
        to_radio,
        from_num,
        radio: Arc::clone(&radio),
        kick: Arc::clone(&kick),
        reader: Mutex::new(None),
        next_id: AtomicU32::new(seed),
    });
    let reader = tokio::spawn(ble_reader(peripheral, from_radio, radio, sink, kick));
    *handle.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(reader);
    info!("Bluetooth link to {} open", describe);
    Ok(handle)
}

async fn find_radio(adapter: &Adapter, target: &str) -> Result<Peripheral, TransportError> {
    let deadline = Instant::now() + SCAN_TIME;
    loop {
        for peripheral in adapter.peripherals().await.map_err(ble_error)? {
            let address = peripheral.address().to_string();
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            if matches_target(target, &address, name.as_deref()) {
                debug!("found radio {} ({:?})", address, name);
                return Ok(peripheral);
            }
        }
        if Instant::now() >= deadline {
            return Err(not_found(format!(
                "no bluetooth radio matching {} within {:?}",
                target, SCAN_TIME
            )));
        }
        sleep(SCAN_POLL).await;
    }
}

/// Read `fromRadio` until it comes back empty. Returns false once the dispatcher is gone.
async fn drain(
    peripheral: &Peripheral,
    from_radio: &Characteristic,
    radio: &RadioState,
    sink: &EventSink,
) -> Result<bool, btleplug::Error> {
    loop {
        let frame = peripheral.read(from_radio).await?;
        if frame.is_empty() {
            return Ok(true);
        }
        if let Some(packet) = radio.handle_frame(&frame) {
            if !sink.packet(packet).await {
                return Ok(false);
            }
        }
    }
}

async fn ble_reader(
    peripheral: Peripheral,
    from_radio: Characteristic,
    radio: Arc<RadioState>,
    sink: EventSink,
    kick: Arc<Notify>,
) {
    let mut notes = match peripheral.notifications().await {
        Ok(notes) => notes,
        Err(e) => {
            finish_reader(&radio, &sink, &e.to_string());
            return;
        }
    };
    let reason = loop {
        match drain(&peripheral, &from_radio, &radio, &sink).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("dispatcher gone; stopping bluetooth reader");
                radio.alive.store(false, Ordering::Release);
                return;
            }
            Err(e) => break e.to_string(),
        }
        tokio::select! {
            note = notes.next() => match note {
                Some(note) if note.uuid == FROM_NUM_UUID => {}
                Some(note) => trace!("ignoring notification from {}", note.uuid),
                None => break "bluetooth notifications ended".to_string(),
            },
            _ = kick.notified() => {}
        }
    };
    finish_reader(&radio, &sink, &reason);
}

impl BleHandle {
    async fn send_to_radio(&self, msg: ToRadio) -> Result<(), TransportError> {
        if self.radio.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.peripheral
            .write(&self.to_radio, &msg.encode_to_vec(), WriteType::WithResponse)
            .await
            .map_err(ble_error)?;
        self.kick.notify_one();
        Ok(())
    }

    pub async fn handshake(&self) -> Result<(), TransportError> {
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
impl TransportHandle for BleHandle {
    fn describe(&self) -> String {
        self.describe.clone()
    }

    fn node_summary(&self) -> Option<NodeSummary> {
        self.radio.node_summary()
    }

    /// Reads `fromNum`; a dropped link fails the read.
    async fn probe(&self) -> Result<(), TransportError> {
        if !self.radio.alive.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.peripheral
            .read(&self.from_num)
            .await
            .map_err(ble_error)?;
        Ok(())
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
        let notice = self
            .send_to_radio(ToRadio {
                payload_variant: Some(to_radio::PayloadVariant::Disconnect(true)),
            })
            .await;
        self.radio.closed.store(true, Ordering::Release);
        self.radio.alive.store(false, Ordering::Release);
        if let Some(reader) = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take() {
            reader.abort();
        }
        if let Err(e) = notice {
            trace!("disconnect notice to {} failed: {}", self.describe, e);
        }
        if let Err(e) = self.peripheral.disconnect().await {
            trace!("bluetooth disconnect from {} failed: {}", self.describe, e);
        }
        debug!("closed {}", self.describe);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radios_match_by_address_or_name() {
        assert!(matches_target("aa:bb:cc:dd:ee:ff", "AA:BB:CC:DD:EE:FF", None));
        assert!(matches_target("Base_1a2b", "00:00:00:00:00:00", Some("Base_1a2b")));
        assert!(!matches_target("Base", "00:00:00:00:00:00", Some("Base_1a2b")));
        assert!(!matches_target("AA:BB:CC:DD:EE:00", "AA:BB:CC:DD:EE:FF", Some("x")));
    }

    #[test]
    fn gatt_ids_match_the_radio_firmware() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6ba1b218-15a8-461f-9fa8-5dcae273eafd"
        );
        assert_eq!(
            FROM_NUM_UUID.to_string(),
            "ed9da18c-a800-4f66-a670-aa7547e34453"
        );
    }
}
