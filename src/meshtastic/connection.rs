//! Connection lifecycle for the mesh radio.
//!
//! [`ConnectionManager`] owns the single transport handle. The handle, its generation and the
//! [`ConnectionState`] live together in one mutex-guarded slot, so a reader never sees a new
//! handle with an old state or the reverse. Three activities drive the slot:
//!
//! * `connect()` callers (startup, the reconnect loop) open handles with bounded retries.
//! * The supervisor task receives loss reports from transports and runs the health probe.
//! * A reconnect loop, spawned once per loss event, retries with doubling backoff until a
//!   handle is back or shutdown is requested.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, MissedTickBehavior};

use super::backoff::ReconnectBackoff;
use super::transport::{EventSink, TransportError, TransportFactory, TransportHandle};
use super::{ConnectionConfig, InboundPacket};
use crate::error::RelayError;
use crate::metrics;
use crate::relay::MeshSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Timing policy for connect, health checks and reconnects.
#[derive(Debug, Clone)]
pub struct ConnectionTuning {
    /// Attempt `k` of a connect call waits `k * retry_step` before attempt `k + 1`.
    pub retry_step: Duration,
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            retry_step: Duration::from_secs(1),
            health_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            backoff_floor: ReconnectBackoff::DEFAULT_FLOOR,
            backoff_cap: ReconnectBackoff::DEFAULT_CAP,
        }
    }
}

struct Slot {
    state: ConnectionState,
    /// Generation of the installed handle.
    generation: u64,
    /// Last generation handed to a transport; every open attempt gets a fresh one.
    issued: u64,
    handle: Option<Arc<dyn TransportHandle>>,
}

pub struct ConnectionManager {
    config: ConnectionConfig,
    tuning: ConnectionTuning,
    factory: Arc<dyn TransportFactory>,
    packets: mpsc::Sender<InboundPacket>,
    lost_tx: mpsc::UnboundedSender<u64>,
    lost_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    slot: Mutex<Slot>,
    state_tx: watch::Sender<ConnectionState>,
    connect_lock: AsyncMutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Create a manager. Packets from every handle it opens are pushed into `packets`.
    pub fn new(
        config: ConnectionConfig,
        tuning: ConnectionTuning,
        factory: Arc<dyn TransportFactory>,
        packets: mpsc::Sender<InboundPacket>,
    ) -> Arc<Self> {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            tuning,
            factory,
            packets,
            lost_tx,
            lost_rx: Mutex::new(Some(lost_rx)),
            slot: Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                generation: 0,
                issued: 0,
                handle: None,
            }),
            state_tx,
            connect_lock: AsyncMutex::new(()),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.slot().state
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The live handle, only while `Connected`.
    pub fn current(&self) -> Option<Arc<dyn TransportHandle>> {
        self.current_with_generation().map(|(_, handle)| handle)
    }

    fn current_with_generation(&self) -> Option<(u64, Arc<dyn TransportHandle>)> {
        let slot = self.slot();
        if slot.state != ConnectionState::Connected {
            return None;
        }
        slot.handle.clone().map(|h| (slot.generation, h))
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, slot: &mut Slot, state: ConnectionState) {
        if slot.state != state {
            debug!("mesh connection state {:?} -> {:?}", slot.state, state);
        }
        slot.state = state;
        self.state_tx.send_replace(state);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Return the live handle, or open a new one.
    ///
    /// With `force_reconnect` the current handle is closed and replaced. Open failures are
    /// retried up to the configured limit; exhaustion leaves the manager `Disconnected`, or
    /// `Reconnecting` when a reconnect loop is already running. After [`shutdown`] this
    /// returns [`RelayError::NotConnected`] without opening anything.
    ///
    /// [`shutdown`]: ConnectionManager::shutdown
    pub async fn connect(
        self: &Arc<Self>,
        force_reconnect: bool,
    ) -> Result<Arc<dyn TransportHandle>, RelayError> {
        self.connect_with(force_reconnect, ConnectionState::Disconnected)
            .await
    }

    async fn connect_with(
        &self,
        force_reconnect: bool,
        on_failure: ConnectionState,
    ) -> Result<Arc<dyn TransportHandle>, RelayError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_shutting_down() {
            debug!("not connecting to {}: shutting down", self.config.target);
            return Err(RelayError::NotConnected);
        }

        if !force_reconnect {
            if let Some(handle) = self.current() {
                trace!("reusing live mesh handle {}", handle.describe());
                return Ok(handle);
            }
        }

        // A reconnect loop owns `Reconnecting`; a failed call must hand the state back to it.
        let (stale, on_failure) = {
            let mut slot = self.slot();
            let stale = slot.handle.take();
            let on_failure = if slot.state == ConnectionState::Reconnecting {
                ConnectionState::Reconnecting
            } else {
                self.set_state(&mut slot, ConnectionState::Connecting);
                on_failure
            };
            (stale, on_failure)
        };
        if let Some(old) = stale {
            self.close_quietly(old).await;
        }

        if let Err(reason) = self.config.validate() {
            error!("Cannot connect to the mesh: {}", reason);
            self.settle(on_failure);
            return Err(RelayError::Config(reason));
        }

        match self.open_with_retries().await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.settle(on_failure);
                Err(e)
            }
        }
    }

    fn settle(&self, state: ConnectionState) {
        let mut slot = self.slot();
        self.set_state(&mut slot, state);
    }

    async fn open_with_retries(&self) -> Result<Arc<dyn TransportHandle>, RelayError> {
        let limit = self.config.effective_retry_limit();
        let target = &self.config.target;
        let mut attempt: u32 = 1;
        loop {
            let generation = {
                let mut slot = self.slot();
                slot.issued += 1;
                slot.issued
            };
            let sink = EventSink::new(self.packets.clone(), self.lost_tx.clone(), generation);
            info!("Connecting to {} ...", target);
            match self.factory.open(&self.config, sink).await {
                Ok(handle) => {
                    self.install(generation, Arc::clone(&handle));
                    return Ok(handle);
                }
                Err(TransportError::Config(reason)) => {
                    error!("Cannot connect to {}: {}", target, reason);
                    return Err(RelayError::Config(reason));
                }
                Err(e) if attempt < limit => {
                    let wait = self.tuning.retry_step * attempt;
                    warn!(
                        "Attempt #{} to reach {} failed. Retrying in {} secs: {}",
                        attempt,
                        target,
                        wait.as_secs(),
                        e
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Could not connect to {} after {} attempts: {}",
                        target, limit, e
                    );
                    return Err(RelayError::ConnectExhausted {
                        attempts: limit,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    fn install(&self, generation: u64, handle: Arc<dyn TransportHandle>) {
        {
            let mut slot = self.slot();
            slot.generation = generation;
            slot.handle = Some(Arc::clone(&handle));
            self.set_state(&mut slot, ConnectionState::Connected);
        }
        match handle.node_summary() {
            Some(node) => info!("Connected to {} via {}", node, handle.describe()),
            None => info!("Connected via {}", handle.describe()),
        }
    }

    async fn close_quietly(&self, handle: Arc<dyn TransportHandle>) {
        if let Err(e) = handle.close().await {
            warn!("Error closing mesh link {}: {}", handle.describe(), e);
        }
    }

    /// React to a lost link. Only the first report for the installed generation while
    /// `Connected` starts a reconnect loop; everything else is ignored.
    fn handle_loss(self: &Arc<Self>, generation: u64, reason: &str) -> bool {
        let stale = {
            let mut slot = self.slot();
            if slot.state != ConnectionState::Connected || slot.generation != generation {
                debug!(
                    "Ignoring loss report for generation {} (current {}, state {:?})",
                    generation, slot.generation, slot.state
                );
                return false;
            }
            let stale = slot.handle.take();
            self.set_state(&mut slot, ConnectionState::Reconnecting);
            stale
        };
        error!(
            "Lost connection to {} ({}). Reconnecting...",
            self.config.target, reason
        );
        metrics::inc_connection_losses();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(old) = stale {
                this.close_quietly(old).await;
            }
            this.reconnect_loop().await;
        });
        true
    }

    /// Treat the current link as lost, as if the transport had reported it.
    pub fn report_lost(self: &Arc<Self>, reason: &str) -> bool {
        let generation = self.slot().generation;
        self.handle_loss(generation, reason)
    }

    /// Start the reconnect loop from `Disconnected`, e.g. after the initial connect gave up.
    pub fn schedule_reconnect(self: &Arc<Self>) -> bool {
        {
            let mut slot = self.slot();
            if slot.state != ConnectionState::Disconnected {
                return false;
            }
            self.set_state(&mut slot, ConnectionState::Reconnecting);
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.reconnect_loop().await });
        true
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let target = self.config.target.clone();
        let mut backoff = ReconnectBackoff::new(self.tuning.backoff_floor, self.tuning.backoff_cap);
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let delay = backoff.next_delay();
            info!("Reconnecting to {} in {}s", target, delay.as_secs());
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    debug!("reconnect loop for {} cancelled by shutdown", target);
                    return;
                }
            }
            if self.state() == ConnectionState::Connected {
                debug!("link to {} already restored elsewhere", target);
                return;
            }
            match self
                .connect_with(true, ConnectionState::Reconnecting)
                .await
            {
                Ok(_) => {
                    backoff.reset();
                    metrics::inc_reconnects();
                    info!("Reconnected to {}", target);
                    return;
                }
                Err(_) if self.is_shutting_down() => {
                    debug!("reconnect loop for {} stopped by shutdown", target);
                    return;
                }
                Err(RelayError::Config(reason)) => {
                    error!("Giving up on reconnecting to {}: {}", target, reason);
                    self.settle(ConnectionState::Disconnected);
                    return;
                }
                Err(e) => {
                    error!(
                        "Reconnect to {} failed: {}; next attempt in {}s",
                        target,
                        e,
                        backoff.peek().as_secs()
                    );
                }
            }
        }
    }

    /// Probe the live handle once, bounded by the probe timeout.
    ///
    /// Returns true when the link answered. A failed or hung probe starts the lost path.
    pub async fn check_health(self: &Arc<Self>) -> bool {
        let Some((generation, handle)) = self.current_with_generation() else {
            return false;
        };
        match timeout(self.tuning.probe_timeout, handle.probe()).await {
            Ok(Ok(())) => {
                trace!("health probe ok for {}", handle.describe());
                true
            }
            Ok(Err(e)) => {
                warn!("Health probe for {} failed: {}", handle.describe(), e);
                self.handle_loss(generation, &e.to_string());
                false
            }
            Err(_) => {
                warn!(
                    "Health probe for {} timed out after {:?}",
                    handle.describe(),
                    self.tuning.probe_timeout
                );
                self.handle_loss(generation, "health probe timed out");
                false
            }
        }
    }

    /// Spawn the supervisor: loss reports from transports plus the periodic health probe.
    /// Returns `None` if a supervisor is already running.
    pub fn spawn_supervisor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut lost_rx = self
            .lost_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut health = tokio::time::interval(this.tuning.health_interval);
            health.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the first probe comes one interval in.
            health.tick().await;
            let mut shutdown = this.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    report = lost_rx.recv() => match report {
                        Some(generation) => {
                            this.handle_loss(generation, "transport reported disconnect");
                        }
                        None => break,
                    },
                    _ = health.tick() => {
                        this.check_health().await;
                    }
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }
            }
            debug!("mesh connection supervisor stopped");
        }))
    }

    /// Stop supervision and reconnects, and close the live handle.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let _guard = self.connect_lock.lock().await;
        let stale = {
            let mut slot = self.slot();
            let stale = slot.handle.take();
            self.set_state(&mut slot, ConnectionState::Disconnected);
            stale
        };
        if let Some(handle) = stale {
            info!("Closing mesh link {}", handle.describe());
            self.close_quietly(handle).await;
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl MeshSender for ConnectionManager {
    async fn send_text(&self, channel: u8, text: &str) -> Result<(), RelayError> {
        let handle = self.current().ok_or(RelayError::NotConnected)?;
        handle
            .send_text(channel, text)
            .await
            .map_err(|e| RelayError::TransientIo(e.to_string()))
    }
}
