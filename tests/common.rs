//! Test doubles shared by the integration tests: recording chat relay and mesh outlet, a
//! static name table, scripted plugins and a scripted transport factory.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use meshrelay::error::RelayError;
use meshrelay::meshtastic::{
    ConnectionConfig, EventSink, InboundPacket, NodeSummary, TransportError, TransportFactory,
    TransportHandle, TransportTarget,
};
use meshrelay::relay::{
    ChannelRouter, ChatEvent, ChatRelay, Dispatcher, MeshSender, NameResolver, Plugin,
    PluginChain, RelayQueue, RoomContext, RoomMapping,
};

pub const MESHNET: &str = "TestNet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCall {
    pub room_id: String,
    pub text: String,
    pub display_name: String,
    pub short_name: String,
    pub meshnet_name: String,
}

#[derive(Default)]
pub struct RecordingRelay {
    pub relays: Mutex<Vec<RelayCall>>,
    pub texts: Mutex<Vec<(String, String)>>,
    /// `(room_id, body, html)`
    pub html: Mutex<Vec<(String, String, String)>>,
}

impl RecordingRelay {
    pub fn relays(&self) -> Vec<RelayCall> {
        self.relays.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<(String, String)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn html(&self) -> Vec<(String, String, String)> {
        self.html.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatRelay for RecordingRelay {
    async fn relay(
        &self,
        room_id: &str,
        text: &str,
        display_name: &str,
        short_name: &str,
        meshnet_name: &str,
    ) -> Result<(), RelayError> {
        self.relays.lock().unwrap().push(RelayCall {
            room_id: room_id.to_string(),
            text: text.to_string(),
            display_name: display_name.to_string(),
            short_name: short_name.to_string(),
            meshnet_name: meshnet_name.to_string(),
        });
        Ok(())
    }

    async fn send_text(&self, room_id: &str, text: &str) -> Result<(), RelayError> {
        self.texts
            .lock()
            .unwrap()
            .push((room_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_html(&self, room_id: &str, body: &str, html: &str) -> Result<(), RelayError> {
        self.html
            .lock()
            .unwrap()
            .push((room_id.to_string(), body.to_string(), html.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticNames(pub HashMap<String, (String, String)>);

impl StaticNames {
    pub fn with(mut self, id: &str, long: &str, short: &str) -> Self {
        self.0
            .insert(id.to_string(), (long.to_string(), short.to_string()));
        self
    }
}

impl NameResolver for StaticNames {
    fn long_name(&self, sender_id: &str) -> Option<String> {
        self.0.get(sender_id).map(|(l, _)| l.clone())
    }

    fn short_name(&self, sender_id: &str) -> Option<String> {
        self.0.get(sender_id).map(|(_, s)| s.clone())
    }
}

pub struct RecordingMesh {
    pub connected: AtomicBool,
    pub sent: Mutex<Vec<(u8, String)>>,
}

impl RecordingMesh {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(u8, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeshSender for RecordingMesh {
    async fn send_text(&self, channel: u8, text: &str) -> Result<(), RelayError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RelayError::NotConnected);
        }
        self.sent.lock().unwrap().push((channel, text.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Decline,
    Claim,
    Fail,
    Hang,
}

/// What a plugin was handed for one mesh event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshArgs {
    pub sender_id: String,
    pub formatted: Option<String>,
    pub display_name: Option<String>,
    pub meshnet_name: Option<String>,
}

pub struct ScriptedPlugin {
    name: String,
    behavior: Behavior,
    pub mesh_calls: Mutex<Vec<MeshArgs>>,
    pub chat_calls: AtomicUsize,
}

impl ScriptedPlugin {
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            mesh_calls: Mutex::new(Vec::new()),
            chat_calls: AtomicUsize::new(0),
        })
    }

    pub fn mesh_count(&self) -> usize {
        self.mesh_calls.lock().unwrap().len()
    }

    pub fn chat_count(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    async fn act(&self) -> anyhow::Result<bool> {
        match self.behavior {
            Behavior::Decline => Ok(false),
            Behavior::Claim => Ok(true),
            Behavior::Fail => Err(anyhow::anyhow!("{} exploded", self.name)),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_mesh_message(
        &self,
        packet: &InboundPacket,
        formatted: Option<&str>,
        display_name: Option<&str>,
        meshnet_name: Option<&str>,
    ) -> anyhow::Result<bool> {
        self.mesh_calls.lock().unwrap().push(MeshArgs {
            sender_id: packet.sender_id.clone(),
            formatted: formatted.map(str::to_string),
            display_name: display_name.map(str::to_string),
            meshnet_name: meshnet_name.map(str::to_string),
        });
        self.act().await
    }

    async fn handle_chat_message(
        &self,
        _room: &RoomContext,
        _event: &ChatEvent,
        _full_text: &str,
    ) -> anyhow::Result<bool> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        self.act().await
    }
}

pub fn chain(plugins: Vec<Arc<dyn Plugin>>) -> PluginChain {
    PluginChain::new(plugins, PluginChain::DEFAULT_TIMEOUT)
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub relay: Arc<RecordingRelay>,
    pub mesh: Arc<RecordingMesh>,
}

/// Dispatcher over recording collaborators.
pub fn harness(mappings: Vec<RoomMapping>, names: StaticNames, plugins: PluginChain) -> Harness {
    let router = Arc::new(ChannelRouter::new(mappings));
    let relay = Arc::new(RecordingRelay::default());
    let mesh = Arc::new(RecordingMesh::new(true));
    let relay_dyn: Arc<dyn ChatRelay> = relay.clone();
    let lanes = RelayQueue::spawn(router.rooms(), relay_dyn, 64);
    let dispatcher = Dispatcher::new(
        router,
        plugins,
        Arc::new(names),
        lanes,
        mesh.clone(),
        MESHNET,
    );
    Harness {
        dispatcher,
        relay,
        mesh,
    }
}

pub fn chat_event(room_id: &str, body: &str) -> ChatEvent {
    ChatEvent {
        room_id: room_id.to_string(),
        event_id: "$event".to_string(),
        sender: "@alice:example.org".to_string(),
        sender_display: "alice".to_string(),
        body: body.to_string(),
        meshnet: None,
    }
}

// ---- transport doubles ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    Succeed,
    Fail,
    ConfigError,
}

pub struct MockHandle {
    pub id: usize,
    pub probe_fails: AtomicBool,
    pub probe_hangs: AtomicBool,
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<(u8, String)>>,
}

#[async_trait]
impl TransportHandle for MockHandle {
    fn describe(&self) -> String {
        format!("mock:{}", self.id)
    }

    fn node_summary(&self) -> Option<NodeSummary> {
        Some(NodeSummary {
            node_num: 0x1234,
            long_name: "Mock Radio".into(),
            short_name: "MOCK".into(),
            hw_model: 0,
        })
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.probe_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn send_text(&self, channel: u8, text: &str) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((channel, text.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Follows `script` for successive opens, then repeats `fallback`.
pub struct MockFactory {
    script: Mutex<VecDeque<OpenStep>>,
    fallback: OpenStep,
    pub sinks: Mutex<Vec<EventSink>>,
    pub handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockFactory {
    pub fn new(script: Vec<OpenStep>, fallback: OpenStep) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            sinks: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn opens(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    pub fn sink(&self, index: usize) -> EventSink {
        self.sinks.lock().unwrap()[index].clone()
    }

    pub fn handle(&self, index: usize) -> Arc<MockHandle> {
        Arc::clone(&self.handles.lock().unwrap()[index])
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        _config: &ConnectionConfig,
        sink: EventSink,
    ) -> Result<Arc<dyn TransportHandle>, TransportError> {
        self.sinks.lock().unwrap().push(sink);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match step {
            OpenStep::Fail => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "radio unreachable",
            ))),
            OpenStep::ConfigError => Err(TransportError::Config("no such device".into())),
            OpenStep::Succeed => {
                let mut handles = self.handles.lock().unwrap();
                let handle = Arc::new(MockHandle {
                    id: handles.len(),
                    probe_fails: AtomicBool::new(false),
                    probe_hangs: AtomicBool::new(false),
                    closed: AtomicBool::new(false),
                    sent: Mutex::new(Vec::new()),
                });
                handles.push(Arc::clone(&handle));
                Ok(handle as Arc<dyn TransportHandle>)
            }
        }
    }
}

pub fn tcp_config(retry_limit: u32) -> ConnectionConfig {
    ConnectionConfig {
        target: TransportTarget::Tcp {
            host: "radio.local".into(),
        },
        retry_limit,
        meshnet_name: MESHNET.into(),
    }
}
