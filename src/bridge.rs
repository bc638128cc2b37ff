//! Process runtime: wires the radio side, the chat side and the dispatcher together and runs
//! the main event loop until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::matrix::MatrixClient;
use crate::meshtastic::{ConnectionManager, NodeDirectory, StreamTransportFactory};
use crate::metrics;
use crate::plugins::{load_plugins, PluginDeps};
use crate::relay::{
    ChannelRouter, ChatRelay, DispatchOutcome, Dispatcher, MeshSender, NameResolver, RelayQueue,
};

const NODE_SAVE_INTERVAL: Duration = Duration::from_secs(3600);
const NODE_MAX_AGE_DAYS: u32 = 30;

pub struct Bridge {
    config: Config,
}

impl Bridge {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let connection = config.connection_config()?;
        let meshnet_name = connection.meshnet_name.clone();

        let nodes = Arc::new(NodeDirectory::load_or_default(
            &config.meshtastic.node_cache_file,
        ));
        if nodes.is_empty() {
            info!("Node directory is empty; sender names resolve once the radio sends its node list");
        }
        let router = Arc::new(ChannelRouter::new(config.room_mappings()));
        let rooms: Vec<String> = router.rooms().into_iter().map(str::to_string).collect();
        if rooms.is_empty() {
            warn!("No matrix_rooms configured; nothing will be relayed");
        }

        let matrix = Arc::new(MatrixClient::new(&config.matrix)?);
        for room in &rooms {
            if let Err(e) = matrix.join_room(room).await {
                warn!("Could not join {}: {}", room, e);
            }
        }
        let chat: Arc<dyn ChatRelay> = matrix.clone();

        let (packet_tx, mut packet_rx) = mpsc::channel(config.relay.dispatch_queue);
        let factory = Arc::new(StreamTransportFactory::new(Arc::clone(&nodes)));
        let manager = ConnectionManager::new(connection, config.tuning(), factory, packet_tx);

        let plugins = load_plugins(
            &config.plugins,
            PluginDeps {
                chat: Arc::clone(&chat),
                nodes: Arc::clone(&nodes),
            },
            config.plugin_timeout(),
        );
        if plugins.is_empty() {
            info!("No plugins active; every mapped message is relayed");
        }
        let relay = RelayQueue::spawn(
            rooms.iter().map(String::as_str),
            Arc::clone(&chat),
            config.relay.relay_queue,
        );
        let names: Arc<dyn NameResolver> = nodes.clone();
        let mesh: Arc<dyn MeshSender> = manager.clone();
        let dispatcher = Dispatcher::new(
            Arc::clone(&router),
            plugins,
            names,
            relay,
            mesh,
            meshnet_name.clone(),
        );

        info!(
            "Relaying between meshnet '{}' and {} room(s)",
            meshnet_name,
            rooms.len()
        );

        match manager.connect(false).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                dispatcher.shutdown().await;
                return Err(anyhow!(e));
            }
            Err(e) => {
                error!("{}; retrying in the background", e);
                manager.schedule_reconnect();
            }
        }
        let supervisor = manager.spawn_supervisor();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (chat_tx, mut chat_rx) = mpsc::channel(config.relay.dispatch_queue);
        let sync = tokio::spawn(Arc::clone(&matrix).run_sync(rooms.clone(), chat_tx, shutdown_rx));

        let stats_enabled = config.relay.stats_interval_secs > 0;
        let stats_period = Duration::from_secs(config.relay.stats_interval_secs.max(1));
        let mut stats = interval_at(Instant::now() + stats_period, stats_period);
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut save = interval_at(Instant::now() + NODE_SAVE_INTERVAL, NODE_SAVE_INTERVAL);
        save.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(packet) = packet_rx.recv() => {
                    if let DispatchOutcome::Relayed { channel, rooms } = dispatcher.on_inbound_packet(packet).await {
                        debug!("channel {} relayed to {:?}", channel, rooms);
                    }
                }
                Some(event) = chat_rx.recv() => {
                    let outcome = dispatcher.on_chat_message(event).await;
                    debug!("chat message outcome: {:?}", outcome);
                }
                _ = stats.tick(), if stats_enabled => {
                    info!("{} (mesh link {:?})", metrics::snapshot(), manager.state());
                }
                _ = save.tick() => {
                    save_nodes(&nodes, &config.meshtastic.node_cache_file);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        manager.shutdown().await;
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
        let _ = sync.await;
        dispatcher.shutdown().await;
        save_nodes(&nodes, &config.meshtastic.node_cache_file);
        info!("Stopped. {}", metrics::snapshot());
        Ok(())
    }
}

fn save_nodes(nodes: &NodeDirectory, path: &str) {
    let pruned = nodes.prune_stale(NODE_MAX_AGE_DAYS);
    if pruned > 0 {
        debug!("pruned {} stale nodes", pruned);
    }
    if let Err(e) = nodes.save_to_file(path) {
        warn!("Failed to save node cache: {:#}", e);
    }
}
