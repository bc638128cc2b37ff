//! Built-in plugins and the loader that turns `[plugins.*]` config into a [`PluginChain`].

pub mod nodes;
pub mod ping;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::PluginConfig;
use crate::meshtastic::NodeDirectory;
use crate::relay::{ChatRelay, Plugin, PluginChain};

pub use nodes::NodesPlugin;
pub use ping::PingPlugin;

const DEFAULT_PRIORITY: u32 = 100;

/// Collaborators the built-in plugins may use.
#[derive(Clone)]
pub struct PluginDeps {
    pub chat: Arc<dyn ChatRelay>,
    pub nodes: Arc<NodeDirectory>,
}

fn build(name: &str, deps: &PluginDeps) -> Option<Arc<dyn Plugin>> {
    match name {
        "ping" => Some(Arc::new(PingPlugin::new(Arc::clone(&deps.chat)))),
        "nodes" => Some(Arc::new(NodesPlugin::new(
            Arc::clone(&deps.chat),
            Arc::clone(&deps.nodes),
        ))),
        _ => None,
    }
}

/// Active plugins ordered by priority (lower first), then name. The result never changes.
pub fn load_plugins(
    config: &HashMap<String, PluginConfig>,
    deps: PluginDeps,
    timeout: Duration,
) -> PluginChain {
    let mut active: Vec<(u32, &str)> = config
        .iter()
        .filter(|(_, cfg)| cfg.active)
        .map(|(name, cfg)| (cfg.priority.unwrap_or(DEFAULT_PRIORITY), name.as_str()))
        .collect();
    active.sort();

    let mut plugins = Vec::with_capacity(active.len());
    for (priority, name) in active {
        match build(name, &deps) {
            Some(plugin) => {
                info!("Loaded plugin {} (priority {})", name, priority);
                plugins.push(plugin);
            }
            None => warn!("Unknown plugin '{}' in configuration; skipping", name),
        }
    }
    PluginChain::new(plugins, timeout)
}
