//! Plugin interface and the ordered interception chain.
//!
//! Every event is offered to the plugins one at a time in configured order. The first plugin
//! that returns `Ok(true)` claims the event and the rest are skipped. Errors and timeouts
//! count as "not claimed" and the chain moves on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, trace, warn};
use tokio::time::{error::Elapsed, timeout};

use super::ChatEvent;
use crate::error::RelayError;
use crate::meshtastic::InboundPacket;
use crate::metrics;

/// Chat room an event arrived in, with the mesh channels bridged to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
    pub room_id: String,
    pub channels: Vec<u8>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Used in logs only.
    fn name(&self) -> &str;

    /// Offered every mesh packet. Non-text packets arrive with all optional arguments `None`.
    async fn handle_mesh_message(
        &self,
        packet: &InboundPacket,
        formatted: Option<&str>,
        display_name: Option<&str>,
        meshnet_name: Option<&str>,
    ) -> anyhow::Result<bool>;

    /// Offered every chat message from a bridged room. `full_text` is `"<sender>: <body>"`.
    async fn handle_chat_message(
        &self,
        room: &RoomContext,
        event: &ChatEvent,
        full_text: &str,
    ) -> anyhow::Result<bool>;
}

pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
    timeout: Duration,
}

impl PluginChain {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(plugins: Vec<Arc<dyn Plugin>>, timeout: Duration) -> Self {
        Self { plugins, timeout }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Self::DEFAULT_TIMEOUT)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub async fn dispatch_mesh(
        &self,
        packet: &InboundPacket,
        formatted: Option<&str>,
        display_name: Option<&str>,
        meshnet_name: Option<&str>,
    ) -> bool {
        for plugin in &self.plugins {
            let outcome = timeout(
                self.timeout,
                plugin.handle_mesh_message(packet, formatted, display_name, meshnet_name),
            )
            .await;
            if self.settle(plugin.name(), "mesh", outcome) {
                return true;
            }
        }
        false
    }

    pub async fn dispatch_chat(&self, room: &RoomContext, event: &ChatEvent, full_text: &str) -> bool {
        for plugin in &self.plugins {
            let outcome = timeout(
                self.timeout,
                plugin.handle_chat_message(room, event, full_text),
            )
            .await;
            if self.settle(plugin.name(), "chat", outcome) {
                return true;
            }
        }
        false
    }

    fn settle(
        &self,
        name: &str,
        kind: &str,
        outcome: Result<anyhow::Result<bool>, Elapsed>,
    ) -> bool {
        match outcome {
            Ok(Ok(true)) => {
                debug!("{} message claimed by plugin {}", kind, name);
                true
            }
            Ok(Ok(false)) => {
                trace!("plugin {} declined {} message", name, kind);
                false
            }
            Ok(Err(e)) => {
                let err = RelayError::Plugin {
                    plugin: name.to_string(),
                    reason: format!("{:#}", e),
                };
                error!("{} (while handling {} message)", err, kind);
                metrics::inc_plugin_errors();
                false
            }
            Err(_) => {
                warn!(
                    "Plugin {} did not answer a {} message within {:?}; treating as not claimed",
                    name, kind, self.timeout
                );
                metrics::inc_plugin_errors();
                false
            }
        }
    }
}

/// True when `full_text` (optionally `"<sender>: "`-prefixed) is `!<command>` alone or followed
/// by whitespace and arguments.
pub fn matches_command(full_text: &str, command: &str) -> bool {
    let body = match full_text.split_once(": ") {
        Some((_, rest)) => rest,
        None => full_text,
    };
    let Some(rest) = body
        .trim_start()
        .strip_prefix('!')
        .and_then(|b| b.strip_prefix(command))
    else {
        return false;
    };
    rest.is_empty() || rest.starts_with(char::is_whitespace)
}
