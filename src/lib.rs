//! # Meshrelay - Meshtastic ↔ Matrix Relay
//!
//! Meshrelay bridges a Meshtastic LoRa mesh and Matrix chat rooms. Text heard on a mapped mesh
//! channel is posted to the matching rooms, and messages typed in those rooms are broadcast
//! back onto the mesh.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshrelay::bridge::Bridge;
//! use meshrelay::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     config.validate()?;
//!     Bridge::new(config).run().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - radio link: transports, framing, node directory, connection manager
//! - [`relay`] - dispatcher, channel router, plugin chain, per-room relay lanes
//! - [`plugins`] - built-in plugins and the config-driven loader
//! - [`matrix`] - Matrix client-server API client
//! - [`bridge`] - process runtime tying the pieces together
//! - [`config`] - TOML configuration
//! - [`protobuf`] - Meshtastic protobuf messages
//! - [`metrics`] - process-wide counters
//!
//! ## Architecture
//!
//! ```text
//!  radio ──▶ transport reader ──▶ dispatch queue ──▶ Dispatcher ──▶ relay lanes ──▶ Matrix
//!               ▲                                        │
//!               │ reconnect / health          PluginChain┘
//!        ConnectionManager ◀───── send_text ───── Dispatcher ◀──── /sync ◀──── Matrix
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod logutil;
pub mod matrix;
pub mod meshtastic;
pub mod metrics;
pub mod plugins;
pub mod protobuf;
pub mod relay;
