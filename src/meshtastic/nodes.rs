//! Directory of mesh nodes seen by the radio.
//!
//! Filled from the radio's node database on connect and from live NODEINFO packets, then used
//! to resolve sender ids to display names. It survives restarts via a JSON file written with
//! an atomic temp-file rename.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::parse_node_id;
use crate::relay::NameResolver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_num: u32,
    pub long_name: String,
    pub short_name: String,
    /// Raw `HardwareModel` value; 0 when unknown.
    #[serde(default)]
    pub hw_model: i32,
    #[serde(default)]
    pub snr: Option<f32>,
    #[serde(default)]
    pub battery_level: Option<u32>,
    #[serde(default)]
    pub voltage: Option<f32>,
    pub first_seen: DateTime<Utc>,
    /// When the mesh last heard the node. `None` for entries only known from the radio's
    /// node database.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeTable {
    nodes: HashMap<u32, NodeEntry>,
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct NodeDirectory {
    table: RwLock<NodeTable>,
}

impl NodeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let table: NodeTable = serde_json::from_str(&content)?;
        Ok(Self {
            table: RwLock::new(table),
        })
    }

    /// Load the cache file if present; start empty on any error.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no node cache at {}", path.display());
            return Self::new();
        }
        match Self::load_from_file(path) {
            Ok(dir) => {
                info!("Loaded {} cached nodes from {}", dir.len(), path.display());
                dir
            }
            Err(e) => {
                warn!("Ignoring unreadable node cache {}: {}", path.display(), e);
                Self::new()
            }
        }
    }

    /// Write the directory as JSON, replacing `path` atomically.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(&*self.read())?;
        replace_file(path, &json)
            .with_context(|| format!("writing node cache {}", path.display()))?;
        debug!("saved {} nodes to {}", self.len(), path.display());
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, NodeTable> {
        self.table.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeTable> {
        self.table.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Record names for a node; empty names keep what was known before.
    ///
    /// Knowing a node's names says nothing about when it was last heard, so `last_seen` is
    /// left alone.
    pub fn update(&self, node_num: u32, long_name: &str, short_name: &str) {
        let now = Utc::now();
        let mut table = self.write();
        let entry = table.nodes.entry(node_num).or_insert_with(|| NodeEntry {
            node_num,
            long_name: String::new(),
            short_name: String::new(),
            hw_model: 0,
            snr: None,
            battery_level: None,
            voltage: None,
            first_seen: now,
            last_seen: None,
        });
        if !long_name.is_empty() {
            entry.long_name = long_name.to_string();
        }
        if !short_name.is_empty() {
            entry.short_name = short_name.to_string();
        }
        table.last_updated = Some(now);
    }

    pub fn set_hardware(&self, node_num: u32, hw_model: i32) {
        if hw_model == 0 {
            return;
        }
        if let Some(entry) = self.write().nodes.get_mut(&node_num) {
            entry.hw_model = hw_model;
        }
    }

    /// Note radio metrics for a node already in the directory.
    pub fn observe(&self, node_num: u32, snr: Option<f32>, heard_at: Option<DateTime<Utc>>) {
        let mut table = self.write();
        if let Some(entry) = table.nodes.get_mut(&node_num) {
            if snr.is_some() {
                entry.snr = snr;
            }
            if let Some(at) = heard_at {
                entry.last_seen = Some(at);
            }
        }
    }

    /// Battery telemetry; `None` keeps the previous reading.
    pub fn record_power(&self, node_num: u32, battery_level: Option<u32>, voltage: Option<f32>) {
        let mut table = self.write();
        if let Some(entry) = table.nodes.get_mut(&node_num) {
            if battery_level.is_some() {
                entry.battery_level = battery_level;
            }
            if voltage.is_some() {
                entry.voltage = voltage;
            }
        }
    }

    /// Drop nodes not heard from in `max_age_days`. Returns how many were removed.
    ///
    /// Nodes never heard at all age from the moment they entered the directory.
    pub fn prune_stale(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let mut table = self.write();
        let before = table.nodes.len();
        table
            .nodes
            .retain(|_, node| node.last_seen.unwrap_or(node.first_seen) > cutoff);
        let removed = before - table.nodes.len();
        if removed > 0 {
            table.last_updated = Some(Utc::now());
        }
        removed
    }

    pub fn get(&self, node_num: u32) -> Option<NodeEntry> {
        self.read().nodes.get(&node_num).cloned()
    }

    /// All nodes, most recently heard first; never-heard nodes last.
    pub fn entries(&self) -> Vec<NodeEntry> {
        let mut nodes: Vec<NodeEntry> = self.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.node_num.cmp(&b.node_num)));
        nodes
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameResolver for NodeDirectory {
    fn long_name(&self, sender_id: &str) -> Option<String> {
        let num = parse_node_id(sender_id)?;
        self.get(num)
            .map(|n| n.long_name)
            .filter(|n| !n.is_empty())
    }

    fn short_name(&self, sender_id: &str) -> Option<String> {
        let num = parse_node_id(sender_id)?;
        self.get(num)
            .map(|n| n.short_name)
            .filter(|n| !n.is_empty())
    }
}

/// Write `bytes` to a sibling temp file, sync it, then rename it over `target`.
fn replace_file(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let stem = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("nodes.json");

    let mut seq = 0u32;
    let (tmp_path, mut tmp) = loop {
        let candidate = dir.join(format!(".{stem}.{}.{seq}.tmp", std::process::id()));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => break (candidate, file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && seq < 64 => seq += 1,
            Err(e) => return Err(e),
        }
    };
    let written = tmp.write_all(bytes).and_then(|_| tmp.sync_all());
    drop(tmp);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp_path, target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    // Persist the rename itself; not supported everywhere.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}
