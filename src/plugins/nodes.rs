use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::meshtastic::{InboundPacket, NodeDirectory, NodeEntry};
use crate::protobuf::meshtastic::HardwareModel;
use crate::relay::{matches_command, ChatEvent, ChatRelay, Plugin, RoomContext};

const COLUMNS: [&str; 7] = ["Tag", "Name", "Device", "Bat", "Voltage", "SNR", "Last seen"];

/// `!nodes` answers with a table of nodes the radio knows about.
pub struct NodesPlugin {
    chat: Arc<dyn ChatRelay>,
    nodes: Arc<NodeDirectory>,
}

/// The node table as pipe-separated text and as an HTML table.
struct RenderedTable {
    text: String,
    html: String,
}

impl NodesPlugin {
    pub fn new(chat: Arc<dyn ChatRelay>, nodes: Arc<NodeDirectory>) -> Self {
        Self { chat, nodes }
    }

    fn render(&self, now: DateTime<Utc>) -> RenderedTable {
        let nodes = self.nodes.entries();
        let rows: Vec<[String; 7]> = nodes.iter().map(|node| row(node, now)).collect();

        let mut text = format!("Nodes: {}\n", rows.len());
        let _ = writeln!(text, "|{}|", COLUMNS.join("|"));
        text.push_str("|:---:|:---:|:---:|---:|---:|---:|---------|\n");
        for cells in &rows {
            let _ = writeln!(text, "|{}|", cells.join("|"));
        }

        let mut html = format!("<p>Nodes: {}</p>\n<table>\n<thead><tr>", rows.len());
        for column in COLUMNS {
            let _ = write!(html, "<th>{}</th>", column);
        }
        html.push_str("</tr></thead>\n<tbody>\n");
        for cells in &rows {
            html.push_str("<tr>");
            for cell in cells {
                let _ = write!(html, "<td>{}</td>", escape_html(cell));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</tbody>\n</table>");

        RenderedTable { text, html }
    }
}

fn row(node: &NodeEntry, now: DateTime<Utc>) -> [String; 7] {
    let device = HardwareModel::try_from(node.hw_model)
        .map(|m| m.as_str_name().to_string())
        .unwrap_or_else(|_| node.hw_model.to_string());
    let battery = node
        .battery_level
        .map(|b| format!("{}%", b))
        .unwrap_or_else(|| "?%".to_string());
    let voltage = node
        .voltage
        .map(|v| format!("{:.2}V", v))
        .unwrap_or_else(|| "?V".to_string());
    let snr = node.snr.map(|s| format!("{} dB", s)).unwrap_or_default();
    let last_seen = node
        .last_seen
        .map(|then| relative_time(now, then))
        .unwrap_or_default();
    [
        node.short_name.clone(),
        node.long_name.clone(),
        device,
        battery,
        voltage,
        snr,
        last_seen,
    ]
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Human readable age of `then`, switching to a date after a week.
pub fn relative_time(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(then);
    let days = delta.num_days();
    if days > 7 {
        return then.format("%b %d, %Y").to_string();
    }
    if days >= 1 {
        return format!("{} days ago", days);
    }
    let secs = delta.num_seconds();
    if secs >= 3600 {
        format!("{} hours ago", secs / 3600)
    } else if secs >= 60 {
        format!("{} minutes ago", secs / 60)
    } else {
        "Just now".to_string()
    }
}

#[async_trait]
impl Plugin for NodesPlugin {
    fn name(&self) -> &str {
        "nodes"
    }

    async fn handle_mesh_message(
        &self,
        _packet: &InboundPacket,
        _formatted: Option<&str>,
        _display_name: Option<&str>,
        _meshnet_name: Option<&str>,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn handle_chat_message(
        &self,
        room: &RoomContext,
        _event: &ChatEvent,
        full_text: &str,
    ) -> anyhow::Result<bool> {
        if !matches_command(full_text.trim(), "nodes") {
            return Ok(false);
        }
        let table = self.render(Utc::now());
        self.chat
            .send_html(&room.room_id, &table.text, &table.html)
            .await?;
        Ok(true)
    }
}
