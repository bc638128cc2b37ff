//! Per-room relay lanes.
//!
//! Each chat room gets one bounded queue drained by one worker, so messages reach a room in
//! the order they were submitted while a slow room never holds up the others. Submission
//! never waits: a full lane drops the new request and counts it.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::ChatRelay;
use crate::logutil::escape_log;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub room_id: String,
    pub text: String,
    pub display_name: String,
    pub short_name: String,
    pub meshnet_name: String,
}

pub struct RelayQueue {
    lanes: HashMap<String, mpsc::Sender<RelayRequest>>,
    workers: Vec<JoinHandle<()>>,
}

impl RelayQueue {
    /// Start one worker per room.
    pub fn spawn<'a>(
        rooms: impl IntoIterator<Item = &'a str>,
        relay: Arc<dyn ChatRelay>,
        capacity: usize,
    ) -> Self {
        let mut lanes = HashMap::new();
        let mut workers = Vec::new();
        for room in rooms {
            if lanes.contains_key(room) {
                continue;
            }
            let (tx, rx) = mpsc::channel(capacity.max(1));
            workers.push(tokio::spawn(lane_worker(
                room.to_string(),
                rx,
                Arc::clone(&relay),
            )));
            lanes.insert(room.to_string(), tx);
        }
        debug!("started {} relay lanes", lanes.len());
        Self { lanes, workers }
    }

    /// Queue a request on its room's lane. Returns false if it was dropped.
    pub fn submit(&self, request: RelayRequest) -> bool {
        let Some(lane) = self.lanes.get(&request.room_id) else {
            warn!("No relay lane for room {}; dropping message", request.room_id);
            metrics::inc_relay_drops();
            return false;
        };
        match lane.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(req)) => {
                warn!(
                    "Relay queue for {} is full; dropping message {}",
                    req.room_id,
                    escape_log(&req.text)
                );
                metrics::inc_relay_drops();
                false
            }
            Err(TrySendError::Closed(req)) => {
                warn!("Relay lane for {} has stopped; dropping message", req.room_id);
                metrics::inc_relay_drops();
                false
            }
        }
    }

    /// Close every lane and wait for queued requests to be delivered.
    pub async fn shutdown(self) {
        drop(self.lanes);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("relay lane worker failed: {}", e);
            }
        }
    }
}

async fn lane_worker(
    room_id: String,
    mut rx: mpsc::Receiver<RelayRequest>,
    relay: Arc<dyn ChatRelay>,
) {
    while let Some(req) = rx.recv().await {
        match relay
            .relay(
                &req.room_id,
                &req.text,
                &req.display_name,
                &req.short_name,
                &req.meshnet_name,
            )
            .await
        {
            Ok(()) => trace!("relayed to {}: {}", req.room_id, escape_log(&req.text)),
            Err(e) => error!("Error relaying message to {}: {}", req.room_id, e),
        }
    }
    debug!("relay lane for {} drained", room_id);
}
