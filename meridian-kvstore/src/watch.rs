//! # Watch Hub
//!
//! Fan-out of committed changes to open key watches.

use meridian_core::store::{WatchEvent, WatchResponse};
use meridian_core::{Revision, WatchId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Statistics about watches
#[derive(Debug, Clone, Default)]
pub struct WatchStats {
    pub total_watches_opened: u64,
    pub active_watches: usize,
    pub total_responses_sent: u64,
    pub dropped_watches: u64,
}

struct Watcher {
    key: String,
    start_revision: Revision,
    sender: mpsc::UnboundedSender<WatchResponse>,
}

/// Registry of open watches.
///
/// The hub lives inside the store state and is only touched while the store
/// lock is held, so events reach every watcher in commit order.
pub(crate) struct WatchHub {
    watchers: HashMap<WatchId, Watcher>,
    next_id: WatchId,
    stats: WatchStats,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        Self {
            watchers: HashMap::new(),
            next_id: 1,
            stats: WatchStats::default(),
        }
    }

    /// Reserves a watch id.
    pub(crate) fn allocate_id(&mut self) -> WatchId {
        let id = self.next_id;
        self.next_id += 1;
        self.stats.total_watches_opened += 1;
        id
    }

    /// Registers a watcher that receives live events for `key` at or after
    /// `start_revision`.
    pub(crate) fn register(
        &mut self,
        watch_id: WatchId,
        key: &str,
        start_revision: Revision,
        sender: mpsc::UnboundedSender<WatchResponse>,
    ) {
        self.watchers.insert(
            watch_id,
            Watcher {
                key: key.to_string(),
                start_revision,
                sender,
            },
        );
        debug!("Watch {} registered on key {} from revision {}", watch_id, key, start_revision);
    }

    /// Delivers committed events to every matching watcher.
    pub(crate) fn publish(&mut self, revision: Revision, events: &[WatchEvent]) {
        let mut closed = Vec::new();

        for (watch_id, watcher) in &self.watchers {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|ev| ev.kv.key == watcher.key && ev.kv.mod_revision >= watcher.start_revision)
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }

            let response = WatchResponse {
                watch_id: *watch_id,
                revision,
                events: matching,
                ..Default::default()
            };
            if watcher.sender.send(response).is_err() {
                closed.push(*watch_id);
            } else {
                self.stats.total_responses_sent += 1;
            }
        }

        if !closed.is_empty() {
            debug!("Dropping {} watches with closed receivers", closed.len());
            self.stats.dropped_watches += closed.len() as u64;
            for watch_id in closed {
                self.watchers.remove(&watch_id);
            }
        }
    }

    /// Removes a watcher, telling it why. Returns `false` for unknown ids.
    pub(crate) fn cancel(&mut self, watch_id: WatchId, revision: Revision, reason: &str) -> bool {
        match self.watchers.remove(&watch_id) {
            Some(watcher) => {
                let _ = watcher.sender.send(canceled_response(watch_id, revision, reason));
                debug!("Watch {} on key {} canceled: {}", watch_id, watcher.key, reason);
                true
            }
            None => false,
        }
    }

    /// Cancels every watcher.
    pub(crate) fn close_all(&mut self, revision: Revision, reason: &str) {
        for (watch_id, watcher) in self.watchers.drain() {
            let _ = watcher.sender.send(canceled_response(watch_id, revision, reason));
        }
    }

    /// Prunes watchers whose receiving side was dropped.
    pub(crate) fn cleanup_closed(&mut self) -> usize {
        let before = self.watchers.len();
        self.watchers.retain(|_, watcher| !watcher.sender.is_closed());
        let removed = before - self.watchers.len();
        self.stats.dropped_watches += removed as u64;
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.watchers.len()
    }

    pub(crate) fn stats(&self) -> WatchStats {
        WatchStats {
            active_watches: self.watchers.len(),
            ..self.stats.clone()
        }
    }
}

pub(crate) fn canceled_response(watch_id: WatchId, revision: Revision, reason: &str) -> WatchResponse {
    WatchResponse {
        watch_id,
        revision,
        canceled: true,
        cancel_reason: Some(reason.to_string()),
        ..Default::default()
    }
}
