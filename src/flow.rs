//! Per-peer egress socket table maintained by a [`Forwarder`](crate::forwarder::Forwarder).
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::net::UdpSocket;

/// A single `(downstream peer, Forwarder)` flow: the egress socket
/// dedicated to it, and its last-activity timestamp.
///
/// The timestamp is stored as milliseconds elapsed since a fixed
/// per-`Forwarder` epoch so that updates never require a lock, per
/// SPEC_FULL.md's representation notes.
#[derive(Debug)]
pub struct FlowEntry {
    socket: Arc<UdpSocket>,
    last_activity_millis: AtomicU64,
}

impl FlowEntry {
    pub fn new(socket: Arc<UdpSocket>, epoch: Instant) -> Self {
        Self {
            socket,
            last_activity_millis: AtomicU64::new(millis_since(epoch)),
        }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn touch(&self, epoch: Instant) {
        self.last_activity_millis
            .store(millis_since(epoch), Ordering::Relaxed);
    }

    /// Elapsed time since this flow was last active, relative to `epoch`.
    pub fn idle_for(&self, epoch: Instant) -> Duration {
        let now = millis_since(epoch);
        let last = self.last_activity_millis.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

fn millis_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Mapping from downstream-peer address (string form) to [`FlowEntry`].
///
/// One per `Forwarder`; guarded by a single `RwLock` at map granularity,
/// which is enough here since entries are plain data (the egress socket
/// is independently usable via its own `Arc` clone once a reader has
/// released the lock) and iteration (idle sweep) tolerates a stale
/// snapshot, per the "concurrent map" design note.
#[derive(Debug, Default)]
pub struct FlowTable {
    entries: RwLock<HashMap<String, FlowEntry>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket for an existing flow, if any.
    pub fn get_socket(&self, peer: &str) -> Option<Arc<UdpSocket>> {
        self.entries.read().get(peer).map(|e| e.socket().clone())
    }

    /// Inserts a new flow. Returns `false` (and does nothing) if a flow
    /// for this peer already exists, since insertion only ever happens
    /// from the single serialized send task after observing a cache
    /// miss there is no legitimate race here, but the check keeps the
    /// table's "at most one entry per peer" invariant explicit.
    pub fn insert_if_absent(&self, peer: String, entry: FlowEntry) -> bool {
        let mut table = self.entries.write();
        if table.contains_key(&peer) {
            return false;
        }
        table.insert(peer, entry);
        true
    }

    pub fn touch(&self, peer: &str, epoch: Instant) {
        if let Some(entry) = self.entries.read().get(peer) {
            entry.touch(epoch);
        }
    }

    /// Updates `peer`'s last-activity timestamp only if it has been idle
    /// for strictly more than `threshold`. Skips the write entirely
    /// otherwise, since the timestamp is about to be read as "recent"
    /// either way.
    pub fn touch_if_stale(&self, peer: &str, epoch: Instant, threshold: Duration) {
        if let Some(entry) = self.entries.read().get(peer) {
            if entry.idle_for(epoch) > threshold {
                entry.touch(epoch);
            }
        }
    }

    /// Removes a flow, returning its socket so the caller can decide
    /// whether anything further needs to happen with it (dropping it is
    /// enough to let the OS reclaim the port once every `Arc` clone is
    /// gone).
    pub fn remove(&self, peer: &str) -> Option<Arc<UdpSocket>> {
        self.entries.write().remove(peer).map(|e| e.socket)
    }

    /// Removes every entry idle for strictly longer than `idle_for`,
    /// relative to `epoch`: `last_activity < now - idle_for`. An entry
    /// survives if it was touched at or after that threshold.
    pub fn evict_idle(&self, idle_for: Duration, epoch: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.idle_for(epoch) > idle_for)
            .map(|(peer, _)| peer.clone())
            .collect();

        let mut table = self.entries.write();
        let mut evicted = Vec::with_capacity(stale.len());
        for peer in stale {
            // A flow removed concurrently by its own read task (on a
            // read error) is skipped benignly.
            if table.remove(&peer).is_some() {
                evicted.push(peer);
            }
        }
        evicted
    }

    /// Drains every entry, e.g. at shutdown.
    pub fn drain(&self) -> Vec<(String, Arc<UdpSocket>)> {
        self.entries
            .write()
            .drain()
            .map(|(peer, entry)| (peer, entry.socket))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    async fn fresh_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn touch_if_stale_skips_write_below_threshold() {
        let epoch = Instant::now() - StdDuration::from_millis(500);
        let table = FlowTable::new();
        table.insert_if_absent("peer-a".into(), FlowEntry::new(fresh_socket().await, epoch));
        table.touch("peer-a", epoch);
        let before = {
            let entries = table.entries.read();
            entries.get("peer-a").unwrap().idle_for(epoch)
        };
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        table.touch_if_stale("peer-a", epoch, StdDuration::from_secs(10));
        let after = {
            let entries = table.entries.read();
            entries.get("peer-a").unwrap().idle_for(epoch)
        };
        assert!(after >= before);
        assert!(after < StdDuration::from_secs(10));
    }

    #[tokio::test]
    async fn touch_if_stale_updates_once_past_threshold() {
        let epoch = Instant::now() - StdDuration::from_millis(500);
        let table = FlowTable::new();
        table.insert_if_absent("peer-a".into(), FlowEntry::new(fresh_socket().await, epoch));
        table.touch("peer-a", epoch);
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        table.touch_if_stale("peer-a", epoch, StdDuration::from_millis(10));
        let idle = {
            let entries = table.entries.read();
            entries.get("peer-a").unwrap().idle_for(epoch)
        };
        assert!(idle < StdDuration::from_millis(10));
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let epoch = Instant::now();
        let table = FlowTable::new();
        let socket = fresh_socket().await;
        let local = socket.local_addr().unwrap();
        assert!(table.insert_if_absent("peer-a".into(), FlowEntry::new(socket, epoch)));
        assert_eq!(
            table.get_socket("peer-a").unwrap().local_addr().unwrap(),
            local
        );
    }

    #[tokio::test]
    async fn insert_if_absent_rejects_duplicate_key() {
        let epoch = Instant::now();
        let table = FlowTable::new();
        assert!(table.insert_if_absent("peer-a".into(), FlowEntry::new(fresh_socket().await, epoch)));
        assert!(!table.insert_if_absent("peer-a".into(), FlowEntry::new(fresh_socket().await, epoch)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn evict_idle_removes_only_stale_entries() {
        let epoch = Instant::now() - StdDuration::from_millis(500);
        let table = FlowTable::new();
        table.insert_if_absent("stale".into(), FlowEntry::new(fresh_socket().await, epoch));
        // `fresh` is touched "now", relative to the same epoch.
        table.insert_if_absent("fresh".into(), FlowEntry::new(fresh_socket().await, epoch));
        table.touch("fresh", epoch);

        // Force "stale" to look old by rewinding nothing further: since
        // both were created at the same instant, simulate aging by
        // sleeping past the threshold for one of them only via a second
        // touch on the survivor.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        table.touch("fresh", epoch);

        let evicted = table.evict_idle(StdDuration::from_millis(10), epoch);
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(table.get_socket("fresh").is_some());
        assert!(table.get_socket("stale").is_none());
    }

    #[tokio::test]
    async fn remove_returns_socket_and_clears_entry() {
        let epoch = Instant::now();
        let table = FlowTable::new();
        table.insert_if_absent("peer-a".into(), FlowEntry::new(fresh_socket().await, epoch));
        assert!(table.remove("peer-a").is_some());
        assert!(table.get_socket("peer-a").is_none());
        assert!(table.remove("peer-a").is_none());
    }

    #[tokio::test]
    async fn drain_empties_the_table() {
        let epoch = Instant::now();
        let table = FlowTable::new();
        table.insert_if_absent("a".into(), FlowEntry::new(fresh_socket().await, epoch));
        table.insert_if_absent("b".into(), FlowEntry::new(fresh_socket().await, epoch));
        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
