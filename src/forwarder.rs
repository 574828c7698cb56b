//! Forwards UDP packets from downstream to a single upstream mirror.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Owns a mapping from downstream-peer address to a dedicated egress
//! socket, one per flow. Ported from `original_source/proxy/forward.go`'s
//! `Forwarder`, generalized from a single global buffer pool to a shared
//! [`BufferPool`] handle and from `sync.Map`/goroutines to a
//! `parking_lot`-guarded [`FlowTable`] plus `tokio` tasks.

use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::buffer::{Buffer, BufferPool};
use crate::flow::{FlowEntry, FlowTable};
use crate::mirror::MirrorSpec;
use crate::shutdown::Shutdown;

/// Depth of the channel between `Multiplexer::run` and a `Forwarder`'s
/// send task. A full channel makes `forward()` block, which is the
/// documented backpressure point (spec.md §5).
const SEND_QUEUE_DEPTH: usize = 1024;

/// Depth of the channel between a flow's read task and the drain task.
const DRAIN_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connect/idle timeout must be greater than zero")]
    ZeroConnectTimeout,
    #[error("resolve TTL must be greater than zero")]
    ZeroResolveTtl,
}

struct SendJob {
    peer: SocketAddr,
    buffer: Buffer,
}

/// Forwards every datagram it receives to one upstream mirror, through
/// a dedicated egress socket per downstream peer.
pub struct Forwarder {
    mirror: MirrorSpec,
    /// IP (and, for a scoped IPv6 listener, zone id) to bind egress
    /// sockets to (the listener's own local address), so that
    /// source-address selection for the mirror is stable and strict-RPF
    /// upstreams behave predictably. Kept as a full `SocketAddr` (port
    /// ignored, always rebound to 0) rather than a bare `IpAddr` since
    /// `IpAddr` cannot carry an IPv6 scope id.
    bind_addr: SocketAddr,
    connect_timeout: Duration,
    resolve_ttl: Duration,
    flow_table: FlowTable,
    buffer_pool: BufferPool,
    epoch: Instant,
    closed: AtomicBool,
    reply_count: AtomicU64,
    send_tx: mpsc::Sender<SendJob>,
    send_rx: parking_lot::Mutex<Option<mpsc::Receiver<SendJob>>>,
    drain_tx: parking_lot::Mutex<Option<mpsc::Sender<Buffer>>>,
    shutdown_tx: broadcast::Sender<()>,
    /// Retained so the channel stays open while the forwarder is
    /// running; `shutdown()` drops it so the receiver side can observe
    /// closure once every spawned task's own clone is also dropped.
    complete_tx: parking_lot::Mutex<Option<mpsc::Sender<()>>>,
    complete_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("mirror", &self.mirror_label())
            .field("flows", &self.flow_table.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Forwarder {
    /// Builds a new `Forwarder`. `bind_addr` is the listener's own local
    /// address (its IP, and zone id if it's a scoped IPv6 address),
    /// reused for every egress socket this forwarder opens; its port is
    /// ignored.
    pub fn new(
        bind_addr: SocketAddr,
        mirror: MirrorSpec,
        connect_timeout: Duration,
        resolve_ttl: Duration,
        buffer_pool: BufferPool,
    ) -> Result<Self, Error> {
        if connect_timeout.is_zero() {
            return Err(Error::ZeroConnectTimeout);
        }
        if resolve_ttl.is_zero() {
            return Err(Error::ZeroResolveTtl);
        }
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Ok(Self {
            mirror,
            bind_addr,
            connect_timeout,
            resolve_ttl,
            flow_table: FlowTable::new(),
            buffer_pool,
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
            reply_count: AtomicU64::new(0),
            send_tx,
            send_rx: parking_lot::Mutex::new(Some(send_rx)),
            drain_tx: parking_lot::Mutex::new(None),
            shutdown_tx,
            complete_tx: parking_lot::Mutex::new(Some(complete_tx)),
            complete_rx: tokio::sync::Mutex::new(Some(complete_rx)),
        })
    }

    pub fn mirror(&self) -> &MirrorSpec {
        &self.mirror
    }

    pub fn flow_count(&self) -> usize {
        self.flow_table.len()
    }

    /// Number of reply datagrams drained (and discarded) from upstream
    /// so far. Diagnostic only; see SPEC_FULL.md §9A.
    pub fn reply_count(&self) -> u64 {
        self.reply_count.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn shutdown_handle(&self) -> Shutdown {
        Shutdown::new(self.shutdown_tx.subscribe())
    }

    /// Schedules the four long-running background tasks. Idempotent
    /// only via the `closed` guard: starting after shutdown is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let send_rx = self
            .send_rx
            .lock()
            .take()
            .expect("Forwarder::start called more than once");

        tokio::spawn(self.clone().send_task(send_rx, self.shutdown_handle(), self.complete_handle()));

        let (drain_tx, drain_rx) = mpsc::channel(DRAIN_QUEUE_DEPTH);
        tokio::spawn(self.clone().drain_task(drain_rx, self.shutdown_handle(), self.complete_handle()));
        // Stash `drain_tx` where `open_flow_and_send` can reach it: each
        // newly opened flow's read task needs its own clone.
        *self.drain_tx.lock() = Some(drain_tx);

        tokio::spawn(self.clone().idle_sweep_task(self.shutdown_handle(), self.complete_handle()));
        tokio::spawn(self.clone().resolve_task(self.shutdown_handle(), self.complete_handle()));

        debug!(mirror = %self.mirror_label(), "forwarder started");
    }

    /// A clone of the shutdown-complete sender, for a newly spawned
    /// task to hold for its own lifetime.
    fn complete_handle(&self) -> mpsc::Sender<()> {
        self.complete_tx
            .lock()
            .clone()
            .expect("complete_handle called after shutdown")
    }

    fn mirror_label(&self) -> String {
        format!("{}:{}", self.mirror.host(), self.mirror.port())
    }

    /// The address a new egress socket should bind to: `bind_addr`'s IP
    /// (and, for IPv6, its zone id) with an OS-assigned port.
    fn egress_bind_addr(&self) -> SocketAddr {
        match self.bind_addr {
            SocketAddr::V4(v4) => SocketAddr::V4(SocketAddrV4::new(*v4.ip(), 0)),
            SocketAddr::V6(v6) => {
                SocketAddr::V6(SocketAddrV6::new(*v6.ip(), 0, v6.flowinfo(), v6.scope_id()))
            }
        }
    }

    /// Enqueues a packet for the send task. Copies `data` into a
    /// pool-owned buffer at this boundary: the caller's own buffer is
    /// released back to its pool as soon as every forwarder has
    /// returned from this call, regardless of what happens to the copy
    /// afterwards.
    pub async fn forward(&self, peer: SocketAddr, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        let mut buf = self.buffer_pool.acquire();
        let cap = buf.capacity();
        let n = data.len().min(cap);
        buf.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        buf.truncate(n);
        // A bounded channel makes this a genuine suspension point: if
        // the send task is behind, this blocks, and that block
        // propagates as backpressure to whoever called `forward`.
        if self.send_tx.send(SendJob { peer, buffer: buf }).await.is_err() {
            // Send task already gone (shutting down); drop the packet.
        }
    }

    /// Sets `closed`, closes every egress socket, wakes every
    /// background task, and returns once they have all observed
    /// closure.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for (_, socket) in self.flow_table.drain() {
            drop(socket);
        }
        // Drop our own retained sender so the channel closes once every
        // spawned task's clone is also dropped.
        self.complete_tx.lock().take();
        let mut guard = self.complete_rx.lock().await;
        if let Some(mut rx) = guard.take() {
            while rx.recv().await.is_some() {}
        }
    }

    async fn send_task(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SendJob>,
        mut shutdown: Shutdown,
        _complete: mpsc::Sender<()>,
    ) {
        loop {
            let job = tokio::select! {
                _ = shutdown.recv() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.handle_send(job).await;
        }
        trace!(mirror = %self.mirror_label(), "send task finished");
    }

    async fn handle_send(self: &Arc<Self>, job: SendJob) {
        let peer_key = job.peer.to_string();
        let dest = self.mirror.address();

        if let Some(socket) = self.flow_table.get_socket(&peer_key) {
            match socket.send_to(job.buffer.as_slice(), dest).await {
                Ok(_) => self.flow_table.touch_if_stale(
                    &peer_key,
                    self.epoch,
                    self.connect_timeout / 4,
                ),
                Err(e) => warn!(peer = %job.peer, mirror = %dest, error = %e, "send failed, dropping datagram"),
            }
        } else {
            self.open_flow_and_send(job.peer, &peer_key, &job.buffer, dest)
                .await;
        }

        self.buffer_pool.release(job.buffer);
    }

    async fn open_flow_and_send(
        self: &Arc<Self>,
        peer: SocketAddr,
        peer_key: &str,
        buf: &Buffer,
        dest: SocketAddr,
    ) {
        let socket = match UdpSocket::bind(self.egress_bind_addr()).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to open egress socket, dropping datagram");
                return;
            }
        };
        trace!(peer = %peer, local = ?socket.local_addr().ok(), "opened new flow");

        if let Err(e) = socket.send_to(buf.as_slice(), dest).await {
            warn!(peer = %peer, mirror = %dest, error = %e, "send failed on new flow, dropping datagram");
            // No table entry created for a flow whose first send failed.
            return;
        }

        let entry = FlowEntry::new(socket.clone(), self.epoch);
        if !self.flow_table.insert_if_absent(peer_key.to_string(), entry) {
            // Lost a race with... nothing, actually: the send task is
            // the only writer. Kept for robustness against future
            // multi-send-task designs.
            return;
        }

        let drain_tx = self.drain_tx.lock().clone();
        if let Some(drain_tx) = drain_tx {
            let read_shutdown = self.shutdown_handle();
            let complete = self.complete_handle();
            tokio::spawn(
                self.clone()
                    .read_task(peer, peer_key.to_string(), socket, drain_tx, read_shutdown, complete),
            );
        }
    }

    async fn read_task(
        self: Arc<Self>,
        peer: SocketAddr,
        peer_key: String,
        socket: Arc<UdpSocket>,
        drain_tx: mpsc::Sender<Buffer>,
        mut shutdown: Shutdown,
        _complete: mpsc::Sender<()>,
    ) {
        loop {
            let mut buf = self.buffer_pool.acquire();
            let outcome = tokio::select! {
                _ = shutdown.recv() => {
                    self.buffer_pool.release(buf);
                    break;
                }
                res = socket.recv_from(buf.as_mut_slice()) => res,
            };
            match outcome {
                Ok((n, _from)) => {
                    buf.truncate(n);
                    self.flow_table.touch(&peer_key, self.epoch);
                    if drain_tx.send(buf).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "read error, closing flow");
                    self.buffer_pool.release(buf);
                    break;
                }
            }
        }
        self.flow_table.remove(&peer_key);
    }

    async fn drain_task(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Buffer>,
        mut shutdown: Shutdown,
        _complete: mpsc::Sender<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                maybe = rx.recv() => match maybe {
                    Some(buf) => {
                        self.buffer_pool.release(buf);
                        self.reply_count.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                },
            }
        }
    }

    async fn idle_sweep_task(self: Arc<Self>, mut shutdown: Shutdown, _complete: mpsc::Sender<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.connect_timeout) => {}
            }
            if shutdown.is_shutdown() {
                break;
            }
            let evicted = self.flow_table.evict_idle(self.connect_timeout, self.epoch);
            for peer in evicted {
                trace!(peer = %peer, mirror = %self.mirror_label(), "evicted idle flow");
            }
        }
    }

    async fn resolve_task(self: Arc<Self>, mut shutdown: Shutdown, _complete: mpsc::Sender<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.resolve_ttl) => {}
            }
            if shutdown.is_shutdown() {
                break;
            }
            self.mirror.reresolve().await;
        }
    }
}
