//! The listener socket and the set of forwarders it fans datagrams out to.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Ported from `original_source/proxy/multiplex.go`'s `Multiplex`, which
//! owns the listening `net.PacketConn` and loops reading datagrams,
//! handing each to every configured `Forwarder` in turn.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::buffer::BufferPool;
use crate::forwarder::Forwarder;
use crate::mirror::MirrorSpec;
use crate::shutdown::Shutdown;

/// One configured mirror destination, as accepted by [`Multiplexer::new`].
#[derive(Debug, Clone)]
pub struct MirrorTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind listener socket {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
}

/// Owns the listener socket and every [`Forwarder`]; drives the receive
/// loop that fans each datagram out to all of them.
pub struct Multiplexer {
    listener: UdpSocket,
    forwarders: Vec<Arc<Forwarder>>,
    buffer_pool: BufferPool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("local_addr", &self.local_addr().ok())
            .field("forwarders", &self.forwarders.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Multiplexer {
    /// Binds the listener and constructs a `Forwarder` for every mirror
    /// that resolves. A mirror whose address fails to resolve at startup
    /// is logged and skipped; if every mirror fails, the multiplexer
    /// still runs, forwarding to nobody (NO-forwarding mode).
    pub async fn new(
        listen_addr: SocketAddr,
        mirrors: Vec<MirrorTarget>,
        connect_timeout: Duration,
        resolve_ttl: Duration,
        buffer_size: usize,
    ) -> Result<Self, Error> {
        let listener = UdpSocket::bind(listen_addr)
            .await
            .map_err(|e| Error::Bind(listen_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Bind(listen_addr, e))?;

        let buffer_pool = BufferPool::new(buffer_size);
        let mut forwarders = Vec::with_capacity(mirrors.len());
        for target in mirrors {
            match MirrorSpec::resolve(target.host.clone(), target.port).await {
                Ok(spec) => {
                    match Forwarder::new(
                        local_addr,
                        spec,
                        connect_timeout,
                        resolve_ttl,
                        buffer_pool.clone(),
                    ) {
                        Ok(forwarder) => forwarders.push(Arc::new(forwarder)),
                        Err(e) => warn!(
                            mirror = %format!("{}:{}", target.host, target.port),
                            error = %e,
                            "skipping mirror"
                        ),
                    }
                }
                Err(e) => warn!(
                    mirror = %format!("{}:{}", target.host, target.port),
                    error = %e,
                    "failed to resolve mirror at startup, skipping"
                ),
            }
        }

        if forwarders.is_empty() {
            warn!("no mirrors resolved; running in no-forwarding mode");
        }

        Ok(Self {
            listener,
            forwarders,
            buffer_pool,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn forwarder_count(&self) -> usize {
        self.forwarders.len()
    }

    /// Starts every forwarder's background tasks, then loops: read one
    /// datagram, hand it to every forwarder in order, release the
    /// buffer. Returns once `shutdown` fires.
    pub async fn run(&self, mut shutdown: Shutdown) {
        for forwarder in &self.forwarders {
            forwarder.start();
        }

        info!(
            listen = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            mirrors = self.forwarders.len(),
            "multiplexer running"
        );

        loop {
            let mut buf = self.buffer_pool.acquire();
            let received = tokio::select! {
                _ = shutdown.recv() => break,
                res = self.listener.recv_from(buf.as_mut_slice()) => res,
            };

            match received {
                Ok((n, peer)) => {
                    buf.truncate(n);
                    for forwarder in &self.forwarders {
                        forwarder.forward(peer, buf.as_slice()).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "listener read error");
                }
            }

            self.buffer_pool.release(buf);
        }

        info!("multiplexer receive loop stopped");
    }

    /// Idempotent. Stops accepting new work and waits for every
    /// forwarder to drain its background tasks.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for forwarder in &self.forwarders {
            forwarder.shutdown().await;
        }
    }
}
