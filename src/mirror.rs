//! A configured upstream mirror and its periodically re-resolved address.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::net::lookup_host;
use tracing::{debug, warn};

/// A single configured mirror destination.
///
/// `host`/`port` are immutable for the lifetime of the mirror; the
/// resolved address is mutated only by [`MirrorSpec::reresolve`] and is
/// read by the send path through an atomic publish/load, per the
/// "atomic address swap" design note: readers tolerate a stale value
/// for at most the resolve TTL.
#[derive(Debug)]
pub struct MirrorSpec {
    host: String,
    port: u16,
    resolved: ArcSwap<SocketAddr>,
}

impl MirrorSpec {
    /// Resolves `host:port` and, on success, returns a new `MirrorSpec`
    /// pinned to that address.
    pub async fn resolve(host: String, port: u16) -> std::io::Result<Self> {
        let resolved = resolve_one(&host, port).await?;
        Ok(Self {
            host,
            port,
            resolved: ArcSwap::from_pointee(resolved),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current resolved destination address. Never blocks.
    pub fn address(&self) -> SocketAddr {
        **self.resolved.load()
    }

    /// Re-resolves `host:port`. If the resolved address differs
    /// (textually) from the current one, installs it atomically.
    /// Resolution errors are logged and the previous address retained.
    pub async fn reresolve(&self) {
        match resolve_one(&self.host, self.port).await {
            Ok(new_addr) => {
                let current = self.address();
                if new_addr != current {
                    debug!(
                        mirror = %format!("{}:{}", self.host, self.port),
                        from = %current,
                        to = %new_addr,
                        "switching forward upstream"
                    );
                    self.resolved.store(Arc::new(new_addr));
                }
            }
            Err(e) => {
                warn!(
                    mirror = %format!("{}:{}", self.host, self.port),
                    error = %e,
                    "failed to re-resolve upstream address, retaining previous"
                );
            }
        }
    }
}

async fn resolve_one(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("could not resolve {host}:{port} to any address"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_loopback_literal() {
        let mirror = MirrorSpec::resolve("127.0.0.1".into(), 9100).await.unwrap();
        assert_eq!(mirror.address(), "127.0.0.1:9100".parse().unwrap());
    }

    #[tokio::test]
    async fn reresolve_keeps_address_when_unchanged() {
        let mirror = MirrorSpec::resolve("127.0.0.1".into(), 9100).await.unwrap();
        let before = mirror.address();
        mirror.reresolve().await;
        assert_eq!(mirror.address(), before);
    }

    #[tokio::test]
    async fn resolve_rejects_unresolvable_host() {
        let result = MirrorSpec::resolve("this.host.does.not.resolve.invalid".into(), 1).await;
        assert!(result.is_err());
    }
}
