//! Unix signal handling that feeds the shutdown broadcast channel.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Ported from `original_source/pkg/utils/signal.go`'s `SignalHandler`,
//! which listens for SIGHUP/SIGINT/SIGTERM/SIGQUIT and emits a single
//! notification on whichever arrives first. Generalized here to publish
//! onto the same `broadcast::Sender<()>` that every `Forwarder` task and
//! the `Multiplexer`'s receive loop already subscribe to via
//! [`crate::shutdown::Shutdown`].

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::info;

/// Waits for SIGHUP, SIGINT, SIGTERM, or SIGQUIT, whichever comes
/// first, then sends a single shutdown notification on `shutdown_tx`.
/// Runs until a signal arrives or every signal stream's process-level
/// registration fails; does not retry failed registration.
pub async fn wait_and_notify(shutdown_tx: broadcast::Sender<()>) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGHUP handler");
            return;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGQUIT handler");
            return;
        }
    };

    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };

    info!(signal = name, "received signal, shutting down");
    let _ = shutdown_tx.send(());
}
