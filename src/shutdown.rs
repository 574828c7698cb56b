//! Listen for the server shutdown signal.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `Shutdown` is a thin wrapper around a [`broadcast::Receiver`] that
//! every background task (and every dynamically spawned per-flow read
//! task) holds one of. It implements the "single shutdown channel fans
//! out to all tasks" requirement: every task races its own suspension
//! points against `Shutdown::recv` in a `tokio::select!` and exits
//! promptly once notified.

use tokio::sync::broadcast;

/// Listens for the server shutdown signal.
///
/// Shutdown is signalled using a `broadcast::channel`. Only a single
/// value is ever sent. Once a value has been sent via the broadcast
/// channel, the server should shut down. `Shutdown` tracks whether this
/// has already happened so callers can check repeatedly without
/// awaiting the channel more than once.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received.
    shutdown: bool,
    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Creates a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Self {
        Self {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Clones this handle's subscription, independent of whether this
    /// handle has already observed shutdown.
    pub fn resubscribe(&self) -> Self {
        Self {
            shutdown: self.shutdown,
            notify: self.notify.resubscribe(),
        }
    }

    /// Receives the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }
        // A `RecvError::Lagged` cannot happen with a single `()` ever
        // sent, and a `RecvError::Closed` just means the sender side
        // was dropped without notifying, which for our purposes also
        // means "shut down".
        let _ = self.notify.recv().await;
        self.shutdown = true;
    }
}
