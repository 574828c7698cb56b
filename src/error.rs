//! Top-level error types.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use thiserror::Error;

/// Errors that can abort the process at startup.
///
/// Per the error-handling design, these are the only fatal error kinds:
/// a configuration error, a failure to bind the listener socket, or a
/// failure to write the PID file. Every other failure (resolve, send,
/// read, per-mirror startup resolve) is transient and is logged rather
/// than propagated.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::Error),
    #[error(transparent)]
    Multiplex(#[from] crate::multiplex::Error),
    #[error("failed to write PID file: {0}")]
    PidFile(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
