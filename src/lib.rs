//! Core datapath for a connectionless UDP fan-out multiplexer.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Reads datagrams on a single listener socket and forwards a copy of
//! each to every configured mirror, through a dedicated egress socket
//! per downstream peer. See [`multiplex::Multiplexer`] for the entry
//! point and [`forwarder::Forwarder`] for the per-mirror datapath.
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod flow;
pub mod forwarder;
pub mod mirror;
pub mod multiplex;
pub mod pidfile;
pub mod shutdown;
pub mod signal;

pub use error::{Error, Result};
pub use multiplex::Multiplexer;
