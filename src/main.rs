//! A connectionless UDP datagram fan-out multiplexer.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
#![forbid(unsafe_code)]

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, trace};
#[cfg(not(feature = "tokio-console"))]
use tracing_subscriber::{fmt, prelude::*, reload};

use udp_fanout_core::config::{normalize_argv, Args, Config};
use udp_fanout_core::multiplex::{MirrorTarget, Multiplexer};
use udp_fanout_core::shutdown::Shutdown;
use udp_fanout_core::{pidfile, signal, Error};

#[cfg(feature = "deadlock-detection")]
fn spawn_deadlock_detection() {
    use std::thread;

    thread::spawn(move || loop {
        thread::sleep(std::time::Duration::from_secs(10));
        let deadlocks = parking_lot::deadlock::check_deadlock();
        if deadlocks.is_empty() {
            continue;
        }

        error!("{} deadlocks detected", deadlocks.len());
        for (i, threads) in deadlocks.iter().enumerate() {
            error!("Deadlock #{}", i);
            for t in threads {
                error!("Thread Id {:#?}", t.thread_id());
                error!("{:#?}", t.backtrace());
            }
        }
    });
}

async fn main_real() -> Result<(), Error> {
    #[cfg(not(feature = "tokio-console"))]
    let reload_handle = {
        let fmt_layer = fmt::Layer::default()
            .compact()
            .with_timer(fmt::time::time())
            .with_writer(std::io::stderr);
        let (level_layer, reload_handle) =
            reload::Layer::new(tracing_subscriber::filter::LevelFilter::INFO);
        tracing_subscriber::registry()
            .with(level_layer)
            .with(fmt_layer)
            .init();
        reload_handle
    };
    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    let args = Args::parse_from(normalize_argv(std::env::args()));
    trace!("cli_args = {args:?}");
    let config = Config::from_args(args)?;

    #[cfg(not(feature = "tokio-console"))]
    reload_handle
        .reload(config.level.as_filter())
        .expect("resetting log level failed (this is a bug)");

    #[cfg(feature = "deadlock-detection")]
    spawn_deadlock_detection();

    pidfile::write(&config.pid_file).map_err(Error::PidFile)?;

    let mirrors = config
        .mirrors
        .iter()
        .map(|item| MirrorTarget {
            host: item.host.clone(),
            port: item.port,
        })
        .collect();

    let multiplexer = Multiplexer::new(
        config.listen,
        mirrors,
        config.connect_timeout,
        config.resolve_ttl,
        config.buffer_size,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(signal::wait_and_notify(shutdown_tx));

    multiplexer.run(Shutdown::new(shutdown_rx)).await;
    multiplexer.shutdown().await;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = main_real().await {
        error!("Giving up: {e}");
        std::process::exit(1);
    }
}
