//! Command-line surface for the datapath binary.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Flags mirror `original_source/proxy/config.go`'s `flag.Var`-based
//! parsing (`-l`, `-m`, `-t`, `-d`/`-ttl`, `-level`, `-v`, `-h`), ported
//! onto `clap`'s derive API. Since `clap` short-flag clusters a
//! multi-character single-dash token against any defined short flag that
//! shares its first letter, `-level` and `-ttl` are rewritten to their
//! double-dash form by [`normalize_argv`] before parsing, so they're not
//! swallowed by `-l`/`-t` as attached values.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid listen address {0:?}: {1}")]
    ListenAddr(String, #[source] std::net::AddrParseError),
    #[error("no mirror targets given")]
    NoMirrors,
    #[error("connect/idle timeout must be greater than zero")]
    ZeroConnectTimeout,
    #[error("resolve TTL must be greater than zero")]
    ZeroResolveTtl,
    #[error("buffer size must be greater than zero")]
    ZeroBufferSize,
}

/// Log verbosity, matching the original program's four levels. `Fatal`
/// filters at the same level as `Error` (`tracing` has no separate
/// "fatal" level) but a `fatal!`-logged event additionally aborts the
/// process once emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

/// One `host:port` mirror item as given on the command line. Parsing
/// never fails: a malformed item is logged and dropped by
/// [`parse_mirror_list`], matching the original's "log and skip"
/// behavior for `-m`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorItem {
    pub host: String,
    pub port: u16,
}

fn parse_mirror_list(raw: &str) -> Result<Vec<MirrorItem>, std::convert::Infallible> {
    let mut items = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => items.push(MirrorItem {
                    host: host.to_string(),
                    port,
                }),
                Err(e) => warn!(item = entry, error = %e, "bad port number of mirror item, skipping"),
            },
            None => warn!(item = entry, "bad format of mirror item, skipping"),
        }
    }
    Ok(items)
}

/// Rewrites the original program's literal single-dash long flags
/// (`-level`, `-ttl`) to their double-dash `clap` spellings before
/// parsing.
///
/// `clap` treats a single-dash multi-character token as short-flag
/// clustering: `-level debug` is parsed as `-l` (`listen`, a value arg)
/// with `"evel"` attached as its value, never reaching the log-level
/// code, and `-ttl 20ms` is likewise swallowed by `-t`
/// (`connect_timeout`) as `-t tl`. The original flag parser (Go's
/// `flag` package) treats single- and double-dash spellings of a named
/// flag identically; this restores that surface for the two flags whose
/// names happen to collide with another flag's short form.
pub fn normalize_argv<I, T>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    const LONG_ONLY: [&str; 2] = ["level", "ttl"];

    args.into_iter()
        .map(|arg| {
            let arg = arg.into();
            for name in LONG_ONLY {
                if arg == format!("-{name}") {
                    return format!("--{name}");
                }
                if let Some(value) = arg.strip_prefix(&format!("-{name}=")) {
                    return format!("--{name}={value}");
                }
            }
            arg
        })
        .collect()
}

/// UDP fan-out datapath: reads datagrams on `-l` and forwards a copy of
/// each to every `-m` mirror.
#[derive(Debug, Parser)]
#[command(name = "udp-fanout", version, about)]
pub struct Args {
    /// Print version and exit. `clap` already binds `--version`/`-V`;
    /// `-v` is an explicit alias to match the documented flag exactly.
    #[arg(short = 'v', long = "version-short", action = clap::ArgAction::Version, hide = true)]
    version_short: (),

    /// Listener bind address, host:port.
    #[arg(short = 'l', long = "listen")]
    pub listen: String,

    /// Comma-separated list of mirror destinations, host:port,host:port,...
    #[arg(short = 'm', long = "mirrors", value_parser = parse_mirror_list)]
    pub mirrors: Vec<MirrorItem>,

    /// Connect/idle timeout.
    #[arg(short = 't', long = "timeout", default_value = "500ms", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Mirror re-resolve period. `-ttl` (single dash) also works; see
    /// [`normalize_argv`].
    #[arg(short = 'd', long = "ttl", alias = "resolve-ttl", default_value = "20ms", value_parser = humantime::parse_duration)]
    pub resolve_ttl: Duration,

    /// Log verbosity. `-level` (single dash) also works; see
    /// [`normalize_argv`].
    #[arg(long = "level", value_enum, default_value = "info")]
    pub level: LogLevel,

    /// Maximum datagram payload size; larger reads are truncated.
    #[arg(long = "buffer-size", default_value_t = 10_240)]
    pub buffer_size: usize,

    /// Write the process ID to this file at startup. Empty means no file.
    #[arg(long = "pid-file", default_value = "")]
    pub pid_file: PathBuf,
}

/// Parsed and validated configuration, ready to build a [`crate::multiplex::Multiplexer`].
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub mirrors: Vec<MirrorItem>,
    pub connect_timeout: Duration,
    pub resolve_ttl: Duration,
    pub level: LogLevel,
    pub buffer_size: usize,
    pub pid_file: PathBuf,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, Error> {
        let listen = args
            .listen
            .parse()
            .map_err(|e| Error::ListenAddr(args.listen.clone(), e))?;
        if args.mirrors.is_empty() {
            return Err(Error::NoMirrors);
        }
        if args.connect_timeout.is_zero() {
            return Err(Error::ZeroConnectTimeout);
        }
        if args.resolve_ttl.is_zero() {
            return Err(Error::ZeroResolveTtl);
        }
        if args.buffer_size == 0 {
            return Err(Error::ZeroBufferSize);
        }
        Ok(Self {
            listen,
            mirrors: args.mirrors,
            connect_timeout: args.connect_timeout,
            resolve_ttl: args.resolve_ttl,
            level: args.level,
            buffer_size: args.buffer_size,
            pid_file: args.pid_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mirror_list_skips_malformed_items_and_keeps_valid_ones() {
        let items = parse_mirror_list("10.0.0.1:9100,bad-item,10.0.0.2:bad-port,10.0.0.3:9200").unwrap();
        assert_eq!(
            items,
            vec![
                MirrorItem {
                    host: "10.0.0.1".into(),
                    port: 9100
                },
                MirrorItem {
                    host: "10.0.0.3".into(),
                    port: 9200
                },
            ]
        );
    }

    #[test]
    fn parse_mirror_list_ignores_blank_entries() {
        let items = parse_mirror_list("10.0.0.1:9100,,10.0.0.2:9200").unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn normalize_argv_rewrites_level_and_ttl_to_double_dash() {
        let normalized = normalize_argv([
            "udp-fanout",
            "-l",
            "127.0.0.1:9000",
            "-level",
            "debug",
            "-ttl",
            "20ms",
        ]);
        assert_eq!(
            normalized,
            vec!["udp-fanout", "-l", "127.0.0.1:9000", "--level", "debug", "--ttl", "20ms"]
        );
    }

    #[test]
    fn normalize_argv_rewrites_equals_form() {
        let normalized = normalize_argv(["udp-fanout", "-level=debug", "-ttl=20ms"]);
        assert_eq!(normalized, vec!["udp-fanout", "--level=debug", "--ttl=20ms"]);
    }

    #[test]
    fn normalize_argv_leaves_true_short_flags_untouched() {
        let normalized = normalize_argv([
            "udp-fanout",
            "-l",
            "127.0.0.1:9000",
            "-m",
            "127.0.0.1:9100",
            "-t",
            "500ms",
            "-d",
            "20ms",
            "-v",
            "-h",
        ]);
        assert_eq!(
            normalized,
            vec![
                "udp-fanout", "-l", "127.0.0.1:9000", "-m", "127.0.0.1:9100", "-t", "500ms", "-d",
                "20ms", "-v", "-h",
            ]
        );
    }

    #[test]
    fn normalize_argv_leaves_unrelated_tokens_untouched() {
        let normalized = normalize_argv(["udp-fanout", "--buffer-size", "4096", "-llisten-typo"]);
        assert_eq!(normalized, vec!["udp-fanout", "--buffer-size", "4096", "-llisten-typo"]);
    }

    fn base_args() -> Args {
        Args {
            version_short: (),
            listen: "127.0.0.1:9000".into(),
            mirrors: vec![MirrorItem {
                host: "127.0.0.1".into(),
                port: 9100,
            }],
            connect_timeout: Duration::from_millis(500),
            resolve_ttl: Duration::from_millis(20),
            level: LogLevel::Info,
            buffer_size: 10_240,
            pid_file: PathBuf::new(),
        }
    }

    #[test]
    fn from_args_accepts_well_formed_input() {
        let config = Config::from_args(base_args()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.mirrors.len(), 1);
    }

    #[test]
    fn from_args_rejects_zero_mirrors() {
        let mut args = base_args();
        args.mirrors.clear();
        assert!(matches!(Config::from_args(args), Err(Error::NoMirrors)));
    }

    #[test]
    fn from_args_rejects_zero_connect_timeout() {
        let mut args = base_args();
        args.connect_timeout = Duration::ZERO;
        assert!(matches!(
            Config::from_args(args),
            Err(Error::ZeroConnectTimeout)
        ));
    }

    #[test]
    fn from_args_rejects_unparseable_listen_address() {
        let mut args = base_args();
        args.listen = "not-an-address".into();
        assert!(matches!(Config::from_args(args), Err(Error::ListenAddr(..))));
    }
}
