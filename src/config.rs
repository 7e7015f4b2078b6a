use std::collections::HashMap;
use std::fs::read_to_string;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

/// One entry of the JSON rule file: the target a forwarded connection
/// should eventually reach, on whichever device owns `uuid`.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub uuid: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
}

/// The rule file maps a local listen address (`"host:port"`) to the target
/// it should forward to. Loaded once at startup; immutable afterward.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RuleFile {
    pub rules: HashMap<String, Target>,
}

impl RuleFile {
    ///
    /// Load the rule file from `path`, if given.
    ///
    /// Absent, unreadable, or malformed rule files yield an empty rule set
    /// rather than a hard error: static forwarding is optional functionality
    /// layered on top of the broker, not a precondition for it to run.
    ///
    pub fn load(path: Option<&str>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = match read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("failed to read rule file {path}: {err}");
                return Ok(Self::default());
            }
        };

        match serde_json::from_str(&raw) {
            Ok(rules) => Ok(rules),
            Err(err) => {
                log::error!("failed to parse rule file {path}: {err}");
                Ok(Self::default())
            }
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    about = "Reverse TCP tunnel broker server.",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct ServerCli {
    ///
    /// Address the broker listens on for both device control connections
    /// and relay-ingress connections.
    ///
    #[arg(long, short, default_value = "127.0.0.1:8388")]
    pub host: String,
    ///
    /// Optional JSON rule file of static `listen host -> target` forwards.
    ///
    #[arg(long, short)]
    pub rules: Option<String>,
    ///
    /// Optional SOCKS5 ingress listen address.
    ///
    #[arg(long)]
    pub s5_server: Option<String>,
    ///
    /// Logging verbosity.
    ///
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Parser, Debug)]
#[command(
    about = "Reverse TCP tunnel broker device client.",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
pub struct ClientCli {
    ///
    /// This device's identity. Must be unique among devices registered with
    /// the same server.
    ///
    #[arg(long, short)]
    pub uuid: String,
    ///
    /// Broker server address to register with.
    ///
    #[arg(long, short)]
    pub server: String,
    ///
    /// Optional outbound SOCKS5 proxy used to reach the server.
    ///
    #[arg(long)]
    pub s5_proxy: Option<String>,
    ///
    /// Optional JSON rule file of static `listen host -> target` forwards
    /// initiated from this device.
    ///
    #[arg(long, short)]
    pub rules: Option<String>,
    ///
    /// Optional local SOCKS5 ingress listen address.
    ///
    #[arg(long)]
    pub s5_server: Option<String>,
    ///
    /// Logging verbosity.
    ///
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}
