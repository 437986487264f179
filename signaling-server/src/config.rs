//! Command-line configuration for the signaling server
//!
//! ```text
//! signaling-server [--bind <ip>] [--port <port>] [--metrics-port <port>]
//!                  [--strict-relay] [--advisory-timeout <secs>]
//!                  [--max-message-size <bytes>] [--idle-timeout <secs>]
//! ```
//!
//! Log verbosity comes from `RUST_LOG` (default `info`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::client::Timeouts;
use crate::relay::RelayPolicy;
use crate::signaling::MAX_MESSAGE_SIZE;

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub listen_addr: SocketAddr,
    /// Prometheus scrape endpoint, disabled when `None`
    pub metrics_addr: Option<SocketAddr>,
    /// Which destinations signaling may be relayed to
    pub relay_policy: RelayPolicy,
    /// Retract unanswered patient-waiting advisories after this long
    pub advisory_timeout: Option<Duration>,
    /// Largest inbound event accepted, in bytes
    pub max_message_size: usize,
    /// Handshake and keepalive deadlines for client connections
    pub timeouts: Timeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        ServerConfig {
            listen_addr: SocketAddr::new(any, DEFAULT_PORT),
            metrics_addr: None,
            relay_policy: RelayPolicy::Open,
            advisory_timeout: None,
            max_message_size: MAX_MESSAGE_SIZE,
            timeouts: Timeouts::default(),
        }
    }
}

/// Bad command-line input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Flag given without a value
    MissingValue(&'static str),
    /// Flag value did not parse
    InvalidValue { flag: &'static str, value: String },
    /// Flag not recognised
    UnknownFlag(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingValue(flag) => write!(f, "{} requires a value", flag),
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value '{}' for {}", value, flag)
            }
            ConfigError::UnknownFlag(flag) => write!(f, "unknown argument '{}'", flag),
        }
    }
}

impl std::error::Error for ConfigError {}

const VALUE_FLAGS: &[&str] = &[
    "--bind",
    "--port",
    "--metrics-port",
    "--advisory-timeout",
    "--max-message-size",
    "--idle-timeout",
];

const SWITCH_FLAGS: &[&str] = &["--strict-relay"];

impl ServerConfig {
    /// Build a config from `std::env::args()` (program name included)
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        check_flags(args)?;

        let mut config = ServerConfig::default();

        let bind: IpAddr = match parse_value(args, "--bind")? {
            Some(ip) => ip,
            None => config.listen_addr.ip(),
        };
        let port: u16 = parse_value(args, "--port")?.unwrap_or(DEFAULT_PORT);
        config.listen_addr = SocketAddr::new(bind, port);

        config.metrics_addr = parse_value::<u16>(args, "--metrics-port")?
            .map(|metrics_port| SocketAddr::new(bind, metrics_port));

        if args.iter().any(|a| a == "--strict-relay") {
            config.relay_policy = RelayPolicy::PairedOnly;
        }

        config.advisory_timeout = parse_value::<u64>(args, "--advisory-timeout")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        if let Some(size) = parse_value::<usize>(args, "--max-message-size")? {
            config.max_message_size = size;
        }

        if let Some(secs) = parse_value::<u64>(args, "--idle-timeout")? {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    flag: "--idle-timeout",
                    value: secs.to_string(),
                });
            }
            config.timeouts.idle = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn parse_value<T: std::str::FromStr>(args: &[String], flag: &'static str) -> Result<Option<T>, ConfigError> {
    if !args.iter().any(|a| a == flag) {
        return Ok(None);
    }

    let value = parse_arg(args, flag).ok_or(ConfigError::MissingValue(flag))?;
    value
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue { flag, value })
}

/// Reject anything that is not a known flag or a flag's value
fn check_flags(args: &[String]) -> Result<(), ConfigError> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else if !SWITCH_FLAGS.contains(&arg.as_str()) {
            return Err(ConfigError::UnknownFlag(arg.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("signaling-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();

        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.relay_policy, RelayPolicy::Open);
        assert_eq!(config.advisory_timeout, None);
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn test_all_flags() {
        let config = ServerConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1",
            "--port",
            "6000",
            "--metrics-port",
            "9100",
            "--strict-relay",
            "--advisory-timeout",
            "45",
            "--max-message-size",
            "4096",
            "--idle-timeout",
            "90",
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:6000".parse().unwrap());
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
        assert_eq!(config.relay_policy, RelayPolicy::PairedOnly);
        assert_eq!(config.advisory_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.timeouts.idle, Duration::from_secs(90));
        assert_eq!(config.timeouts.handshake, Timeouts::default().handshake);
    }

    #[test]
    fn test_idle_timeout_must_be_positive() {
        assert_eq!(
            ServerConfig::from_args(&args(&["--idle-timeout", "0"])),
            Err(ConfigError::InvalidValue {
                flag: "--idle-timeout",
                value: "0".to_string()
            })
        );
    }

    #[test]
    fn test_zero_timeout_disables_expiry() {
        let config = ServerConfig::from_args(&args(&["--advisory-timeout", "0"])).unwrap();
        assert_eq!(config.advisory_timeout, None);
    }

    #[test]
    fn test_bad_input() {
        assert_eq!(
            ServerConfig::from_args(&args(&["--port", "http"])),
            Err(ConfigError::InvalidValue {
                flag: "--port",
                value: "http".to_string()
            })
        );
        assert_eq!(
            ServerConfig::from_args(&args(&["--port"])),
            Err(ConfigError::MissingValue("--port"))
        );
        assert_eq!(
            ServerConfig::from_args(&args(&["--verbose"])),
            Err(ConfigError::UnknownFlag("--verbose".to_string()))
        );
    }
}
