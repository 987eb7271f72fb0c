//! Connection descriptors and session configuration.
//!
//! Small value types parsed from user-facing strings, describing how to
//! reach the controller rather than controller command parameters.

use std::str::FromStr;
use std::time::Duration;

use crate::Error;

const DEFAULT_BAUD: u32 = 115_200;
const DEFAULT_NET_PORT: u16 = 23;

/// Where and how to reach the controller.
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
pub enum ConnectionDescriptor {
    #[display("serial://{path} @ {baud}")]
    Serial { path: String, baud: u32 },
    #[display("net://{host}:{port}")]
    Network { host: String, port: u16 },
}

impl ConnectionDescriptor {
    /// Serial transport defaults to ping-pong flow control; network does not.
    pub(crate) fn default_ping_pong(&self) -> bool {
        matches!(self, ConnectionDescriptor::Serial { .. })
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("serial://") {
            if path.is_empty() {
                return Err(Error::InvalidDescriptor(
                    "serial:// requires a device path".to_string(),
                ));
            }
            return Ok(ConnectionDescriptor::Serial {
                path: path.to_string(),
                baud: DEFAULT_BAUD,
            });
        }
        if let Some(rest) = s.strip_prefix("net://") {
            if rest.is_empty() {
                return Err(Error::InvalidDescriptor(
                    "net:// requires a host".to_string(),
                ));
            }
            let (host, port) = match rest.split_once(':') {
                Some((host, port_str)) => {
                    let port: u16 = port_str.parse().map_err(|_| {
                        Error::InvalidDescriptor(format!("invalid port: {port_str}"))
                    })?;
                    (host, port)
                }
                None => (rest, DEFAULT_NET_PORT),
            };
            if host.is_empty() {
                return Err(Error::InvalidDescriptor("net:// requires a host".to_string()));
            }
            return Ok(ConnectionDescriptor::Network {
                host: host.to_string(),
                port,
            });
        }
        Err(Error::InvalidDescriptor(format!(
            "unknown connection scheme, expected serial:// or net://, got: {s}"
        )))
    }
}

/// Tunables the foreground application supplies at connect time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often to poll the controller for a status report. Zero disables polling.
    pub report_rate: Duration,
    /// Suppresses `M105` temperature polls when the attached device is a CNC, not a printer.
    pub is_cnc: bool,
    /// Overrides the descriptor's default flow-control discipline when set.
    pub ping_pong: Option<bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            report_rate: Duration::from_secs(1),
            is_cnc: false,
            ping_pong: None,
        }
    }
}

impl SessionConfig {
    pub(crate) fn ping_pong_for(&self, descriptor: &ConnectionDescriptor) -> bool {
        self.ping_pong.unwrap_or_else(|| descriptor.default_ping_pong())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serial_descriptor() {
        let d: ConnectionDescriptor = "serial:///dev/ttyACM0".parse().unwrap();
        assert_eq!(
            d,
            ConnectionDescriptor::Serial {
                path: "/dev/ttyACM0".to_string(),
                baud: DEFAULT_BAUD
            }
        );
        assert!(d.default_ping_pong());
    }

    #[test]
    fn parses_network_descriptor_with_default_port() {
        let d: ConnectionDescriptor = "net://192.168.1.5".parse().unwrap();
        assert_eq!(
            d,
            ConnectionDescriptor::Network {
                host: "192.168.1.5".to_string(),
                port: DEFAULT_NET_PORT
            }
        );
        assert!(!d.default_ping_pong());
    }

    #[test]
    fn parses_network_descriptor_with_explicit_port() {
        let d: ConnectionDescriptor = "net://smoothie.local:8080".parse().unwrap();
        assert_eq!(
            d,
            ConnectionDescriptor::Network {
                host: "smoothie.local".to_string(),
                port: 8080
            }
        );
    }

    #[test]
    fn rejects_malformed_port() {
        assert!("net://host:notaport".parse::<ConnectionDescriptor>().is_err());
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!("ftp://host".parse::<ConnectionDescriptor>().is_err());
    }

    #[test]
    fn rejects_empty_host_or_path() {
        assert!("serial://".parse::<ConnectionDescriptor>().is_err());
        assert!("net://".parse::<ConnectionDescriptor>().is_err());
    }
}
