// Local crates
use crate::broker::error::BrokerError;

// External crates
use std::fmt;
use std::str::FromStr;

/// Port used when the address does not name one.
pub const DEFAULT_PORT: u16 = 1883;

/// Plain-TCP location of an MQTT broker.
///
/// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` and `host`.
/// IPv6 literals must be bracketed, e.g. `tcp://[::1]:1883`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or IP literal, without brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl FromStr for BrokerAddress {
    type Err = BrokerError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &'static str| BrokerError::InvalidAddress {
            address: raw.to_string(),
            reason,
        };

        let trimmed = raw.trim();
        let rest = match trimmed.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "tcp" | "mqtt" => rest,
                "ssl" | "tls" | "mqtts" | "wss" | "ws" => {
                    return Err(invalid("only plain tcp:// and mqtt:// brokers are supported"));
                }
                _ => return Err(invalid("unknown scheme")),
            },
            None => trimmed,
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("unexpected characters after IPv6 literal"))?,
                ),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if host.contains(['/', ':']) && !rest.starts_with('[') {
            return Err(invalid("malformed host"));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| invalid("port must be a number between 1 and 65535"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}
