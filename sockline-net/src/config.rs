//! Factory configuration.
//!
//! Every value is checked when a [`ConnectionFactory`](crate::ConnectionFactory) is built, so a bad
//! configuration never surfaces later as an I/O failure.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport protocol carried by the sockets a factory creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transport {
    /// Reliable byte stream (TCP, or a Unix stream socket).
    #[default]
    Tcp,

    /// Datagrams (UDP, or a Unix datagram socket).
    Udp,
}

impl Display for Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Transport {
    type Err = ConfigurationError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string.to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(Self::Tcp),
            "udp" | "datagram" => Ok(Self::Udp),
            _ => Err(ConfigurationError::UnknownTransport(string.to_owned())),
        }
    }
}

impl TryFrom<String> for Transport {
    type Error = ConfigurationError;

    fn try_from(string: String) -> Result<Self, Self::Error> {
        string.parse()
    }
}

impl From<Transport> for String {
    fn from(transport: Transport) -> Self {
        transport.to_string()
    }
}

/// Address family of the sockets a factory creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressFamily {
    /// IPv4 endpoints.
    #[default]
    Ipv4,

    /// Unix domain socket paths.
    Unix,
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => f.write_str("ipv4"),
            Self::Unix => f.write_str("unix"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = ConfigurationError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string.to_ascii_lowercase().as_str() {
            "ipv4" | "inet" => Ok(Self::Ipv4),
            "unix" | "local" => Ok(Self::Unix),
            _ => Err(ConfigurationError::UnsupportedAddressFamily(
                string.to_owned(),
            )),
        }
    }
}

impl TryFrom<String> for AddressFamily {
    type Error = ConfigurationError;

    fn try_from(string: String) -> Result<Self, Self::Error> {
        string.parse()
    }
}

impl From<AddressFamily> for String {
    fn from(family: AddressFamily) -> Self {
        family.to_string()
    }
}

/// Backoff and attempt cap used by the read and send loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay between two attempts that made no progress.
    #[serde(with = "millis")]
    pub backoff: Duration,

    /// Attempts without progress after which the connection is considered stalled.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(5),
            max_attempts: 100,
        }
    }
}

/// What a full inbound datagram queue does with a new datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued datagram and enqueue the new one.
    #[default]
    DropOldest,

    /// Keep the queue as is and discard the new datagram.
    RejectNewest,
}

impl FromStr for OverflowPolicy {
    type Err = ConfigurationError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string {
            "drop-oldest" => Ok(Self::DropOldest),
            "reject-newest" => Ok(Self::RejectNewest),
            _ => Err(ConfigurationError::InvalidValue {
                parameter: "overflow",
                value: string.to_owned(),
            }),
        }
    }
}

/// Settings for datagram transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatagramConfig {
    /// Maximum number of datagrams queued per virtual connection.
    pub queue_capacity: usize,

    /// Behaviour of a full per-peer queue.
    pub overflow: OverflowPolicy,

    /// Largest datagram accepted, longer ones are dropped.
    pub max_datagram_size: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            overflow: OverflowPolicy::default(),
            // 65507 = 65535 - 8 (UDP header) - 20 (IPv4 header).
            max_datagram_size: 65507,
        }
    }
}

/// Full configuration of a [`ConnectionFactory`](crate::ConnectionFactory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Stream or datagram transport.
    pub transport: Transport,

    /// IPv4 or Unix domain addressing.
    pub address_family: AddressFamily,

    /// Retry behaviour of the I/O engine.
    pub retry: RetryPolicy,

    /// Maximum bytes taken by one non-exact stream read.
    pub read_buffer_size: usize,

    /// Datagram specific settings.
    pub datagram: DatagramConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            address_family: AddressFamily::default(),
            retry: RetryPolicy::default(),
            read_buffer_size: 8192,
            datagram: DatagramConfig::default(),
        }
    }
}

impl FactoryConfig {
    /// Creates a configuration with default tuning for the given transport and family.
    pub fn new(transport: Transport, address_family: AddressFamily) -> Self {
        Self {
            transport,
            address_family,
            ..Self::default()
        }
    }

    /// Builds a configuration from `(parameter, value)` string pairs.
    ///
    /// Unset parameters keep their defaults, unknown parameters are rejected.
    pub fn from_params<'a>(
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigurationError> {
        fn number<T: FromStr>(parameter: &'static str, value: &str) -> Result<T, ConfigurationError> {
            value.parse().map_err(|_| ConfigurationError::InvalidValue {
                parameter,
                value: value.to_owned(),
            })
        }

        let mut config = Self::default();
        for (parameter, value) in params {
            match parameter {
                "transport" => config.transport = value.parse()?,
                "address_family" => config.address_family = value.parse()?,
                "read_buffer_size" => config.read_buffer_size = number("read_buffer_size", value)?,
                "queue_capacity" => {
                    config.datagram.queue_capacity = number("queue_capacity", value)?;
                }
                "overflow" => config.datagram.overflow = value.parse()?,
                "retry_backoff_ms" => {
                    config.retry.backoff =
                        Duration::from_millis(number("retry_backoff_ms", value)?);
                }
                "retry_attempts" => config.retry.max_attempts = number("retry_attempts", value)?,
                _ => return Err(ConfigurationError::UnknownParameter(parameter.to_owned())),
            }
        }

        Ok(config)
    }

    /// Checks every value, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                parameter: "read_buffer_size",
                value: "0".to_owned(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::InvalidValue {
                parameter: "retry_attempts",
                value: "0".to_owned(),
            });
        }

        if self.transport == Transport::Udp {
            if self.datagram.queue_capacity == 0 {
                return Err(ConfigurationError::InvalidValue {
                    parameter: "queue_capacity",
                    value: "0".to_owned(),
                });
            }

            if self.datagram.max_datagram_size == 0 {
                return Err(ConfigurationError::InvalidValue {
                    parameter: "max_datagram_size",
                    value: "0".to_owned(),
                });
            }
        }

        Ok(())
    }
}

/// Errors reported while building a factory configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The transport is not one of the supported transports.
    #[error("the transport {0:?} is not supported")]
    UnknownTransport(String),

    /// The address family is not one of the supported families.
    #[error("unknown address family value: {0:?}")]
    UnsupportedAddressFamily(String),

    /// A parameter name is not recognised.
    #[error("wrong parameter: {0:?}")]
    UnknownParameter(String),

    /// A parameter value is out of range or malformed.
    #[error("invalid value {value:?} for {parameter}")]
    InvalidValue {
        /// The parameter name.
        parameter: &'static str,

        /// The rejected value.
        value: String,
    },
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
