//! Contains the configuration consumed by a [`Topology`](crate::Topology). URI parsing is out of
//! scope for this crate; embedders construct [`ClientOptions`] directly from their own
//! configuration layer.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use serde::{Deserialize, Deserializer, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, ErrorKind, Result},
    event::sdam::SdamEventHandler,
    hello::HelloTransport,
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A `host:port` address pair identifying a server within a topology. Hostnames are
/// case-insensitive and normalized to lowercase.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
#[serde(untagged)]
pub enum ServerAddress {
    /// A TCP/IP host and port.
    #[non_exhaustive]
    Tcp {
        /// The hostname of the address.
        host: String,

        /// The port of the address. The default is 27017.
        port: Option<u16>,
    },
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host.eq_ignore_ascii_case(other_host)
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Tcp { host, port } => {
                host.to_lowercase().hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(serde::de::Error::custom)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');

        let host = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{}\"",
                    address
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ))
                })?;
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{}\"",
                        address
                    )));
                }
                Some(port)
            }
            None => None,
        };

        Ok(Self::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    /// The hostname of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, if one was specified.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

/// How server monitoring is scheduled for a topology.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum MonitoringMode {
    /// One background heartbeat task per server, the default. Selection blocks on topology
    /// updates published by the monitors.
    #[default]
    Background,

    /// No background tasks; servers are scanned synchronously inside
    /// [`select_server`](crate::Topology::select_server) when the topology is stale. This is the
    /// mode for embedders that cannot host long-lived tasks. `server_selection_try_once`
    /// defaults to `true` in this mode.
    OnDemand,
}

/// The hostname and minimum TTL of the original `mongodb+srv` style lookup that produced the
/// seedlist, retained so that the topology can periodically re-poll the SRV records.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct SrvSeedlistInfo {
    /// The hostname the SRV lookup was performed against.
    pub hostname: String,

    /// The minimum TTL among the originally returned records.
    pub min_ttl: Duration,
}

impl SrvSeedlistInfo {
    /// Creates a new `SrvSeedlistInfo`.
    pub fn new(hostname: impl Into<String>, min_ttl: Duration) -> Self {
        Self {
            hostname: hostname.into(),
            min_ttl,
        }
    }
}

/// Configuration for a [`Topology`](crate::Topology).
#[derive(Clone, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the topology should connect to.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The implementation used to issue `hello` commands to servers. Wire-protocol framing,
    /// authentication, and TLS all live behind this boundary.
    #[builder(!default)]
    #[derive_where(skip)]
    pub transport: Arc<dyn HelloTransport>,

    /// The amount of time each monitoring task should wait between sending `hello` commands to
    /// its server. Defaults to 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// The amount of latency beyond that of the suitable server with the minimum latency within
    /// which other suitable servers remain eligible for selection. Defaults to 15 ms.
    pub local_threshold: Option<Duration>,

    /// How long an attempt to select a server may block before failing. Defaults to 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The upper bound on the time a single heartbeat may take, including establishing the
    /// monitoring connection. Defaults to 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// Whether the topology should consist of the single seed it was given, never discovering
    /// other members.
    pub direct_connection: Option<bool>,

    /// The name of the replica set the topology is expected to be a member of.
    pub repl_set_name: Option<String>,

    /// Whether the seed is a load balancer fronting the deployment. No monitoring is performed
    /// in this mode.
    pub load_balanced: Option<bool>,

    /// How monitoring is scheduled; see [`MonitoringMode`].
    pub monitoring_mode: Option<MonitoringMode>,

    /// In [`MonitoringMode::OnDemand`], whether selection should fail after a single scan rather
    /// than rescanning until the selection timeout expires. Defaults to `true`. Ignored in
    /// background mode.
    pub server_selection_try_once: Option<bool>,

    /// The default selection criteria applied when an operation does not specify its own.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The maximum number of hosts an SRV lookup may add to the topology. Zero or unset means
    /// unlimited.
    pub srv_max_hosts: Option<u32>,

    /// The SRV service name to poll, in place of the default `mongodb`.
    pub srv_service_name: Option<String>,

    /// When the seedlist came from an SRV lookup, the original lookup info; its presence enables
    /// the SRV polling task.
    pub srv_seedlist_info: Option<SrvSeedlistInfo>,

    /// A handler invoked on each SDAM event the topology emits.
    #[derive_where(skip)]
    pub sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// Options used internally by this crate's tests.
    #[cfg(test)]
    #[builder(default)]
    pub(crate) test_options: Option<TestOptions>,
}

impl ClientOptions {
    pub(crate) fn monitoring_mode(&self) -> MonitoringMode {
        self.monitoring_mode.unwrap_or_default()
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "the seedlist cannot be empty".to_string(),
            }
            .into());
        }
        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot specify multiple seeds with directConnection=true".to_string(),
            }
            .into());
        }
        if self.load_balanced == Some(true) && self.hosts.len() > 1 {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot specify multiple seeds with loadBalanced=true".to_string(),
            }
            .into());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn test_options_mut(&mut self) -> &mut TestOptions {
        self.test_options.get_or_insert_with(Default::default)
    }
}

/// Overrides used by this crate's tests.
#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub(crate) struct TestOptions {
    /// Lowers the floor enforced between heartbeats so monitoring tests run quickly.
    pub(crate) min_heartbeat_freq: Option<Duration>,

    /// Prevents monitor tasks from being spawned so transitions can be driven manually.
    pub(crate) disable_monitoring_threads: bool,

    /// Mocks the result of the periodic SRV lookup.
    pub(crate) mock_lookup_hosts: Option<crate::srv::LookupHosts>,
}

#[cfg(test)]
mod test {
    use super::ServerAddress;

    #[test]
    fn address_parse_and_identity() {
        let address = ServerAddress::parse("MongoDB.Example.Com:27018").unwrap();
        assert_eq!(address.host(), "mongodb.example.com");
        assert_eq!(address.port(), Some(27018));

        // Case and default port are not part of server identity.
        assert_eq!(
            ServerAddress::parse("localhost").unwrap(),
            ServerAddress::parse("LOCALHOST:27017").unwrap()
        );
        assert_ne!(
            ServerAddress::parse("localhost:27017").unwrap(),
            ServerAddress::parse("localhost:27018").unwrap()
        );

        assert!(ServerAddress::parse("host:port:extra").is_err());
        assert!(ServerAddress::parse("host:99999").is_err());
        assert!(ServerAddress::parse(":27017").is_err());
    }
}
