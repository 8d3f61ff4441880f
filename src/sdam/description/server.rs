use std::time::Duration;

use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    hello::{HelloReply, TopologyVersion},
    options::ServerAddress,
    selection_criteria::TagSet,
};

const DRIVER_MIN_DB_VERSION: &str = "4.0";
const DRIVER_MIN_WIRE_VERSION: i32 = 7;
const DRIVER_MAX_WIRE_VERSION: i32 = 25;

/// The possible types for a server.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica-set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    #[display("RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    #[display("RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    #[display("RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    #[display("RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    #[display("RSGhost")]
    RsGhost,

    /// A load balancer.
    LoadBalancer,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[serde(alias = "PossiblePrimary")]
    Unknown,
}

impl Default for ServerType {
    fn default() -> Self {
        ServerType::Unknown
    }
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    // The SDAM spec indicates that a ServerDescription needs to contain an error message if an
    // error occurred when trying to send an hello for the server's heartbeat. Additionally,
    // we need to be able to create a server description that doesn't contain either a reply or an
    // error, since there's a gap between when a server is newly added to the topology and when the
    // first heartbeat occurs.
    //
    // In order to represent all 3 states (an error, a reply, or neither), we store a
    // Result directly in the ServerDescription, which either contains the aforementioned error or
    // an Option<HelloReply>. This allows us to ensure that only valid states are possible (e.g.
    // preventing that both an error and a reply are present) while still making it easy to
    // define helper methods on ServerDescription for information we need from the hello reply.
    pub(crate) reply: std::result::Result<Option<HelloReply>, Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (self.reply.as_ref(), other.reply.as_ref()) {
            (Ok(self_reply), Ok(other_reply)) => {
                let self_response = self_reply.as_ref().map(|r| &r.command_response);
                let other_response = other_reply.as_ref().map(|r| &r.command_response);
                self_response == other_response
            }
            (Err(self_err), Err(other_err)) => self_err.to_string() == other_err.to_string(),
            _ => false,
        }
    }
}

impl ServerDescription {
    /// Creates a description for a server about which nothing is yet known.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: ServerAddress::Tcp {
                host: address.host().to_lowercase(),
                port: address.port(),
            },
            server_type: Default::default(),
            last_update_time: None,
            reply: Ok(None),
            average_round_trip_time: None,
        }
    }

    /// Creates a description from a successful heartbeat.
    pub(crate) fn new_from_hello_reply(address: ServerAddress, mut reply: HelloReply) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());

        // The length of time a hello call takes is used to update the round trip time, but is not
        // considered part of the server's identity for change events.
        let old_rtt = reply.round_trip_time;
        reply.round_trip_time = Duration::from_secs(0);

        description.server_type = reply.command_response.server_type();
        description.average_round_trip_time = Some(old_rtt);
        description.reply = Ok(Some(reply));

        // normalize all addresses to lowercase
        if let Ok(Some(ref mut reply)) = description.reply {
            if let Some(ref mut hosts) = reply.command_response.hosts {
                *hosts = hosts.drain(..).map(|s| s.to_lowercase()).collect();
            }
            if let Some(ref mut passives) = reply.command_response.passives {
                *passives = passives.drain(..).map(|s| s.to_lowercase()).collect();
            }
            if let Some(ref mut arbiters) = reply.command_response.arbiters {
                *arbiters = arbiters.drain(..).map(|s| s.to_lowercase()).collect();
            }
            if let Some(ref mut me) = reply.command_response.me {
                *me = me.to_lowercase();
            }
        }

        description
    }

    /// Creates a description marking a server unknown due to a monitoring or application error.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.average_round_trip_time = None;
        description.reply = Err(error);
        description
    }

    /// Whether this server is in a state usable for operations.
    pub fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if let Ok(Some(ref reply)) = self.reply {
            let hello_min_wire_version = reply.command_response.min_wire_version.unwrap_or(0);

            if hello_min_wire_version > DRIVER_MAX_WIRE_VERSION {
                return Some(format!(
                    "Server at {} requires wire version {}, but this version of the driver only \
                     supports up to {}",
                    self.address, hello_min_wire_version, DRIVER_MAX_WIRE_VERSION,
                ));
            }

            let hello_max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);

            if hello_max_wire_version < DRIVER_MIN_WIRE_VERSION {
                return Some(format!(
                    "Server at {} reports wire version {}, but this version of the driver \
                     requires at least {} (MongoDB {}).",
                    self.address, hello_max_wire_version, DRIVER_MIN_WIRE_VERSION,
                    DRIVER_MIN_DB_VERSION,
                ));
            }
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        let set_name = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_name.clone());
        Ok(set_name)
    }

    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let known_hosts = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .map(|reply| {
                let hosts = reply.command_response.hosts.as_ref();
                let passives = reply.command_response.passives.as_ref();
                let arbiters = reply.command_response.arbiters.as_ref();

                hosts
                    .into_iter()
                    .flatten()
                    .chain(passives.into_iter().flatten())
                    .chain(arbiters.into_iter().flatten())
            })
            .into_iter()
            .flatten();

        known_hosts
            .map(ServerAddress::parse)
            .collect::<Result<Vec<_>>>()
    }

    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(ref reply) = *self.reply.as_ref().map_err(Clone::clone)? {
            if let Some(ref me) = reply.command_response.me {
                return Ok(&self.address.to_string() != me);
            }
        }

        Ok(false)
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        let set_version = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.set_version);
        Ok(set_version)
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        let election_id = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.election_id);
        Ok(election_id)
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<crate::session::ClusterTime>> {
        let cluster_time = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.cluster_time.clone());
        Ok(cluster_time)
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            Ok(None) => None,
            Err(ref e) => e.topology_version(),
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        let timeout = self
            .reply
            .as_ref()
            .map_err(Clone::clone)?
            .as_ref()
            .and_then(|reply| reply.command_response.logical_session_timeout());
        Ok(timeout)
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply
                .command_response
                .last_write
                .as_ref()
                .map(|write| write.last_write_date)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn tags(&self) -> Result<Option<&TagSet>> {
        match self.reply {
            Ok(None) => Ok(None),
            Ok(Some(ref reply)) => Ok(reply.command_response.tags.as_ref()),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let reply = match self.reply {
            Ok(Some(ref reply)) => reply,
            _ => return false,
        };

        let server_tags = match reply.command_response.tags {
            Some(ref tags) => tags,
            None => return false,
        };

        tag_set
            .iter()
            .all(|(key, val)| server_tags.get(key) == Some(val))
    }

    /// The error that caused this server to be marked unknown, if any.
    pub fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    /// The address of this server.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The type of this server.
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Whether self and other are equivalent for the purposes of change events.
    pub(crate) fn is_equivalent(&self, other: &Self) -> bool {
        self == other
    }
}
