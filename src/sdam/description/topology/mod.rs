pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::Result,
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        DEFAULT_HEARTBEAT_FREQUENCY,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
    session::ClusterTime,
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A load balanced topology.
    LoadBalanced,

    /// A topology whose type is not known.
    Unknown,
}

impl Default for TopologyType {
    fn default() -> Self {
        TopologyType::Unknown
    }
}

/// A description of the most up-to-date information known about a topology. Updates are pure:
/// the [`Topology`](crate::Topology) worker clones the current description, applies an update,
/// and publishes the result as a new immutable snapshot.
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The time that a session remains active after its most recent use, as reported by the
    /// data-bearing server with the smallest such value. `None` if any data-bearing server
    /// doesn't support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The highest reported cluster time by any server in this topology.
    pub(crate) cluster_time: Option<ClusterTime>,

    /// The amount of latency beyond that of the fastest suitable server within which other
    /// suitable servers are eligible for selection.
    pub(crate) local_threshold: Option<Duration>,

    /// The interval between heartbeats, used to validate max staleness.
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.max_set_version == other.max_set_version
            && self.max_election_id == other.max_election_id
            && self.compatibility_error == other.compatibility_error
            && self.logical_session_timeout == other.logical_session_timeout
            && self.cluster_time == other.cluster_time
            && self.servers == other.servers
    }
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self {
            single_seed: false,
            topology_type: TopologyType::Unknown,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            cluster_time: None,
            local_threshold: None,
            heartbeat_freq: None,
            servers: HashMap::new(),
        }
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| {
                let description = match topology_type {
                    TopologyType::LoadBalanced => {
                        let mut description = ServerDescription::new(address);
                        description.server_type = ServerType::LoadBalancer;
                        description
                    }
                    _ => ServerDescription::new(address),
                };

                (address.clone(), description)
            })
            .collect();

        Ok(Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            cluster_time: None,
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
        })
    }

    /// The current type of the topology.
    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    /// The replica set name, if one has been discovered or configured.
    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    /// The addresses of the servers in the topology.
    pub fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    /// The descriptions of the servers in the topology.
    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    /// The description of the server at `address`, if it is in the topology.
    pub fn get_server_description(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// The logical session timeout currently advertised by the topology, if every data-bearing
    /// member supports sessions.
    pub fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    /// The highest cluster time seen from any member of the topology.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// Computes the read preference that should be attached as `$readPreference` to a command
    /// sent to a server of the given type, if any. Selection itself always targets a suitable
    /// server, but a mongos applies secondary read preferences shard-side and so needs them
    /// forwarded in the command.
    pub fn read_pref_for_command(
        &self,
        server_type: ServerType,
        criteria: Option<&SelectionCriteria>,
    ) -> Option<ReadPreference> {
        match (self.topology_type, server_type) {
            (TopologyType::Sharded, ServerType::Mongos)
            | (TopologyType::Single, ServerType::Mongos) => self.read_pref_for_mongos(criteria),
            (TopologyType::Single, ServerType::Standalone) => None,
            (TopologyType::Single, _) => {
                let read_pref = match criteria {
                    Some(SelectionCriteria::ReadPreference(ReadPreference::Primary)) | None => {
                        ReadPreference::PrimaryPreferred { options: None }
                    }
                    Some(SelectionCriteria::ReadPreference(other)) => other.clone(),
                    Some(SelectionCriteria::Predicate(_)) => {
                        ReadPreference::PrimaryPreferred { options: None }
                    }
                };
                Some(read_pref)
            }
            _ => {
                let read_pref = match criteria {
                    Some(SelectionCriteria::ReadPreference(read_pref)) => read_pref.clone(),
                    Some(SelectionCriteria::Predicate(_)) => {
                        ReadPreference::PrimaryPreferred { options: None }
                    }
                    None => ReadPreference::Primary,
                };
                Some(read_pref)
            }
        }
    }

    fn read_pref_for_mongos(&self, criteria: Option<&SelectionCriteria>) -> Option<ReadPreference> {
        let read_pref = match criteria {
            Some(SelectionCriteria::ReadPreference(read_pref)) => read_pref,
            _ => return None,
        };
        match read_pref {
            ReadPreference::Secondary { .. }
            | ReadPreference::PrimaryPreferred { .. }
            | ReadPreference::Nearest { .. } => Some(read_pref.clone()),
            ReadPreference::SecondaryPreferred { options: Some(options) }
                if options.max_staleness.is_some() || options.tag_sets.is_some() =>
            {
                Some(read_pref.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Advance the cluster time, if the provided one is more recent than the current one.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() >= Some(cluster_time) {
            return;
        }
        self.cluster_time = Some(cluster_time.clone());
    }

    /// Whether an incoming description for a server carries an older `topologyVersion` than the
    /// one already recorded for it, and should therefore be discarded.
    pub(crate) fn is_stale_update(&self, server_description: &ServerDescription) -> bool {
        let existing = match self
            .servers
            .get(&server_description.address)
            .and_then(|existing| existing.topology_version())
        {
            Some(tv) => tv,
            None => return false,
        };
        match server_description.topology_version() {
            Some(new) => existing.is_more_recent_than(new),
            // Replies without a topologyVersion can't be ordered and always apply.
            None => false,
        }
    }

    /// Update the provided server description's average round trip time, folding the new
    /// measurement into the moving average of prior ones.
    fn update_round_trip_time(&self, server_description: &mut ServerDescription) {
        if let Some(old_rtt) = self
            .servers
            .get(&server_description.address)
            .and_then(|server_desc| server_desc.average_round_trip_time)
        {
            if let Some(new_rtt) = server_description.average_round_trip_time {
                server_description.average_round_trip_time =
                    Some((new_rtt / 5) + (old_rtt * 4 / 5));
            }
        }
    }

    /// Syncs the set of servers in the description to those in `hosts`. Servers in the
    /// description not contained in `hosts` will be removed.
    pub(crate) fn sync_hosts(&mut self, hosts: HashSet<ServerAddress>) {
        self.add_new_servers(hosts.iter().cloned());
        self.servers.retain(|host, _| hosts.contains(host));
    }

    /// Update the topology based on the new information about the topology contained by the
    /// given server description.
    pub(crate) fn update(&mut self, mut server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers not currently in the topology, as well as stale updates
        // from a previous generation of the server's process.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }
        if self.is_stale_update(&server_description) {
            return Ok(());
        }

        // Replace the old info about the server with the new info.
        self.update_round_trip_time(&mut server_description);
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        // Update the topology's min logicalSessionTimeoutMinutes.
        self.update_logical_session_timeout();

        // Update the topology's max reported $clusterTime.
        if let Ok(Some(cluster_time)) = server_description.cluster_time() {
            self.advance_cluster_time(&cluster_time);
        }

        // Update the topology's compatibility error if the server is incompatible with the
        // driver.
        self.update_compatibility_error(&server_description);

        // Update the topology description based on the current topology type.
        match (self.topology_type, server_description.server_type) {
            (TopologyType::Single, _) | (TopologyType::LoadBalanced, _) => {}
            (_, ServerType::Unknown)
            | (_, ServerType::RsGhost)
            | (_, ServerType::LoadBalancer) => {
                if let TopologyType::ReplicaSetWithPrimary = self.topology_type {
                    self.record_primary_state();
                }
            }
            (TopologyType::Unknown, ServerType::Standalone) => {
                self.update_unknown_with_standalone_server(server_description)
            }
            (TopologyType::Unknown, ServerType::Mongos) => {
                self.topology_type = TopologyType::Sharded
            }
            (TopologyType::Unknown, ServerType::RsPrimary) => {
                self.update_rs_from_primary_server(server_description)?
            }
            (TopologyType::Unknown, ServerType::RsSecondary)
            | (TopologyType::Unknown, ServerType::RsArbiter)
            | (TopologyType::Unknown, ServerType::RsOther) => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(&server_description)?;
            }
            (TopologyType::Sharded, ServerType::Mongos) => {}
            (TopologyType::Sharded, _) => {
                self.servers.remove(&server_description.address);
            }
            (TopologyType::ReplicaSetNoPrimary, ServerType::Standalone)
            | (TopologyType::ReplicaSetNoPrimary, ServerType::Mongos) => {
                self.servers.remove(&server_description.address);
            }
            (TopologyType::ReplicaSetNoPrimary, ServerType::RsPrimary) => {
                self.update_rs_from_primary_server(server_description)?
            }
            (TopologyType::ReplicaSetNoPrimary, _) => {
                self.update_rs_without_primary_server(&server_description)?
            }
            (TopologyType::ReplicaSetWithPrimary, ServerType::Standalone)
            | (TopologyType::ReplicaSetWithPrimary, ServerType::Mongos) => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            (TopologyType::ReplicaSetWithPrimary, ServerType::RsPrimary) => {
                self.update_rs_from_primary_server(server_description)?
            }
            (TopologyType::ReplicaSetWithPrimary, _) => {
                self.update_rs_with_primary_from_member(&server_description)?
            }
        }

        // Membership pruning can empty the topology entirely (e.g. every member reported a
        // conflicting set name). Rather than monitoring nothing forever, reset to Unknown so
        // the original seeds are rediscoverable.
        if self.servers.is_empty()
            && !matches!(
                self.topology_type,
                TopologyType::Single | TopologyType::LoadBalanced
            )
        {
            warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                "all servers were removed from the topology; resetting to Unknown"
            );
            self.topology_type = TopologyType::Unknown;
            self.set_name = None;
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the server description derived from a
    /// hello reply from a standalone server.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description
    /// derived from a hello reply from a replica set member without the primary.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: &ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description
    /// derived from a hello reply from a non-primary replica set member.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: &ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
        } else if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        self.record_primary_state();
        Ok(())
    }

    /// Update the replica set topology description based on the server description derived from
    /// a hello reply from the primary.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if let Some(server_election_id) = server_description.election_id()? {
                if let Some(topology_max_set_version) = self.max_set_version {
                    if let Some(topology_max_election_id) = self.max_election_id {
                        if topology_max_set_version > server_set_version
                            || (topology_max_set_version == server_set_version
                                && topology_max_election_id > server_election_id)
                        {
                            // The reply is from a stale primary from an older election; mark it
                            // Unknown and keep the ratcheted values.
                            self.servers.insert(
                                server_description.address.clone(),
                                ServerDescription::new(&server_description.address),
                            );
                            self.record_primary_state();
                            return Ok(());
                        }
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|topology_max_set_version| server_set_version > topology_max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // If any other servers are RsPrimary, replace them with an unknown description to
        // invalidate them.
        for address in addresses.clone() {
            if address == server_description.address {
                continue;
            }

            if let Some(ServerType::RsPrimary) = self
                .servers
                .get(&address)
                .map(|server_desc| server_desc.server_type)
            {
                self.servers
                    .insert(address.clone(), ServerDescription::new(&address));
            }
        }

        let known_hosts: HashSet<_> = server_description.known_hosts()?.into_iter().collect();

        // Remove servers from the topology that aren't in the membership lists reported by the
        // primary.
        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.add_new_servers(known_hosts);
        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetWithPrimary or ReplicaSetNoPrimary accordingly.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Create a new ServerDescription for each address and add it to the topology.
    fn add_new_servers(&mut self, servers: impl IntoIterator<Item = ServerAddress>) {
        for server in servers {
            if !self.servers.contains_key(&server) {
                self.servers
                    .insert(server.clone(), ServerDescription::new(&server));
            }
        }
    }

    /// Update the topology's logical session timeout to the minimum of those reported by the
    /// data-bearing servers.
    fn update_logical_session_timeout(&mut self) {
        let mut timeout: Option<Duration> = None;
        for server in self.servers.values() {
            if !server.server_type.is_data_bearing() {
                continue;
            }
            match server.logical_session_timeout().ok().flatten() {
                Some(server_timeout) => {
                    timeout = Some(
                        timeout.map_or(server_timeout, |current| current.min(server_timeout)),
                    );
                }
                None => {
                    self.logical_session_timeout = None;
                    return;
                }
            }
        }
        self.logical_session_timeout = timeout;
    }

    fn update_compatibility_error(&mut self, server_description: &ServerDescription) {
        match server_description.compatibility_error_message() {
            Some(message) => self.compatibility_error = Some(message),
            None => {
                // Another server may still be incompatible.
                self.compatibility_error = self
                    .servers
                    .values()
                    .find_map(|server| server.compatibility_error_message());
            }
        }
    }

    /// Gets the diff between this topology description and another, or `None` if they are equal.
    ///
    /// The diff is from the perspective of `self`, i.e. the removed set refers to servers in
    /// `self` but not `other`.
    pub(crate) fn diff<'a>(&'a self, other: &'a Self) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let addresses: HashSet<&ServerAddress> = self.server_addresses().collect();
        let other_addresses: HashSet<&ServerAddress> = other.server_addresses().collect();

        let changed_servers = self.servers.iter().filter_map(|(address, description)| {
            match other.servers.get(address) {
                Some(other_description) if description != other_description => {
                    Some((address, (description, other_description)))
                }
                _ => None,
            }
        });

        Some(TopologyDescriptionDiff {
            removed_addresses: addresses.difference(&other_addresses).cloned().collect(),
            added_addresses: other_addresses.difference(&addresses).cloned().collect(),
            changed_servers: changed_servers.collect(),
        })
    }

}

impl std::fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;

        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }

        if !self.servers.is_empty() {
            write!(f, ", Servers: [ ")?;
            let mut first = true;
            for server in self.servers.values() {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                write!(f, "{}", crate::sdam::public::ServerInfo::new_borrowed(server))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// A change in the servers between two topology descriptions.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
    pub(crate) changed_servers:
        HashMap<&'a ServerAddress, (&'a ServerDescription, &'a ServerDescription)>,
}

#[cfg(test)]
mod test;
