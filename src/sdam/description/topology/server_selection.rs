use std::time::Duration;

use rand::seq::IndexedRandom;

use crate::{
    error::{ErrorKind, Result},
    sdam::{
        description::{
            server::{ServerDescription, ServerType},
            topology::{TopologyDescription, TopologyType},
        },
        public::ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// The maximum amount of time a primary may go without a write being recorded before secondary
/// staleness estimates become meaningless, per the max staleness rules.
const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// The selection criteria applied when an operation doesn't specify any: route to the primary.
pub(crate) static DEFAULT_CRITERIA: SelectionCriteria =
    SelectionCriteria::ReadPreference(ReadPreference::Primary);

impl TopologyDescription {
    /// Selects a server at random from the set of suitable servers within the latency window.
    /// `Ok(None)` means no server is currently suitable; selection should block for a topology
    /// change rather than fail.
    pub(crate) fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Option<&ServerDescription>> {
        let in_window = self.suitable_servers_in_latency_window(criteria)?;
        Ok(in_window.choose(&mut rand::rng()).copied())
    }

    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if let Some(ref message) = self.compatibility_error {
            return message.clone();
        }
        format!(
            "None of the available servers suitable for criteria {:?}. Topology: {}",
            criteria, self
        )
    }

    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(message) = self.compatibility_error.as_ref() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.clone(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref)?,
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|server| {
                    server.server_type.is_data_bearing()
                        && filter(&ServerInfo::new_borrowed(server))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    fn suitable_servers(&self, read_preference: &ReadPreference) -> Result<Vec<&ServerDescription>> {
        let servers = match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        };

        Ok(servers)
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server_desc| server_desc.average_round_trip_time)
            .fold(Option::<Duration>::None, |min, curr| match min {
                Some(prev) => Some(prev.min(curr)),
                None => Some(curr),
            });

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window = shortest_average_rtt
            .map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |server_desc| {
            match (server_desc.average_round_trip_time, max_rtt_within_window) {
                (Some(server_rtt), Some(max_rtt)) => server_rtt <= max_rtt,
                // Load balancers are never heartbeated and so have no RTT; they are always in
                // the window.
                _ => matches!(server_desc.server_type, ServerType::LoadBalancer),
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> + 'a {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let servers = match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { ref options } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                options.as_ref().and_then(|options| options.tag_sets.as_ref()),
                options.as_ref().and_then(|options| options.max_staleness),
            )?,
            ReadPreference::PrimaryPreferred { ref options } => {
                match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                    Some(primary) => vec![primary],
                    None => self.suitable_servers_for_read_preference(
                        &[ServerType::RsSecondary],
                        options.as_ref().and_then(|options| options.tag_sets.as_ref()),
                        options.as_ref().and_then(|options| options.max_staleness),
                    )?,
                }
            }
            ReadPreference::SecondaryPreferred { ref options } => {
                let suitable_servers = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    options.as_ref().and_then(|options| options.tag_sets.as_ref()),
                    options.as_ref().and_then(|options| options.max_staleness),
                )?;

                if suitable_servers.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable_servers
                }
            }
            ReadPreference::Nearest { ref options } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                options.as_ref().and_then(|options| options.tag_sets.as_ref()),
                options.as_ref().and_then(|options| options.max_staleness),
            )?,
        };

        Ok(servers)
    }

    fn suitable_servers_for_read_preference<'a>(
        &'a self,
        types: &'a [ServerType],
        tag_sets: Option<&Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&'a ServerDescription>> {
        self.verify_max_staleness(max_staleness)?;

        let mut servers = self.servers_with_type(types).collect();

        // We don't need to check for the Client's default max_staleness because it would be
        // passed in as part of the Client's default ReadPreference if none is specified for
        // the operation.
        if let Some(max_staleness) = max_staleness {
            // A max staleness <= 0 is the same as no max staleness.
            if max_staleness > Duration::from_secs(0) {
                self.filter_servers_by_max_staleness(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    pub(crate) fn verify_max_staleness(&self, max_staleness: Option<Duration>) -> Result<()> {
        let max_staleness = match max_staleness {
            Some(max_staleness) => max_staleness,
            None => return Ok(()),
        };

        if max_staleness < Duration::from_secs(90) {
            return Err(ErrorKind::InvalidArgument {
                message: "max staleness cannot be less than 90 seconds".to_string(),
            }
            .into());
        }

        let heartbeat_frequency = self.heartbeat_frequency();
        if max_staleness < heartbeat_frequency + IDLE_WRITE_PERIOD {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "max staleness ({} sec) must be at least the heartbeat frequency ({} sec) \
                     plus the idle write period (10 sec)",
                    max_staleness.as_secs(),
                    heartbeat_frequency.as_secs(),
                ),
            }
            .into());
        }

        Ok(())
    }

    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let primary = self
            .servers
            .values()
            .find(|server| server.server_type == ServerType::RsPrimary);

        match primary {
            Some(primary) => {
                self.filter_servers_by_max_staleness_with_primary(servers, primary, max_staleness)
            }
            None => self.filter_servers_by_max_staleness_without_primary(servers, max_staleness),
        };
    }

    fn filter_servers_by_max_staleness_with_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        primary: &ServerDescription,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = max_staleness.as_millis() as i64;

        servers.retain(|server| {
            let server_staleness = self.calculate_secondary_staleness_with_primary(server, primary);

            server_staleness
                .map(|staleness| staleness <= max_staleness_ms)
                .unwrap_or(false)
        })
    }

    fn filter_servers_by_max_staleness_without_primary(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness = max_staleness.as_millis() as i64;
        let max_write_date = self
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsSecondary)
            .filter_map(|server| {
                server
                    .last_write_date()
                    .ok()
                    .and_then(std::convert::identity)
            })
            .map(|last_write_date| last_write_date.timestamp_millis())
            .max();

        let max_write_date = match max_write_date {
            Some(max_write_date) => max_write_date,
            None => return,
        };

        servers.retain(|server| {
            let server_staleness =
                self.calculate_secondary_staleness_without_primary(server, max_write_date);

            server_staleness
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(false)
        })
    }

    fn calculate_secondary_staleness_with_primary(
        &self,
        secondary: &ServerDescription,
        primary: &ServerDescription,
    ) -> Option<i64> {
        let primary_last_update = primary.last_update_time?.timestamp_millis();
        let primary_last_write = primary.last_write_date().ok()??.timestamp_millis();

        let secondary_last_update = secondary.last_update_time?.timestamp_millis();
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();

        let heartbeat_frequency = self.heartbeat_frequency().as_millis() as i64;

        let staleness = (secondary_last_update - secondary_last_write)
            - (primary_last_update - primary_last_write)
            + heartbeat_frequency;

        Some(staleness)
    }

    fn calculate_secondary_staleness_without_primary(
        &self,
        secondary: &ServerDescription,
        max_last_write_date: i64,
    ) -> Option<i64> {
        let secondary_last_write = secondary.last_write_date().ok()??.timestamp_millis();
        let heartbeat_frequency = self.heartbeat_frequency().as_millis() as i64;

        let staleness = max_last_write_date - secondary_last_write + heartbeat_frequency;
        Some(staleness)
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matching_servers: Vec<_> = servers
            .iter()
            .filter(|server| server.matches_tag_set(tag_set))
            .collect();

        if !matching_servers.is_empty() {
            *servers = matching_servers.into_iter().cloned().collect();
            return;
        }
    }

    servers.clear();
}
