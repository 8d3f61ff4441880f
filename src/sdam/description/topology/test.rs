use std::{collections::HashMap, time::Duration};

use bson::oid::ObjectId;
use pretty_assertions::assert_eq;

use crate::{
    hello::{HelloCommandResponse, HelloReply, LastWrite, TopologyVersion},
    options::ServerAddress,
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

use super::{TopologyDescription, TopologyType};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn topology(seeds: &[&str]) -> TopologyDescription {
    TopologyDescription {
        single_seed: seeds.len() == 1,
        servers: seeds
            .iter()
            .map(|seed| {
                let address = address(seed);
                (address.clone(), ServerDescription::new(&address))
            })
            .collect(),
        ..Default::default()
    }
}

fn ok_response() -> HelloCommandResponse {
    HelloCommandResponse {
        ok: Some(1.0),
        min_wire_version: Some(7),
        max_wire_version: Some(25),
        ..Default::default()
    }
}

fn standalone_response() -> HelloCommandResponse {
    ok_response()
}

fn primary_response(me: &str, hosts: &[&str]) -> HelloCommandResponse {
    HelloCommandResponse {
        set_name: Some("rs".to_string()),
        is_writable_primary: Some(true),
        me: Some(me.to_string()),
        hosts: Some(hosts.iter().map(|s| s.to_string()).collect()),
        ..ok_response()
    }
}

fn secondary_response(me: &str, hosts: &[&str]) -> HelloCommandResponse {
    HelloCommandResponse {
        set_name: Some("rs".to_string()),
        secondary: Some(true),
        me: Some(me.to_string()),
        hosts: Some(hosts.iter().map(|s| s.to_string()).collect()),
        ..ok_response()
    }
}

fn server(addr: &str, response: HelloCommandResponse, rtt: Duration) -> ServerDescription {
    let address = address(addr);
    let reply = HelloReply {
        server_address: address.clone(),
        command_response: response,
        round_trip_time: rtt,
        cluster_time: None,
    };
    ServerDescription::new_from_hello_reply(address, reply)
}

const RTT: Duration = Duration::from_millis(10);

#[test]
fn standalone_with_single_seed_becomes_single() {
    let mut topology = topology(&["a:27017"]);
    topology
        .update(server("a:27017", standalone_response(), RTT))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::Single);
    assert_eq!(topology.servers.len(), 1);
}

#[test]
fn standalone_among_multiple_seeds_is_removed() {
    let mut topology = topology(&["a:27017", "b:27017"]);
    topology
        .update(server("a:27017", standalone_response(), RTT))
        .unwrap();
    assert_eq!(topology.topology_type, TopologyType::Unknown);
    assert!(!topology.servers.contains_key(&address("a:27017")));
}

#[test]
fn primary_reply_discovers_replica_set() {
    let mut topology = topology(&["a:27017"]);
    topology
        .update(server(
            "a:27017",
            primary_response("a:27017", &["a:27017", "b:27017", "c:27017"]),
            RTT,
        ))
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(topology.set_name.as_deref(), Some("rs"));
    assert_eq!(topology.servers.len(), 3);
    assert_eq!(
        topology.servers.get(&address("b:27017")).unwrap().server_type,
        ServerType::Unknown
    );
}

#[test]
fn secondary_reply_discovers_replica_set_without_primary() {
    let mut topology = topology(&["b:27017"]);
    topology
        .update(server(
            "b:27017",
            secondary_response("b:27017", &["a:27017", "b:27017"]),
            RTT,
        ))
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    assert_eq!(topology.servers.len(), 2);
}

#[test]
fn primary_host_list_prunes_membership() {
    let mut topology = topology(&["a:27017", "b:27017", "c:27017"]);
    topology
        .update(server(
            "a:27017",
            primary_response("a:27017", &["a:27017", "b:27017"]),
            RTT,
        ))
        .unwrap();

    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert!(!topology.servers.contains_key(&address("c:27017")));
}

#[test]
fn secondary_with_mismatched_me_is_removed() {
    let mut topology = topology(&["a:27017", "b:27017"]);
    topology
        .update(server(
            "b:27017",
            secondary_response("other:27017", &["a:27017", "b:27017"]),
            RTT,
        ))
        .unwrap();

    assert!(!topology.servers.contains_key(&address("b:27017")));
}

#[test]
fn mismatched_set_name_empties_and_resets_to_unknown() {
    let mut topology = TopologyDescription {
        single_seed: true,
        topology_type: TopologyType::ReplicaSetNoPrimary,
        set_name: Some("expected".to_string()),
        servers: {
            let mut servers = HashMap::new();
            let addr = address("a:27017");
            servers.insert(addr.clone(), ServerDescription::new(&addr));
            servers
        },
        ..Default::default()
    };

    topology
        .update(server(
            "a:27017",
            secondary_response("a:27017", &["a:27017"]),
            RTT,
        ))
        .unwrap();

    // "rs" doesn't match "expected", so the server is removed and the topology resets.
    assert!(topology.servers.is_empty());
    assert_eq!(topology.topology_type, TopologyType::Unknown);
    assert_eq!(topology.set_name, None);
}

#[test]
fn newer_election_demotes_stale_primary() {
    let election_1 = ObjectId::parse_str("000000000000000000000001").unwrap();
    let election_2 = ObjectId::parse_str("000000000000000000000002").unwrap();

    let mut topology = topology(&["a:27017", "b:27017"]);

    let mut old_primary = primary_response("a:27017", &["a:27017", "b:27017"]);
    old_primary.set_version = Some(1);
    old_primary.election_id = Some(election_1);
    topology.update(server("a:27017", old_primary.clone(), RTT)).unwrap();
    assert_eq!(
        topology.servers.get(&address("a:27017")).unwrap().server_type,
        ServerType::RsPrimary
    );

    let mut new_primary = primary_response("b:27017", &["a:27017", "b:27017"]);
    new_primary.set_version = Some(1);
    new_primary.election_id = Some(election_2);
    topology.update(server("b:27017", new_primary, RTT)).unwrap();

    // b won a newer election, so a is invalidated.
    assert_eq!(
        topology.servers.get(&address("b:27017")).unwrap().server_type,
        ServerType::RsPrimary
    );
    assert_eq!(
        topology.servers.get(&address("a:27017")).unwrap().server_type,
        ServerType::Unknown
    );
    assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

    // A belated reply from a claiming the old election must not win back primacy.
    topology.update(server("a:27017", old_primary, RTT)).unwrap();
    assert_eq!(
        topology.servers.get(&address("a:27017")).unwrap().server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology.servers.get(&address("b:27017")).unwrap().server_type,
        ServerType::RsPrimary
    );
}

#[test]
fn stale_topology_version_reply_is_discarded() {
    let process_id = ObjectId::new();
    let mut topology = topology(&["a:27017"]);

    let mut current = primary_response("a:27017", &["a:27017"]);
    current.topology_version = Some(TopologyVersion {
        process_id,
        counter: 5,
    });
    topology.update(server("a:27017", current, RTT)).unwrap();

    let mut stale = secondary_response("a:27017", &["a:27017"]);
    stale.topology_version = Some(TopologyVersion {
        process_id,
        counter: 4,
    });
    topology.update(server("a:27017", stale, RTT)).unwrap();

    // The stale demotion is ignored.
    assert_eq!(
        topology.servers.get(&address("a:27017")).unwrap().server_type,
        ServerType::RsPrimary
    );
}

#[test]
fn incompatible_wire_version_is_reported() {
    let mut topology = topology(&["a:27017"]);
    let mut response = standalone_response();
    response.min_wire_version = Some(2);
    response.max_wire_version = Some(5);
    topology.update(server("a:27017", response, RTT)).unwrap();

    let message = topology.compatibility_error.as_deref().unwrap();
    assert!(message.contains("a:27017"), "{}", message);

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    assert!(topology.suitable_servers_in_latency_window(&criteria).is_err());
}

#[test]
fn round_trip_time_is_averaged() {
    let mut topology = topology(&["a:27017"]);
    topology
        .update(server("a:27017", standalone_response(), Duration::from_millis(10)))
        .unwrap();
    topology
        .update(server("a:27017", standalone_response(), Duration::from_millis(20)))
        .unwrap();

    // new/5 + old*4/5 = 4ms + 8ms
    assert_eq!(
        topology
            .servers
            .get(&address("a:27017"))
            .unwrap()
            .average_round_trip_time,
        Some(Duration::from_millis(12))
    );
}

#[test]
fn logical_session_timeout_is_minimum_across_data_bearing_servers() {
    let mut topology = topology(&["a:27017", "b:27017"]);

    let mut primary = primary_response("a:27017", &["a:27017", "b:27017"]);
    primary.logical_session_timeout_minutes = Some(30);
    topology.update(server("a:27017", primary, RTT)).unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(30 * 60))
    );

    let mut secondary = secondary_response("b:27017", &["a:27017", "b:27017"]);
    secondary.logical_session_timeout_minutes = Some(10);
    topology.update(server("b:27017", secondary, RTT)).unwrap();
    assert_eq!(
        topology.logical_session_timeout,
        Some(Duration::from_secs(10 * 60))
    );
}

#[test]
fn mongos_forwarding_of_read_preferences() {
    let mut topology = topology(&["m1:27017", "m2:27017"]);
    let mongos = HelloCommandResponse {
        msg: Some("isdbgrid".to_string()),
        ..ok_response()
    };
    topology.update(server("m1:27017", mongos, RTT)).unwrap();
    assert_eq!(topology.topology_type, TopologyType::Sharded);

    let nearest = SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
    assert_eq!(
        topology.read_pref_for_command(ServerType::Mongos, Some(&nearest)),
        Some(ReadPreference::Nearest { options: None })
    );

    // A plain secondaryPreferred is the mongos default, so it is not forwarded.
    let secondary_preferred =
        SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred { options: None });
    assert_eq!(
        topology.read_pref_for_command(ServerType::Mongos, Some(&secondary_preferred)),
        None
    );
    assert_eq!(topology.read_pref_for_command(ServerType::Mongos, None), None);
}

#[test]
fn replica_set_reads_carry_explicit_read_preference() {
    let mut topology = topology(&["a:27017"]);
    topology
        .update(server("a:27017", primary_response("a:27017", &["a:27017"]), RTT))
        .unwrap();

    let nearest = SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
    assert_eq!(
        topology.read_pref_for_command(ServerType::RsSecondary, Some(&nearest)),
        Some(ReadPreference::Nearest { options: None })
    );
    assert_eq!(
        topology.read_pref_for_command(ServerType::RsPrimary, None),
        Some(ReadPreference::Primary)
    );
}

mod selection {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A replica set with a primary at 10ms and secondaries at 12ms and 40ms.
    fn replica_set() -> TopologyDescription {
        let mut topology = topology(&["a:27017", "b:27017", "c:27017"]);
        let hosts = &["a:27017", "b:27017", "c:27017"];
        topology
            .update(server(
                "a:27017",
                primary_response("a:27017", hosts),
                Duration::from_millis(10),
            ))
            .unwrap();
        topology
            .update(server(
                "b:27017",
                secondary_response("b:27017", hosts),
                Duration::from_millis(12),
            ))
            .unwrap();
        topology
            .update(server(
                "c:27017",
                secondary_response("c:27017", hosts),
                Duration::from_millis(40),
            ))
            .unwrap();
        topology
    }

    fn addresses_of(servers: Vec<&ServerDescription>) -> Vec<String> {
        let mut addresses: Vec<_> = servers
            .into_iter()
            .map(|server| server.address().to_string())
            .collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn latency_window_limits_candidates() {
        let topology = replica_set();
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });

        // The fastest suitable server is at 10ms; with the default 15ms threshold, only
        // servers at or under 25ms qualify.
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(
            addresses_of(candidates),
            vec!["a:27017".to_string(), "b:27017".to_string()]
        );
    }

    #[test]
    fn primary_read_preference_selects_only_primary() {
        let topology = replica_set();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["a:27017".to_string()]);
    }

    #[test]
    fn secondary_read_preference_excludes_primary() {
        let topology = replica_set();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: None,
        });
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["b:27017".to_string()]);
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let mut topology = topology(&["a:27017"]);
        topology
            .update(server(
                "a:27017",
                primary_response("a:27017", &["a:27017"]),
                RTT,
            ))
            .unwrap();

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
            options: None,
        });
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["a:27017".to_string()]);
    }

    #[test]
    fn unknown_topology_has_no_suitable_servers() {
        let topology = topology(&["a:27017", "b:27017"]);
        let criteria =
            SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
        assert!(topology.select_server(&criteria).unwrap().is_none());
        assert!(topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn tag_sets_are_applied_in_order() {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut topology = topology(hosts);
        topology
            .update(server(
                "a:27017",
                primary_response("a:27017", hosts),
                RTT,
            ))
            .unwrap();

        let mut east = secondary_response("b:27017", hosts);
        east.tags = Some(
            [("dc".to_string(), "east".to_string())]
                .into_iter()
                .collect(),
        );
        topology.update(server("b:27017", east, RTT)).unwrap();

        let mut west = secondary_response("c:27017", hosts);
        west.tags = Some(
            [("dc".to_string(), "west".to_string())]
                .into_iter()
                .collect(),
        );
        topology.update(server("c:27017", west, RTT)).unwrap();

        let tag_sets: Vec<TagSet> = vec![
            [("dc".to_string(), "south".to_string())].into_iter().collect(),
            [("dc".to_string(), "west".to_string())].into_iter().collect(),
        ];
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .tag_sets(tag_sets)
                    .build(),
            ),
        });

        // The first tag set matches nothing, so the second decides.
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["c:27017".to_string()]);
    }

    #[test]
    fn predicate_criteria_filters_servers() {
        let topology = replica_set();
        let criteria = SelectionCriteria::from_predicate(|server| {
            server.address().port() == Some(27017) && server.address().host() == "c"
        });
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["c:27017".to_string()]);
    }

    fn with_last_write(
        mut response: HelloCommandResponse,
        last_write_date: bson::DateTime,
    ) -> HelloCommandResponse {
        response.last_write = Some(LastWrite { last_write_date });
        response
    }

    fn secondary_criteria_with_max_staleness(max_staleness: Duration) -> SelectionCriteria {
        SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .max_staleness(max_staleness)
                    .build(),
            ),
        })
    }

    #[test]
    fn max_staleness_excludes_secondary_lagging_the_primary() {
        let hosts = &["a:27017", "b:27017", "c:27017"];
        let mut topology = topology(hosts);
        let now = bson::DateTime::now();
        let behind = bson::DateTime::from_millis(now.timestamp_millis() - 120_000);

        topology
            .update(server(
                "a:27017",
                with_last_write(primary_response("a:27017", hosts), now),
                RTT,
            ))
            .unwrap();
        topology
            .update(server(
                "b:27017",
                with_last_write(secondary_response("b:27017", hosts), now),
                RTT,
            ))
            .unwrap();
        topology
            .update(server(
                "c:27017",
                with_last_write(secondary_response("c:27017", hosts), behind),
                RTT,
            ))
            .unwrap();

        // Staleness is the write lag behind the primary plus the 10s heartbeat frequency, so
        // c sits at roughly 130s while b stays around 10s.
        let criteria = secondary_criteria_with_max_staleness(Duration::from_secs(90));
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["b:27017".to_string()]);
    }

    #[test]
    fn max_staleness_without_primary_compares_to_freshest_secondary() {
        let hosts = &["b:27017", "c:27017"];
        let mut topology = topology(hosts);
        let now = bson::DateTime::now();
        let behind = bson::DateTime::from_millis(now.timestamp_millis() - 120_000);

        topology
            .update(server(
                "b:27017",
                with_last_write(secondary_response("b:27017", hosts), now),
                RTT,
            ))
            .unwrap();
        topology
            .update(server(
                "c:27017",
                with_last_write(secondary_response("c:27017", hosts), behind),
                RTT,
            ))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

        let criteria = secondary_criteria_with_max_staleness(Duration::from_secs(90));
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses_of(candidates), vec!["b:27017".to_string()]);

        // A bound generous enough for the lag keeps both.
        let criteria = secondary_criteria_with_max_staleness(Duration::from_secs(200));
        let candidates = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(
            addresses_of(candidates),
            vec!["b:27017".to_string(), "c:27017".to_string()]
        );
    }

    #[test]
    fn max_staleness_below_ninety_seconds_is_rejected() {
        let topology = replica_set();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .max_staleness(Duration::from_secs(60))
                    .build(),
            ),
        });
        assert!(topology.suitable_servers_in_latency_window(&criteria).is_err());
    }
}
