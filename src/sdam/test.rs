use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, Document};
use futures_util::future::BoxFuture;

use crate::{
    error::{CommandError, Error, ErrorKind, Result},
    event::sdam::{SdamEvent, SdamEventHandler},
    hello::HelloTransport,
    options::{ClientOptions, MonitoringMode, ServerAddress},
    sdam::{description::server::ServerDescription, HandshakePhase, ServerType, Topology, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Transport whose reply for each address can be changed mid-test. Addresses without a
/// configured reply behave as unreachable.
struct MockTransport {
    replies: Mutex<HashMap<ServerAddress, Result<Document>>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
        })
    }

    fn set_reply(&self, address: &str, reply: Result<Document>) {
        self.replies
            .lock()
            .unwrap()
            .insert(address.parse().unwrap(), reply);
    }
}

impl HelloTransport for MockTransport {
    fn send_hello(
        &self,
        address: ServerAddress,
        _command: Document,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<Document>> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| Err(Error::network(format!("{} is unreachable", address))));
        Box::pin(async move { reply })
    }
}

fn primary_doc(me: &str, hosts: &[&str]) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "setName": "rs",
        "me": me,
        "hosts": hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
        "minWireVersion": 7,
        "maxWireVersion": 25,
    }
}

fn secondary_doc(me: &str, hosts: &[&str]) -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": false,
        "secondary": true,
        "setName": "rs",
        "me": me,
        "hosts": hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>(),
        "minWireVersion": 7,
        "maxWireVersion": 25,
    }
}

fn mongos_doc() -> Document {
    doc! {
        "ok": 1,
        "isWritablePrimary": true,
        "msg": "isdbgrid",
        "minWireVersion": 7,
        "maxWireVersion": 25,
    }
}

fn options_with(transport: &Arc<MockTransport>, seeds: &[&str]) -> ClientOptions {
    ClientOptions::builder()
        .hosts(
            seeds
                .iter()
                .map(|seed| seed.parse().unwrap())
                .collect::<Vec<ServerAddress>>(),
        )
        .transport(Arc::clone(transport) as Arc<dyn HelloTransport>)
        .build()
}

fn not_primary_error() -> Error {
    ErrorKind::Command(CommandError {
        code: 10107,
        code_name: "NotWritablePrimary".to_string(),
        message: "not primary".to_string(),
        labels: Vec::new(),
        topology_version: None,
    })
    .into()
}

const NEAREST: SelectionCriteria =
    SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });

#[tokio::test(start_paused = true)]
async fn replica_set_is_discovered_from_a_single_seed() {
    let transport = MockTransport::new();
    let hosts = &["a:27017", "b:27017"];
    transport.set_reply("a:27017", Ok(primary_doc("a:27017", hosts)));
    transport.set_reply("b:27017", Ok(secondary_doc("b:27017", hosts)));

    let topology = Topology::new(options_with(&transport, &["a:27017"])).unwrap();

    let primary = topology.select_server(None).await.unwrap();
    assert_eq!(primary.address().to_string(), "a:27017");
    assert_eq!(primary.server_type(), ServerType::RsPrimary);

    let secondary = topology
        .select_server(Some(&SelectionCriteria::ReadPreference(
            ReadPreference::Secondary { options: None },
        )))
        .await
        .unwrap();
    assert_eq!(secondary.address().to_string(), "b:27017");

    let description = topology.description();
    assert_eq!(description.topology_type(), TopologyType::ReplicaSetWithPrimary);
    assert_eq!(description.server_addresses().count(), 2);

    topology.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn selection_recovers_after_failover() {
    let transport = MockTransport::new();
    let hosts = &["a:27017", "b:27017"];
    transport.set_reply("a:27017", Ok(primary_doc("a:27017", hosts)));
    transport.set_reply("b:27017", Ok(secondary_doc("b:27017", hosts)));

    let topology = Topology::new(options_with(&transport, &["a:27017"])).unwrap();
    let primary = topology.select_server(None).await.unwrap();
    assert_eq!(primary.address().to_string(), "a:27017");

    // a goes down and b is elected.
    transport.set_reply("a:27017", Err(Error::network("connection reset")));
    transport.set_reply("b:27017", Ok(primary_doc("b:27017", hosts)));
    topology
        .handle_application_error(
            "a:27017".parse().unwrap(),
            Error::network("connection reset"),
            HandshakePhase::AfterCompletion,
        )
        .await;

    let primary = topology.select_server(None).await.unwrap();
    assert_eq!(primary.address().to_string(), "b:27017");

    topology.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn selection_times_out_when_no_server_is_suitable() {
    let transport = MockTransport::new();

    let mut options = options_with(&transport, &["a:27017"]);
    options.server_selection_timeout = Some(Duration::from_secs(1));
    let topology = Topology::new(options).unwrap();

    let error = topology.select_server(Some(&NEAREST)).await.unwrap_err();
    let message = error.to_string();
    assert!(
        message.contains("`serverSelectionTimeoutMS` expired"),
        "{}",
        message
    );

    topology.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn application_errors_follow_sdam_rules() {
    let transport = MockTransport::new();
    let mut options = options_with(&transport, &["a:27017", "b:27017"]);
    options.test_options_mut().disable_monitoring_threads = true;
    let topology = Topology::new(options).unwrap();
    let updater = topology.updater();
    let address: ServerAddress = "a:27017".parse().unwrap();
    let hosts = &["a:27017", "b:27017"];

    let primary = ServerDescription::new_from_hello_reply(
        address.clone(),
        crate::hello::hello_reply_from_document(
            address.clone(),
            primary_doc("a:27017", hosts),
            Duration::from_millis(5),
        )
        .unwrap(),
    );
    assert!(updater.update(primary).await);
    assert_eq!(
        topology.watcher().server_description(&address).unwrap().server_type(),
        ServerType::RsPrimary
    );

    // A network timeout on an established connection doesn't indict the server.
    let changed = topology
        .handle_application_error(
            address.clone(),
            Error::network_timeout("socket timeout"),
            HandshakePhase::AfterCompletion,
        )
        .await;
    assert!(!changed);
    assert_eq!(
        topology.watcher().server_description(&address).unwrap().server_type(),
        ServerType::RsPrimary
    );

    // The same timeout during the handshake does.
    let changed = topology
        .handle_application_error(
            address.clone(),
            Error::network_timeout("socket timeout"),
            HandshakePhase::BeforeCompletion,
        )
        .await;
    assert!(changed);
    assert_eq!(
        topology.watcher().server_description(&address).unwrap().server_type(),
        ServerType::Unknown
    );

    // State change errors also mark the server unknown.
    let primary = ServerDescription::new_from_hello_reply(
        address.clone(),
        crate::hello::hello_reply_from_document(
            address.clone(),
            primary_doc("a:27017", hosts),
            Duration::from_millis(5),
        )
        .unwrap(),
    );
    updater.update(primary).await;
    let changed = topology
        .handle_application_error(
            address.clone(),
            not_primary_error(),
            HandshakePhase::AfterCompletion,
        )
        .await;
    assert!(changed);
    let description = topology.watcher().server_description(&address).unwrap();
    assert_eq!(description.server_type(), ServerType::Unknown);
    assert!(description.error().is_some());

    topology.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sync_hosts_reconciles_the_server_set() {
    let transport = MockTransport::new();
    transport.set_reply("a:27017", Ok(mongos_doc()));
    transport.set_reply("b:27017", Ok(mongos_doc()));

    let topology = Topology::new(options_with(&transport, &["a:27017"])).unwrap();
    topology.select_server(Some(&NEAREST)).await.unwrap();

    topology
        .updater()
        .sync_hosts(
            ["b:27017".parse().unwrap()].into_iter().collect(),
        )
        .await;

    let description = topology.description();
    let addresses: Vec<_> = description
        .server_addresses()
        .map(|a| a.to_string())
        .collect();
    assert_eq!(addresses, vec!["b:27017".to_string()]);

    topology.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn events_cover_the_topology_lifecycle() {
    struct EventCollector {
        events: Mutex<Vec<String>>,
    }

    impl SdamEventHandler for EventCollector {
        fn handle(&self, event: SdamEvent) {
            let name = match event {
                SdamEvent::ServerDescriptionChanged(_) => "server_description_changed",
                SdamEvent::ServerOpening(_) => "server_opening",
                SdamEvent::ServerClosed(_) => "server_closed",
                SdamEvent::TopologyDescriptionChanged(_) => "topology_description_changed",
                SdamEvent::TopologyOpening(_) => "topology_opening",
                SdamEvent::TopologyClosed(_) => "topology_closed",
                SdamEvent::ServerHeartbeatStarted(_) => "heartbeat_started",
                SdamEvent::ServerHeartbeatSucceeded(_) => "heartbeat_succeeded",
                SdamEvent::ServerHeartbeatFailed(_) => "heartbeat_failed",
            };
            self.events.lock().unwrap().push(name.to_string());
        }
    }

    let collector = Arc::new(EventCollector {
        events: Mutex::new(Vec::new()),
    });

    let transport = MockTransport::new();
    transport.set_reply("a:27017", Ok(primary_doc("a:27017", &["a:27017"])));

    let mut options = options_with(&transport, &["a:27017"]);
    options.sdam_event_handler = Some(Arc::clone(&collector) as Arc<dyn SdamEventHandler>);
    let topology = Topology::new(options).unwrap();

    {
        let events = collector.events.lock().unwrap();
        assert_eq!(
            &events[..3],
            &[
                "topology_opening".to_string(),
                "server_opening".to_string(),
                "topology_description_changed".to_string(),
            ]
        );
    }

    topology.select_server(None).await.unwrap();
    topology.shutdown().await;

    let events = collector.events.lock().unwrap();
    assert!(events.iter().any(|e| e == "heartbeat_started"));
    assert!(events.iter().any(|e| e == "heartbeat_succeeded"));
    assert!(events.iter().any(|e| e == "server_description_changed"));
    assert!(events.iter().any(|e| e == "server_closed"));
    assert_eq!(events.last().map(String::as_str), Some("topology_closed"));
}

mod on_demand {
    use super::*;

    fn on_demand_options(transport: &Arc<MockTransport>, seeds: &[&str]) -> ClientOptions {
        let mut options = options_with(transport, seeds);
        options.monitoring_mode = Some(MonitoringMode::OnDemand);
        options
    }

    #[tokio::test(start_paused = true)]
    async fn scan_happens_inside_selection() {
        let transport = MockTransport::new();
        let hosts = &["a:27017", "b:27017"];
        transport.set_reply("a:27017", Ok(primary_doc("a:27017", hosts)));
        transport.set_reply("b:27017", Ok(secondary_doc("b:27017", hosts)));

        let topology = Topology::new(on_demand_options(&transport, &["a:27017"])).unwrap();

        // No background monitors exist, so this selection must have scanned on its own.
        let primary = topology.select_server(None).await.unwrap();
        assert_eq!(primary.address().to_string(), "a:27017");
        assert_eq!(
            topology.description().topology_type(),
            TopologyType::ReplicaSetWithPrimary
        );

        topology.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn try_once_fails_after_a_single_scan()  {
        let transport = MockTransport::new();

        let topology = Topology::new(on_demand_options(&transport, &["a:27017"])).unwrap();
        let error = topology.select_server(None).await.unwrap_err();
        let message = error.to_string();
        assert!(message.contains("`serverSelectionTryOnce` set"), "{}", message);
        assert!(message.contains("tried once"), "{}", message);

        topology.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_scans_until_timeout_when_try_once_disabled() {
        let transport = MockTransport::new();

        let mut options = on_demand_options(&transport, &["a:27017"]);
        options.server_selection_try_once = Some(false);
        options.server_selection_timeout = Some(Duration::from_secs(2));
        let topology = Topology::new(options).unwrap();

        let start = tokio::time::Instant::now();
        let error = topology.select_server(None).await.unwrap_err();
        assert!(
            error.to_string().contains("`serverSelectionTimeoutMS` expired"),
            "{}",
            error
        );
        // Rescans are spaced out by the minimum heartbeat frequency until the deadline.
        assert!(start.elapsed() >= Duration::from_secs(2));

        topology.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scan_refreshes_srv_hosts() {
        use crate::{options::SrvSeedlistInfo, srv::LookupHosts};

        let transport = MockTransport::new();
        transport.set_reply("a:27017", Ok(mongos_doc()));
        transport.set_reply("b:27017", Ok(mongos_doc()));

        let mut options = on_demand_options(&transport, &["a:27017"]);
        options.srv_seedlist_info = Some(SrvSeedlistInfo::new(
            "cluster.example.com",
            Duration::from_secs(60),
        ));
        options.test_options_mut().mock_lookup_hosts = Some(LookupHosts {
            hosts: vec!["a:27017".parse().unwrap(), "b:27017".parse().unwrap()],
            min_ttl: Duration::from_secs(60),
        });
        let topology = Topology::new(options).unwrap();

        // The scan re-resolves the SRV records first, so the host added by DNS is checked and
        // selectable within the same selection.
        topology.select_server(None).await.unwrap();
        let mut addresses: Vec<String> = topology
            .description()
            .server_addresses()
            .map(|address| address.to_string())
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["a:27017", "b:27017"]);
        assert_eq!(topology.description().topology_type(), TopologyType::Sharded);

        topology.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn scan_observes_primary_change() {
        let transport = MockTransport::new();
        let hosts = &["a:27017", "b:27017"];
        transport.set_reply("a:27017", Ok(primary_doc("a:27017", hosts)));
        transport.set_reply("b:27017", Ok(secondary_doc("b:27017", hosts)));

        let topology = Topology::new(on_demand_options(&transport, &["a:27017"])).unwrap();
        assert_eq!(
            topology.select_server(None).await.unwrap().address().to_string(),
            "a:27017"
        );

        transport.set_reply("a:27017", Err(Error::network("connection reset")));
        transport.set_reply("b:27017", Ok(primary_doc("b:27017", hosts)));
        topology
            .handle_application_error(
                "a:27017".parse().unwrap(),
                Error::network("connection reset"),
                HandshakePhase::AfterCompletion,
            )
            .await;

        // The error marked a Unknown; the next selection rescans and finds b promoted.
        assert_eq!(
            topology.select_server(None).await.unwrap().address().to_string(),
            "b:27017"
        );

        topology.shutdown().await;
    }
}

mod session {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn session_pool_uses_topology_timeout() {
        let transport = MockTransport::new();
        transport.set_reply("a:27017", Ok(mongos_doc()));

        let topology = Topology::new(options_with(&transport, &["a:27017"])).unwrap();
        topology.select_server(Some(&NEAREST)).await.unwrap();

        let session = topology.start_session().await;
        let id = session.id().clone();
        topology.check_in_session(session).await;

        // Within the timeout the same session is reused.
        let session = topology.start_session().await;
        assert_eq!(session.id(), &id);
        topology.check_in_session(session).await;

        topology.shutdown().await;
    }
}
