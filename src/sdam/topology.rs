use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use bson::oid::ObjectId;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventHandler,
        ServerClosedEvent,
        ServerDescriptionChangedEvent,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
        ServerOpeningEvent,
        TopologyClosedEvent,
        TopologyDescriptionChangedEvent,
        TopologyOpeningEvent,
    },
    hello::{hello_command, hello_reply_from_document},
    options::{ClientOptions, MonitoringMode, ServerAddress},
    runtime::{AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    sdam::{
        description::{
            server::ServerDescription,
            topology::{TopologyDescription, TopologyType},
        },
        description::topology::server_selection::DEFAULT_CRITERIA,
        monitor::Monitor,
        public::ServerInfo,
        srv_polling::SrvPollingMonitor,
        DEFAULT_SERVER_SELECTION_TIMEOUT,
        MIN_HEARTBEAT_FREQUENCY,
    },
    selection_criteria::SelectionCriteria,
    session::{ClusterTime, ServerSession, ServerSessionPool},
    trace::{SERVER_SELECTION_TRACING_EVENT_TARGET, TOPOLOGY_TRACING_EVENT_TARGET},
};

/// The phase of an operation's lifetime in which an application error was encountered. Errors
/// observed while a connection's handshake is still in progress indict the server more strongly
/// than those observed afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandshakePhase {
    /// The error occurred while establishing or authenticating the connection used for the
    /// operation.
    BeforeCompletion,

    /// The error occurred on a connection whose handshake had already completed.
    AfterCompletion,
}

/// A struct providing access to the client's current view of the topology. Clones all point at
/// the same worker, which owns the state and applies updates serially.
#[derive(Clone)]
pub struct Topology {
    id: ObjectId,
    options: Arc<ClientOptions>,
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    session_pool: Arc<ServerSessionPool>,
    on_demand: Arc<Mutex<OnDemandState>>,
    _worker_handle: WorkerHandle,
}

impl Topology {
    /// Creates a new topology from the given seeds and starts monitoring it.
    pub fn new(options: ClientOptions) -> Result<Topology> {
        options.validate()?;
        if let Some(SelectionCriteria::ReadPreference(ref read_pref)) = options.selection_criteria
        {
            read_pref.validate()?;
        }

        let id = ObjectId::new();
        let description = TopologyDescription::new(&options)?;
        let event_handler = options.sdam_event_handler.clone();

        let emit = |event: SdamEvent| {
            if let Some(ref handler) = event_handler {
                handler.handle(event);
            }
        };

        emit(SdamEvent::TopologyOpening(TopologyOpeningEvent {
            topology_id: id,
        }));
        for address in description.server_addresses() {
            emit(SdamEvent::ServerOpening(ServerOpeningEvent {
                address: address.clone(),
                topology_id: id,
            }));
        }
        emit(SdamEvent::TopologyDescriptionChanged(Box::new(
            TopologyDescriptionChangedEvent {
                topology_id: id,
                previous_description: TopologyDescription::default(),
                new_description: description.clone(),
            },
        )));

        let (update_sender, update_receiver) = mpsc::unbounded_channel();
        let updater = TopologyUpdater {
            sender: update_sender,
        };
        let (state_publisher, state_receiver) = watch::channel(description.clone());
        let watcher = TopologyWatcher {
            receiver: state_receiver,
        };
        let (check_request_sender, _) = broadcast::channel(1);
        let check_requester = TopologyCheckRequester {
            sender: check_request_sender,
        };
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let options = Arc::new(options);

        let worker = TopologyWorker {
            id,
            latest_description: description,
            update_receiver,
            publisher: state_publisher,
            options: options.clone(),
            event_handler: options.sdam_event_handler.clone(),
            topology_watcher: watcher.clone(),
            topology_updater: updater.clone(),
            check_requester: check_requester.clone(),
            monitors: HashMap::new(),
            handle_listener,
        };
        worker.start();

        Ok(Topology {
            id,
            options,
            watcher,
            updater,
            check_requester,
            session_pool: Arc::new(ServerSessionPool::new()),
            on_demand: Arc::new(Mutex::new(OnDemandState::default())),
            _worker_handle: worker_handle,
        })
    }

    /// The unique id of this topology, included in the events it emits.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// A snapshot of the current topology description.
    pub fn description(&self) -> TopologyDescription {
        self.watcher.latest()
    }

    /// The highest cluster time seen from any server in the topology.
    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.watcher.latest().cluster_time().cloned()
    }

    /// Advance the topology's cluster time to the given one if it is more recent, as gossiped
    /// in a command reply.
    pub async fn advance_cluster_time(&self, to: ClusterTime) {
        self.updater.advance_cluster_time(to).await;
    }

    /// Selects a server matching `criteria`, waiting for topology updates until one is suitable
    /// or the selection timeout expires. When `criteria` is `None`, the topology's default
    /// criteria are applied, falling back to selecting the primary.
    pub async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
    ) -> Result<ServerInfo<'static>> {
        let criteria = criteria
            .or(self.options.selection_criteria.as_ref())
            .unwrap_or(&DEFAULT_CRITERIA);
        if let SelectionCriteria::ReadPreference(read_pref) = criteria {
            read_pref.validate()?;
        }

        match self.options.monitoring_mode() {
            MonitoringMode::Background => self.select_server_background(criteria).await,
            MonitoringMode::OnDemand => self.select_server_on_demand(criteria).await,
        }
    }

    async fn select_server_background(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<ServerInfo<'static>> {
        let timeout = self
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start = Instant::now();
        let mut watcher = self.watcher.clone();

        loop {
            let description = watcher.observe_latest();

            if let Some(server) = description.select_server(criteria)? {
                debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    address = %server.address(),
                    server_type = %server.server_type(),
                    "server selected"
                );
                return Ok(ServerInfo::new_owned(server.clone()));
            }

            // No suitable server yet; ask the monitors to check immediately and wait for the
            // topology to change.
            self.check_requester.request();

            let remaining = match timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(Error::server_selection(format!(
                        "No suitable servers found: `serverSelectionTimeoutMS` expired: {}",
                        description.server_selection_timeout_error_message(criteria)
                    )))
                }
            };

            if !watcher.wait_for_update(remaining).await {
                if !watcher.is_alive() {
                    return Err(crate::error::ErrorKind::Shutdown.into());
                }
                let latest = watcher.latest();
                return Err(Error::server_selection(format!(
                    "No suitable servers found: `serverSelectionTimeoutMS` expired: {}",
                    latest.server_selection_timeout_error_message(criteria)
                )));
            }
        }
    }

    /// On-demand selection scans the topology synchronously instead of waiting on background
    /// monitors. By default a single scan is attempted (`server_selection_try_once`); otherwise
    /// scanning repeats until the selection timeout expires, spaced out by the minimum
    /// heartbeat frequency.
    async fn select_server_on_demand(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<ServerInfo<'static>> {
        let try_once = self.options.server_selection_try_once.unwrap_or(true);
        let timeout = self
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start = Instant::now();
        let heartbeat_frequency = self.watcher.latest().heartbeat_frequency();

        // Scans are serialized across concurrent selections.
        let mut state = self.on_demand.lock().await;
        let mut tried_once = false;

        loop {
            let scan_needed = state.stale
                || state
                    .last_scan
                    .map_or(true, |last| last.elapsed() >= heartbeat_frequency);

            if scan_needed {
                if let Some(last_scan) = state.last_scan {
                    // Honor the floor between scans even when a rescan is wanted immediately.
                    tokio::time::sleep_until(last_scan + MIN_HEARTBEAT_FREQUENCY).await;
                }
                self.scan(&mut state).await;
                tried_once = true;
            }

            let description = self.watcher.latest();
            if let Some(server) = description.select_server(criteria)? {
                debug!(
                    target: SERVER_SELECTION_TRACING_EVENT_TARGET,
                    address = %server.address(),
                    server_type = %server.server_type(),
                    "server selected"
                );
                return Ok(ServerInfo::new_owned(server.clone()));
            }

            // Selection failed, so whatever we knew about the topology is not good enough.
            state.stale = true;

            if try_once {
                if tried_once {
                    return Err(Error::server_selection(format!(
                        "No suitable servers found (`serverSelectionTryOnce` set): tried once: {}",
                        description.server_selection_timeout_error_message(criteria)
                    )));
                }
            } else if start.elapsed() >= timeout {
                return Err(Error::server_selection(format!(
                    "No suitable servers found: `serverSelectionTimeoutMS` expired: {}",
                    description.server_selection_timeout_error_message(criteria)
                )));
            }
        }
    }

    /// Sequentially checks every server in the topology, feeding the results through the same
    /// update path the background monitors use. SRV-seeded topologies re-resolve their records
    /// first, so the scan covers hosts added by DNS changes.
    async fn scan(&self, state: &mut OnDemandState) {
        if state.srv.is_none() {
            state.srv = SrvPollingMonitor::new(
                self.updater.clone(),
                self.watcher.clone(),
                self.options.clone(),
            );
        }
        if let Some(ref mut srv) = state.srv {
            srv.rescan_if_due().await;
        }

        let addresses: Vec<ServerAddress> =
            self.watcher.latest().server_addresses().cloned().collect();

        for address in addresses {
            self.emit_event(|| {
                SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                    server_address: address.clone(),
                    awaited: false,
                })
            });

            let check_start = Instant::now();
            let result = self
                .options
                .transport
                .send_hello(
                    address.clone(),
                    hello_command(),
                    self.options.connect_timeout(),
                )
                .await
                .and_then(|reply| {
                    hello_reply_from_document(address.clone(), reply, check_start.elapsed())
                });
            let duration = check_start.elapsed();

            match result {
                Ok(reply) => {
                    self.emit_event(|| {
                        let mut reply_doc =
                            bson::to_document(&reply.command_response).unwrap_or_default();
                        reply_doc.insert("ok", 1);
                        SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                            duration,
                            reply: reply_doc,
                            server_address: address.clone(),
                            awaited: false,
                        })
                    });
                    let description =
                        ServerDescription::new_from_hello_reply(address.clone(), reply);
                    self.updater.update(description).await;
                }
                Err(error) => {
                    self.emit_event(|| {
                        SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                            duration,
                            failure: error.clone(),
                            server_address: address.clone(),
                            awaited: false,
                        })
                    });
                    self.updater.handle_monitor_error(address, error).await;
                }
            }
        }

        state.last_scan = Some(Instant::now());
        state.stale = false;
    }

    /// Handles an error that occurred while running an operation against a server in this
    /// topology, marking the server Unknown where the SDAM rules call for it. Returns whether
    /// the topology changed as a result.
    pub async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Checks out a server session, either by reusing a pooled one or starting a new one.
    pub async fn start_session(&self) -> ServerSession {
        let timeout = self.watcher.latest().logical_session_timeout();
        self.session_pool.check_out(timeout).await
    }

    /// Returns a server session to the pool for reuse. Dirty or nearly-expired sessions are
    /// discarded.
    pub async fn check_in_session(&self, session: ServerSession) {
        let timeout = self.watcher.latest().logical_session_timeout();
        self.session_pool.check_in(session, timeout).await;
    }

    /// Stops the monitoring tasks and emits the closing events. Any in-progress selections will
    /// fail once the topology shuts down.
    pub async fn shutdown(&self) {
        self.updater.shutdown().await;
        self.session_pool.clear().await;
    }

    #[cfg(test)]
    pub(crate) fn watcher(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    #[cfg(test)]
    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    fn emit_event(&self, event: impl FnOnce() -> SdamEvent) {
        if let Some(ref handler) = self.options.sdam_event_handler {
            handler.handle(event());
        }
    }
}

/// Bookkeeping for on-demand scanning.
#[derive(Default)]
struct OnDemandState {
    /// Whether the current view of the topology is known to be inadequate, forcing a scan on
    /// the next selection.
    stale: bool,

    /// When the last full scan completed.
    last_scan: Option<Instant>,

    /// SRV re-resolution for seedlists that came from DNS, run at scan time since no polling
    /// task exists in this mode.
    srv: Option<SrvPollingMonitor>,
}

/// Contains the hooks for sending updates to a topology's worker.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            _ => false,
        }
    }

    /// Update the topology using the provided server description, returning a bool indicating
    /// whether the topology changed as a result.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd))).await
    }

    /// Handle an error that occurred during a heartbeat.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn advance_cluster_time(&self, to: ClusterTime) {
        self.send_message(UpdateMessage::AdvanceClusterTime(to)).await;
    }

    /// Replace the topology's host list with the given one, as the result of an SRV re-poll.
    pub(crate) async fn sync_hosts(&self, hosts: HashSet<ServerAddress>) {
        self.send_message(UpdateMessage::SyncHosts(hosts)).await;
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

/// Provides a way to watch for changes in a given topology.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyDescription>,
}

impl TopologyWatcher {
    /// Whether the topology is still active or if all `Topology` handles have been dropped.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clone the current server description for the given address, if present.
    pub(crate) fn server_description(&self, address: &ServerAddress) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .get_server_description(address)
            .cloned()
    }

    /// Clone the latest topology description, marking it as seen so that `wait_for_update` only
    /// wakes for descriptions published after this one.
    pub(crate) fn observe_latest(&mut self) -> TopologyDescription {
        self.receiver.borrow_and_update().clone()
    }

    /// Clone the latest topology description without affecting change tracking.
    pub(crate) fn latest(&self) -> TopologyDescription {
        self.receiver.borrow().clone()
    }

    /// Wait for a new topology description to be published, returning false if the timeout
    /// elapsed or the topology was shut down first.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.receiver.changed())
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false)
    }
}

/// Allows a topology check to be requested of all the monitors at once.
#[derive(Clone, Debug)]
pub(crate) struct TopologyCheckRequester {
    sender: broadcast::Sender<()>,
}

impl TopologyCheckRequester {
    /// Request that all monitors check their servers as soon as the minimum heartbeat
    /// frequency allows.
    pub(crate) fn request(&self) {
        let _ = self.sender.send(());
    }

    fn subscribe(&self) -> TopologyCheckRequestReceiver {
        TopologyCheckRequestReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiver used to listen for topology check requests.
pub(crate) struct TopologyCheckRequestReceiver {
    receiver: broadcast::Receiver<()>,
}

impl TopologyCheckRequestReceiver {
    /// Wait until a check is requested or the timeout elapses, whichever comes first.
    pub(crate) async fn wait_for_check_request(&mut self, timeout: Duration) {
        // Both a lagged receiver and an actual message indicate a request came in.
        let _ = tokio::time::timeout(timeout, self.receiver.recv()).await;
    }
}

#[derive(Debug)]
enum UpdateMessage {
    AdvanceClusterTime(ClusterTime),
    SyncHosts(HashSet<ServerAddress>),
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

struct TopologyWorker {
    id: ObjectId,
    latest_description: TopologyDescription,
    update_receiver: mpsc::UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
    publisher: watch::Sender<TopologyDescription>,
    options: Arc<ClientOptions>,
    event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// Monitors are stopped by dropping their handles; each monitor exits once its server has
    /// been removed from the topology.
    monitors: HashMap<ServerAddress, WorkerHandle>,

    // the following fields stored here for creating new monitors
    topology_watcher: TopologyWatcher,
    topology_updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,

    /// Listener for the handles held by the `Topology` clones; when they are all dropped, the
    /// worker cleans up and stops.
    handle_listener: WorkerHandleListener,
}

impl TopologyWorker {
    fn start(mut self) {
        crate::runtime::spawn(async move {
            if self.monitoring_enabled() {
                let initial_addresses: Vec<_> =
                    self.latest_description.server_addresses().cloned().collect();
                for address in initial_addresses {
                    self.start_monitor(address);
                }

                if self.options.srv_seedlist_info.is_some()
                    && self.latest_description.topology_type() != TopologyType::Single
                {
                    SrvPollingMonitor::start(
                        self.topology_updater.clone(),
                        self.topology_watcher.clone(),
                        self.options.clone(),
                    );
                }
            }

            // Held until after the closing events are emitted, so that `shutdown` doesn't
            // return before cleanup finishes.
            let mut shutdown_ack = None;

            loop {
                tokio::select! {
                    Some(update) = self.update_receiver.recv() => {
                        let (update, ack) = update.into_parts();
                        let changed = match update {
                            UpdateMessage::AdvanceClusterTime(to) => {
                                let mut latest = self.latest_description.clone();
                                latest.advance_cluster_time(&to);
                                self.update_topology(latest)
                            }
                            UpdateMessage::SyncHosts(hosts) => {
                                let mut latest = self.latest_description.clone();
                                latest.sync_hosts(hosts);
                                self.update_topology(latest)
                            }
                            UpdateMessage::ServerUpdate(sd) => self.update_server(*sd),
                            UpdateMessage::MonitorError { address, error } => {
                                self.handle_monitor_error(address, error)
                            }
                            UpdateMessage::ApplicationError { address, error, phase } => {
                                self.handle_application_error(address, error, phase)
                            }
                            UpdateMessage::Shutdown => {
                                shutdown_ack = Some(ack);
                                break;
                            }
                        };
                        ack.acknowledge(changed);
                    }
                    _ = self.handle_listener.wait_for_all_handle_drops() => {
                        break;
                    }
                }
            }

            // Dropping the handles instructs the monitors to stop.
            self.monitors.clear();

            let addresses: Vec<_> = self.latest_description.server_addresses().cloned().collect();
            for address in addresses {
                self.emit_event(|| {
                    SdamEvent::ServerClosed(ServerClosedEvent {
                        address,
                        topology_id: self.id,
                    })
                });
            }
            self.emit_event(|| {
                SdamEvent::TopologyClosed(TopologyClosedEvent {
                    topology_id: self.id,
                })
            });

            if let Some(ack) = shutdown_ack {
                ack.acknowledge(true);
            }
        });
    }

    fn monitoring_enabled(&self) -> bool {
        if self.options.monitoring_mode() != MonitoringMode::Background {
            return false;
        }
        if self.options.load_balanced == Some(true) {
            return false;
        }

        #[cfg(test)]
        if self
            .options
            .test_options
            .as_ref()
            .map(|to| to.disable_monitoring_threads)
            .unwrap_or(false)
        {
            return false;
        }

        true
    }

    fn start_monitor(&mut self, address: ServerAddress) {
        if !self.monitoring_enabled() || self.monitors.contains_key(&address) {
            return;
        }

        let (handle, listener) = WorkerHandleListener::channel();
        Monitor::start(
            address.clone(),
            self.topology_updater.clone(),
            self.topology_watcher.clone(),
            self.check_requester.subscribe(),
            listener,
            (*self.options).clone(),
        );
        self.monitors.insert(address, handle);
    }

    /// Update the topology using the provided `ServerDescription`, returning whether the
    /// topology changed as a result.
    fn update_server(&mut self, sd: ServerDescription) -> bool {
        let mut latest = self.latest_description.clone();
        if let Err(error) = latest.update(sd) {
            warn!(
                target: TOPOLOGY_TRACING_EVENT_TARGET,
                error = %error,
                "could not apply server description to topology"
            );
            return false;
        }
        self.update_topology(latest)
    }

    /// Replace the current topology description with the given one, emitting events for the
    /// changes, adjusting the monitor set, and publishing the new description for watchers.
    fn update_topology(&mut self, new_description: TopologyDescription) -> bool {
        let old_description =
            std::mem::replace(&mut self.latest_description, new_description.clone());

        let mut monitors_to_start = Vec::new();
        let changed = {
            let diff = match old_description.diff(&new_description) {
                Some(diff) => diff,
                None => return false,
            };

            for address in diff.added_addresses {
                self.emit_event(|| {
                    SdamEvent::ServerOpening(ServerOpeningEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    })
                });
                monitors_to_start.push(address.clone());
            }

            for address in diff.removed_addresses {
                self.monitors.remove(address);
                self.emit_event(|| {
                    SdamEvent::ServerClosed(ServerClosedEvent {
                        address: address.clone(),
                        topology_id: self.id,
                    })
                });
            }

            for (address, (previous, new)) in diff.changed_servers {
                let event = ServerDescriptionChangedEvent {
                    address: address.clone(),
                    topology_id: self.id,
                    previous_description: previous.clone(),
                    new_description: new.clone(),
                };
                if event.is_significant_change() {
                    if let Some(ref error) = event.new_description.error() {
                        warn!(
                            target: TOPOLOGY_TRACING_EVENT_TARGET,
                            address = %address,
                            error = %error,
                            "server marked unknown"
                        );
                    }
                    self.emit_event(|| SdamEvent::ServerDescriptionChanged(Box::new(event)));
                }
            }

            self.emit_event(|| {
                SdamEvent::TopologyDescriptionChanged(Box::new(TopologyDescriptionChangedEvent {
                    topology_id: self.id,
                    previous_description: old_description.clone(),
                    new_description: new_description.clone(),
                }))
            });

            true
        };

        for address in monitors_to_start {
            self.start_monitor(address);
        }

        let _ = self.publisher.send(new_description);

        changed
    }

    /// Mark the server at the given address as Unknown, caching the error that caused it.
    fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description)
    }

    fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        self.mark_server_as_unknown(address, error)
    }

    /// Handle an error that occurred during operation execution, updating the topology per the
    /// SDAM error-handling rules.
    fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        if self
            .latest_description
            .get_server_description(&address)
            .is_none()
        {
            return false;
        }

        if error.is_state_change_error() {
            let updated = self.mark_server_as_unknown(address, error);
            if updated {
                // The server told us the replica set is reconfiguring, so find out where
                // things stand as soon as possible.
                self.check_requester.request();
            }
            updated
        } else if error.is_non_timeout_network_error() {
            self.mark_server_as_unknown(address, error)
        } else if phase == HandshakePhase::BeforeCompletion && error.is_network_error() {
            // Handshake errors indict the server even when they are timeouts.
            self.mark_server_as_unknown(address, error)
        } else {
            false
        }
    }

    fn emit_event(&self, event: impl FnOnce() -> SdamEvent) {
        if let Some(ref handler) = self.event_handler {
            handler.handle(event());
        }
    }
}
