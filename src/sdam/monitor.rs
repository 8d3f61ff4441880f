use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::debug;

use crate::{
    error::{Error, Result},
    event::sdam::{
        SdamEvent,
        SdamEventHandler,
        ServerHeartbeatFailedEvent,
        ServerHeartbeatStartedEvent,
        ServerHeartbeatSucceededEvent,
    },
    hello::{hello_command, hello_reply_from_document, HelloReply, HelloTransport},
    options::{ClientOptions, ServerAddress},
    runtime,
    runtime::WorkerHandleListener,
    sdam::{
        description::server::ServerDescription,
        topology::{TopologyCheckRequestReceiver, TopologyUpdater, TopologyWatcher},
        MIN_HEARTBEAT_FREQUENCY,
    },
    trace::TOPOLOGY_TRACING_EVENT_TARGET,
};

/// Monitor that performs regular heartbeats to determine server status.
pub(crate) struct Monitor {
    address: ServerAddress,
    transport: Arc<dyn HelloTransport>,
    client_options: ClientOptions,
    sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,

    /// Updates instigated by this monitor are applied via this handle.
    topology_updater: TopologyUpdater,

    /// Watcher used to observe the server's current description without waiting for an update.
    topology_watcher: TopologyWatcher,

    /// Receiver for participating in "check now" requests issued during selection.
    request_receiver: TopologyCheckRequestReceiver,

    /// Handle listener used to determine when to stop monitoring: once the server has been
    /// removed from the topology, all the handles will be dropped.
    handle_listener: WorkerHandleListener,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        request_receiver: TopologyCheckRequestReceiver,
        handle_listener: WorkerHandleListener,
        client_options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            transport: client_options.transport.clone(),
            sdam_event_handler: client_options.sdam_event_handler.clone(),
            client_options,
            topology_updater,
            topology_watcher,
            request_receiver,
            handle_listener,
        };

        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.client_options.heartbeat_freq.unwrap_or(
            crate::sdam::DEFAULT_HEARTBEAT_FREQUENCY,
        );

        while self.is_alive() {
            self.check_server().await;

            if !self.is_alive() {
                break;
            }

            // The server can't be checked more frequently than the minimum heartbeat frequency,
            // so sleep for that long regardless of any check requests that come in.
            tokio::select! {
                _ = tokio::time::sleep(self.min_frequency()) => {}
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    break;
                }
            }

            // Wait out the rest of the heartbeat, returning early if an immediate check was
            // requested.
            let wait = heartbeat_frequency
                .checked_sub(self.min_frequency())
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = self.request_receiver.wait_for_check_request(wait) => {}
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    break;
                }
            }
        }

        debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            address = %self.address,
            "monitor stopping"
        );
    }

    fn is_alive(&self) -> bool {
        self.handle_listener.is_alive()
    }

    /// Checks the server, updating the topology based on the result. Returns whether the check
    /// reached the server.
    async fn check_server(&mut self) -> bool {
        let check_result = match self.perform_hello().await {
            Err(e) => {
                let previous_description = self
                    .topology_watcher
                    .server_description(&self.address);

                // Per SDAM, a network error against a previously-available server gets one
                // immediate retry before the server is marked Unknown, to shield selection from
                // a single dropped connection.
                if e.is_network_error()
                    && previous_description
                        .map(|sd| sd.is_available())
                        .unwrap_or(false)
                {
                    self.perform_hello().await
                } else {
                    Err(e)
                }
            }
            other => other,
        };

        match check_result {
            Ok(reply) => {
                let server_description =
                    ServerDescription::new_from_hello_reply(self.address.clone(), reply);
                self.topology_updater.update(server_description).await
            }
            Err(e) => self.handle_error(e).await,
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        self.emit_event(|| {
            SdamEvent::ServerHeartbeatStarted(ServerHeartbeatStartedEvent {
                server_address: self.address.clone(),
                awaited: false,
            })
        });

        let start = Instant::now();
        let result = self
            .transport
            .send_hello(
                self.address.clone(),
                hello_command(),
                self.client_options.connect_timeout(),
            )
            .await
            .and_then(|reply| {
                hello_reply_from_document(self.address.clone(), reply, start.elapsed())
            });
        let duration = start.elapsed();

        match result {
            Ok(ref reply) => {
                self.emit_event(|| {
                    let mut reply_doc = bson::to_document(&reply.command_response)
                        .unwrap_or_default();
                    reply_doc.insert("ok", 1);
                    SdamEvent::ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent {
                        duration,
                        reply: reply_doc,
                        server_address: self.address.clone(),
                        awaited: false,
                    })
                });
            }
            Err(ref failure) => {
                self.emit_event(|| {
                    SdamEvent::ServerHeartbeatFailed(ServerHeartbeatFailedEvent {
                        duration,
                        failure: failure.clone(),
                        server_address: self.address.clone(),
                        awaited: false,
                    })
                });
            }
        }

        result
    }

    async fn handle_error(&mut self, error: Error) -> bool {
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn emit_event(&self, event: impl FnOnce() -> SdamEvent) {
        if let Some(ref handler) = self.sdam_event_handler {
            handler.handle(event());
        }
    }

    fn min_frequency(&self) -> Duration {
        #[cfg(test)]
        {
            self.client_options
                .test_options
                .as_ref()
                .and_then(|to| to.min_heartbeat_freq)
                .unwrap_or(MIN_HEARTBEAT_FREQUENCY)
        }

        #[cfg(not(test))]
        {
            MIN_HEARTBEAT_FREQUENCY
        }
    }
}
