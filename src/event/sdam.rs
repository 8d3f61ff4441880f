//! Contains the events and functionality for monitoring Server Discovery and Monitoring.

use std::time::Duration;

use bson::{oid::ObjectId, Document};

use crate::{
    error::Error,
    options::ServerAddress,
    sdam::{ServerDescription, TopologyDescription},
};

/// Published when a server's description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerDescription,

    /// The server's new description.
    pub new_description: ServerDescription,
}

impl ServerDescriptionChangedEvent {
    pub(crate) fn is_significant_change(&self) -> bool {
        !self
            .previous_description
            .is_equivalent(&self.new_description)
    }
}

/// Published when a server is added to a topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is removed from a topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology's description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,

    /// The topology's previous description.
    pub previous_description: TopologyDescription,

    /// The topology's new description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is shut down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// The unique ID of the topology.
    pub topology_id: ObjectId,
}

/// Published when a heartbeat is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether the heartbeat is part of an awaitable `hello` exchange. Always false in this
    /// crate; retained for event-shape compatibility with streaming monitors.
    pub awaited: bool,
}

/// Published when a heartbeat succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The duration of the heartbeat.
    pub duration: Duration,

    /// The server's reply to the `hello` command.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// See [`ServerHeartbeatStartedEvent::awaited`].
    pub awaited: bool,
}

/// Published when a heartbeat fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The duration of the heartbeat.
    pub duration: Duration,

    /// The error that caused the heartbeat to fail.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// See [`ServerHeartbeatStartedEvent::awaited`].
    pub awaited: bool,
}

/// An event related to Server Discovery and Monitoring.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SdamEvent {
    /// See [`ServerDescriptionChangedEvent`].
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    /// See [`ServerOpeningEvent`].
    ServerOpening(ServerOpeningEvent),
    /// See [`ServerClosedEvent`].
    ServerClosed(ServerClosedEvent),
    /// See [`TopologyDescriptionChangedEvent`].
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    /// See [`TopologyOpeningEvent`].
    TopologyOpening(TopologyOpeningEvent),
    /// See [`TopologyClosedEvent`].
    TopologyClosed(TopologyClosedEvent),
    /// See [`ServerHeartbeatStartedEvent`].
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    /// See [`ServerHeartbeatSucceededEvent`].
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    /// See [`ServerHeartbeatFailedEvent`].
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

/// Applications can implement this trait to observe SDAM events. Handlers are invoked
/// synchronously from the topology worker and must not block.
pub trait SdamEventHandler: Send + Sync {
    /// Handles a published [`SdamEvent`].
    fn handle(&self, event: SdamEvent);
}

impl<F> SdamEventHandler for F
where
    F: Fn(SdamEvent) + Send + Sync,
{
    fn handle(&self, event: SdamEvent) {
        self(event)
    }
}
