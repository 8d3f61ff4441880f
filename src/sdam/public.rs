use std::{
    borrow::Cow,
    fmt,
    time::Duration,
};

use bson::DateTime;

use crate::{
    error::Error,
    options::ServerAddress,
    selection_criteria::TagSet,
};

pub use crate::sdam::description::{server::ServerType, topology::TopologyType};
pub(crate) use crate::sdam::description::server::ServerDescription;

/// A description of the most up-to-date information known about a server. Further details can
/// be found in the [Server Discovery and Monitoring specification](https://github.com/mongodb/specifications/blob/master/source/server-discovery-and-monitoring/server-discovery-and-monitoring.md).
#[derive(Clone, Debug)]
pub struct ServerInfo<'a> {
    pub(crate) description: Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: Cow::Borrowed(description),
        }
    }

    pub(crate) fn new_owned(description: ServerDescription) -> Self {
        Self {
            description: Cow::Owned(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// from the driver to the server.
    ///
    /// This is the value that the driver uses internally to determine the latency window as
    /// part of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the last time that the driver's monitoring thread for the server updated the
    /// internal information about the server.
    pub fn last_update_time(&self) -> Option<DateTime> {
        self.description.last_update_time
    }

    /// Gets the tags associated with the server.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags().ok().flatten()
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the error that caused the server to be marked Unknown, if any.
    pub fn error(&self) -> Option<&Error> {
        self.description.error()
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {}",
            self.address(),
            self.server_type(),
        )?;

        if let Some(avg_rtt) = self.average_round_trip_time() {
            write!(f, ", Average RTT: {:?}", avg_rtt)?;
        }

        if let Some(last_update_time) = self.last_update_time() {
            write!(f, ", Last Updated: {}", last_update_time)?;
        }

        if let Some(tags) = self.tags() {
            write!(f, ", Tags: {:?}", tags)?;
        }

        if let Some(error) = self.error() {
            write!(f, ", Error: {}", error)?;
        }

        write!(f, " }}")
    }
}
