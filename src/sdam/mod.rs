pub(crate) mod description;
mod monitor;
pub(crate) mod public;
pub(crate) mod srv_polling;
#[cfg(test)]
mod test;
pub(crate) mod topology;

use std::time::Duration;

pub use self::{
    public::{ServerInfo, ServerType, TopologyType},
    topology::{HandshakePhase, Topology},
};
pub use description::{server::ServerDescription, topology::TopologyDescription};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The floor on how frequently a server may be checked, whether by a monitor responding to a
/// check request or by an on-demand rescan.
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);
