//! Server discovery and monitoring for MongoDB deployments.
//!
//! This crate maintains a live description of a MongoDB deployment (standalone, replica set,
//! sharded cluster, or load balanced) by monitoring its servers with the `hello` command, and
//! selects servers for operations according to read preferences and the latency window. The
//! wire protocol itself is not included; embedders supply a [`HelloTransport`] that can issue
//! a `hello` command to an address and return the reply document.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongodb_sdam::{options::{ClientOptions, ServerAddress}, HelloTransport, Topology};
//! # async fn example(transport: Arc<dyn HelloTransport>) -> mongodb_sdam::Result<()> {
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017")?])
//!     .transport(transport)
//!     .build();
//! let topology = Topology::new(options)?;
//! let server = topology.select_server(None).await?;
//! println!("selected {}", server.address());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
mod hello;
pub mod options;
mod runtime;
mod sdam;
pub mod selection_criteria;
mod serde_util;
mod session;
mod srv;
mod trace;

pub use crate::{
    error::{Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply, HelloTransport, TopologyVersion},
    sdam::{
        HandshakePhase,
        ServerDescription,
        ServerInfo,
        ServerType,
        Topology,
        TopologyDescription,
        TopologyType,
    },
    session::{ClusterTime, ServerSession},
};

pub use bson;
