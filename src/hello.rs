use std::time::Duration;

use bson::{oid::ObjectId, DateTime, Document};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    options::ServerAddress,
    sdam::ServerType,
    serde_util,
};

/// Constructs the document for the `hello` command issued by monitors.
pub(crate) fn hello_command() -> Document {
    bson::doc! { "hello": 1 }
}

/// Interprets a raw reply document as the outcome of a `hello` exchange. An unsuccessful
/// command surfaces as an `ErrorKind::Command` error.
pub(crate) fn hello_reply_from_document(
    server_address: ServerAddress,
    reply: Document,
    round_trip_time: Duration,
) -> Result<HelloReply> {
    let ok = match reply.get("ok") {
        Some(bson::Bson::Int32(i)) => Some(*i as f64),
        Some(bson::Bson::Int64(i)) => Some(*i as f64),
        Some(bson::Bson::Double(d)) => Some(*d),
        _ => None,
    };

    if ok != Some(1.0) {
        let command_error: crate::error::CommandError =
            bson::from_document(reply).map_err(|e| {
                crate::error::ErrorKind::InvalidResponse {
                    message: format!("invalid server response: {}", e),
                }
            })?;
        return Err(crate::error::ErrorKind::Command(command_error).into());
    }

    let cluster_time = reply
        .get_document("$clusterTime")
        .ok()
        .and_then(|doc| bson::from_document(doc.clone()).ok());

    let command_response: HelloCommandResponse =
        bson::from_document(reply).map_err(|e| crate::error::ErrorKind::InvalidResponse {
            message: format!("invalid server response: {}", e),
        })?;

    Ok(HelloReply {
        server_address,
        command_response,
        round_trip_time,
        cluster_time,
    })
}

/// The transport over which `hello` commands reach servers. Implementations own connection
/// establishment, wire framing, and timeouts; a fresh logical exchange is expected per call.
pub trait HelloTransport: Send + Sync + 'static {
    /// Sends `command` to the server at `address` and returns the raw reply document.
    ///
    /// The returned future should resolve with an `Err` on network failure or when `timeout`
    /// elapses; errors whose [`is_network_timeout`](crate::error::Error::is_network_timeout)
    /// predicate holds are treated as timeouts by the monitoring layer.
    fn send_hello(
        &self,
        address: ServerAddress,
        command: Document,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Document>>;
}

/// The response to a `hello` command, along with the observed duration of the exchange.
#[derive(Debug, Clone)]
pub struct HelloReply {
    pub server_address: ServerAddress,
    pub command_response: HelloCommandResponse,
    pub round_trip_time: Duration,
    pub cluster_time: Option<crate::session::ClusterTime>,
}

/// The body of the response to a `hello` command.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos, a standalone, or a load balancer.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// The `isWritablePrimary` field introduced alongside the `hello` command.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ok")]
    pub ok: Option<f32>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An instance's message, used for internal purposes.
    pub msg: Option<String>,

    /// The address of the server that returned this response.
    pub me: Option<String>,

    /// The range of versions of the wire protocol that this mongod or mongos instance is capable
    /// of using to communicate with clients.
    pub min_wire_version: Option<i32>,
    pub max_wire_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    /// Whether the server is a replica set other.
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The server's opinion of who the primary is, used when a `RsOther` reply is the only
    /// evidence of a primary's whereabouts.
    pub primary: Option<String>,

    /// A list of all replica set members with their tags.
    pub tags: Option<crate::selection_criteria::TagSet>,

    /// The election id of the primary that reported this reply.
    pub election_id: Option<ObjectId>,

    /// The replica set config version of the reply.
    pub set_version: Option<i32>,

    /// An opaque, strictly-ordered identifier used to discard stale monitoring replies.
    pub topology_version: Option<TopologyVersion>,

    /// Whether the server is a load balancer.
    pub service_id: Option<ObjectId>,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.ok != Some(1.0) {
            ServerType::Unknown
        } else if self.service_id.is_some() {
            ServerType::LoadBalancer
        } else if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout_minutes
            .map(|timeout| Duration::from_secs(timeout as u64 * 60))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    pub last_write_date: DateTime,
}

/// An opaque identifier attached by servers to `hello` replies and state-change errors.
/// Replies carrying an older `TopologyVersion` than the one already recorded for a server are
/// discarded.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub process_id: ObjectId,

    #[serde(serialize_with = "serde_util::serialize_i64_as_bson_int")]
    pub counter: i64,
}

impl TopologyVersion {
    /// Whether a reply bearing `other` should be discarded given this recorded version.
    pub(crate) fn is_more_recent_than(&self, other: TopologyVersion) -> bool {
        self.process_id == other.process_id && self.counter > other.counter
    }
}

#[cfg(test)]
mod test {
    use bson::oid::ObjectId;

    use super::{HelloCommandResponse, TopologyVersion};
    use crate::sdam::ServerType;

    fn ok_response() -> HelloCommandResponse {
        HelloCommandResponse {
            ok: Some(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn server_type_classification() {
        assert_eq!(HelloCommandResponse::default().server_type(), ServerType::Unknown);
        assert_eq!(ok_response().server_type(), ServerType::Standalone);

        let mongos = HelloCommandResponse {
            msg: Some("isdbgrid".to_string()),
            ..ok_response()
        };
        assert_eq!(mongos.server_type(), ServerType::Mongos);

        let primary = HelloCommandResponse {
            set_name: Some("rs".to_string()),
            is_writable_primary: Some(true),
            ..ok_response()
        };
        assert_eq!(primary.server_type(), ServerType::RsPrimary);

        let hidden = HelloCommandResponse {
            set_name: Some("rs".to_string()),
            secondary: Some(true),
            hidden: Some(true),
            ..ok_response()
        };
        assert_eq!(hidden.server_type(), ServerType::RsOther);

        let ghost = HelloCommandResponse {
            is_replica_set: Some(true),
            ..ok_response()
        };
        assert_eq!(ghost.server_type(), ServerType::RsGhost);
    }

    #[test]
    fn topology_version_ordering() {
        let process_id = ObjectId::new();
        let old = TopologyVersion {
            process_id,
            counter: 1,
        };
        let new = TopologyVersion {
            process_id,
            counter: 2,
        };
        assert!(new.is_more_recent_than(old));
        assert!(!old.is_more_recent_than(new));

        // A different process restarts the ordering entirely.
        let other_process = TopologyVersion {
            process_id: ObjectId::new(),
            counter: 0,
        };
        assert!(!other_process.is_more_recent_than(new));
    }
}
