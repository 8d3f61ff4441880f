//! Contains the server session pool and cluster time tracking used for causally-consistent
//! command dispatch.

mod cluster_time;
pub(crate) mod pool;

use std::time::Duration;

use bson::{doc, spec::BinarySubtype, Binary, Document};
use tokio::time::Instant;
use uuid::Uuid;

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// The fallback expiry applied when the topology hasn't yet learned a logical session timeout
/// from a server.
const DEFAULT_LOGICAL_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The amount of time before expiry under which a session is discarded rather than reused, to
/// avoid handing out a session that expires mid-operation.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// A server-side session, identified by its lsid.
#[derive(Clone, Debug)]
pub struct ServerSession {
    /// The id of the server session to which this corresponds.
    id: Document,

    /// The last time an operation was executed with this session.
    last_use: Instant,

    /// Whether a network error was encountered while using this session.
    dirty: bool,
}

impl ServerSession {
    fn new() -> Self {
        let binary = Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        };

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
        }
    }

    /// The lsid document to attach to commands dispatched with this session.
    pub fn id(&self) -> &Document {
        &self.id
    }

    /// Records that an operation was just dispatched with this session.
    pub fn update_last_use(&mut self) {
        self.last_use = Instant::now();
    }

    /// Marks this session as unfit for reuse. Dirty sessions are discarded on check-in rather
    /// than returned to the pool.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether this session is about to expire on the server and should not be reused, possibly
    /// expiring mid-operation.
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = logical_session_timeout.unwrap_or(DEFAULT_LOGICAL_SESSION_TIMEOUT);
        let expiry = match timeout.checked_sub(EXPIRY_SAFETY_MARGIN) {
            Some(remaining) => self.last_use + remaining,
            None => return true,
        };
        Instant::now() >= expiry
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ServerSession;

    #[tokio::test(start_paused = true)]
    async fn session_expiry_includes_safety_margin() {
        let timeout = Some(Duration::from_secs(30 * 60));
        let session = ServerSession::new();
        assert!(!session.is_about_to_expire(timeout));

        // One minute short of timeout is already too close to expiry to reuse.
        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(session.is_about_to_expire(timeout));

        // A timeout shorter than the safety margin is never reusable.
        let session = ServerSession::new();
        assert!(session.is_about_to_expire(Some(Duration::from_secs(30))));
    }
}
