use std::{collections::VecDeque, time::Duration};

use tokio::sync::Mutex;

use super::ServerSession;

/// A pool of server sessions, reused in most-recently-returned order so that idle sessions age
/// out from the back of the pool.
#[derive(Debug, Default)]
pub(crate) struct ServerSessionPool {
    pool: Mutex<VecDeque<ServerSession>>,
}

impl ServerSessionPool {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Checks out a server session from the pool. Before doing so, it prunes any expired
    /// sessions from the front of the pool.
    pub(crate) async fn check_out(
        &self,
        logical_session_timeout: Option<Duration>,
    ) -> ServerSession {
        let mut pool = self.pool.lock().await;
        while let Some(session) = pool.pop_front() {
            // If a session is about to expire within the next minute, remove it from pool.
            if !session.is_about_to_expire(logical_session_timeout) {
                return session;
            }
        }
        ServerSession::new()
    }

    /// Checks in a server session to the pool. If it is about to expire or is dirty, it will be
    /// discarded.
    ///
    /// This method will also prune expired sessions from the back of the pool.
    pub(crate) async fn check_in(
        &self,
        session: ServerSession,
        logical_session_timeout: Option<Duration>,
    ) {
        let mut pool = self.pool.lock().await;
        while let Some(pooled_session) = pool.back() {
            if pooled_session.is_about_to_expire(logical_session_timeout) {
                pool.pop_back();
            } else {
                break;
            }
        }

        if !session.dirty && !session.is_about_to_expire(logical_session_timeout) {
            pool.push_front(session);
        }
    }

    pub(crate) async fn clear(&self) {
        self.pool.lock().await.clear();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::ServerSessionPool;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30 * 60));

    #[tokio::test(start_paused = true)]
    async fn pool_is_lifo() {
        let pool = ServerSessionPool::new();

        let first = pool.check_out(TIMEOUT).await;
        let second = pool.check_out(TIMEOUT).await;
        assert_ne!(first.id, second.id);

        pool.check_in(first.clone(), TIMEOUT).await;
        pool.check_in(second.clone(), TIMEOUT).await;

        // The most recently checked-in session comes back first.
        assert_eq!(pool.check_out(TIMEOUT).await.id, second.id);
        assert_eq!(pool.check_out(TIMEOUT).await.id, first.id);
    }

    #[tokio::test(start_paused = true)]
    async fn dirty_and_expired_sessions_are_discarded() {
        let pool = ServerSessionPool::new();

        let mut dirty = pool.check_out(TIMEOUT).await;
        dirty.mark_dirty();
        let dirty_id = dirty.id.clone();
        pool.check_in(dirty, TIMEOUT).await;
        assert_ne!(pool.check_out(TIMEOUT).await.id, dirty_id);

        let stale = pool.check_out(TIMEOUT).await;
        let stale_id = stale.id.clone();
        pool.check_in(stale, TIMEOUT).await;
        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        assert_ne!(pool.check_out(TIMEOUT).await.id, stale_id);
    }
}
