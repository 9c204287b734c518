//! Registry of live peer sessions

use super::session::{PeerSession, Role, SessionContext, SessionSnapshot};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns every [`PeerSession`], at most one per peer id
///
/// All access goes through one lock that is never held across an await.
/// Session start-up (transport creation, media attachment) runs on the
/// session's own task after the lock is released.
///
/// # Example
///
/// ```
/// use roomcast::peer::{PeerRegistry, Role, SessionContext};
/// use roomcast::transport::WebRtcTransportFactory;
/// use roomcast::{IceDelivery, RoomcastConfig};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let config = RoomcastConfig::default();
/// let (events, _events_rx) = tokio::sync::mpsc::unbounded_channel();
/// let registry = PeerRegistry::new(SessionContext {
///     local_id: "A".to_string(),
///     transports: Arc::new(WebRtcTransportFactory::new(&config)),
///     media: None,
///     ice_delivery: IceDelivery::Trickle,
///     negotiation_timeout: config.negotiation_timeout(),
///     events,
/// });
///
/// let (session, created) = registry.get_or_create("B", Role::Caller);
/// assert!(created);
/// assert!(!registry.get_or_create("B", Role::Callee).1);
///
/// registry.clear().await;
/// assert!(session.is_closed());
/// # });
/// ```
pub struct PeerRegistry {
    sessions: Mutex<HashMap<String, PeerSession>>,
    context: Arc<SessionContext>,
    next_generation: AtomicU64,
}

impl PeerRegistry {
    /// Create an empty registry whose sessions share `context`
    pub fn new(context: SessionContext) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            context: Arc::new(context),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Our own peer id
    pub fn local_id(&self) -> &str {
        &self.context.local_id
    }

    /// Look up `id`, creating a session with `role` if absent or closed.
    ///
    /// Returns the session and whether it was created by this call.
    pub fn get_or_create(&self, id: &str, role: Role) -> (PeerSession, bool) {
        let (session, driver) = {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(id) {
                // A closed session may still be waiting for its eviction report
                if !existing.is_closed() {
                    return (existing.clone(), false);
                }
                debug!(peer_id = %id, generation = existing.generation(), "Replacing closed session");
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let (session, driver) =
                PeerSession::new(id, role, generation, Arc::clone(&self.context));
            sessions.insert(id.to_string(), session.clone());
            (session, driver)
        };

        info!(peer_id = %id, role = ?role, generation = session.generation(), "Session created");
        driver.spawn();

        (session, true)
    }

    /// Look up `id` without creating
    pub fn get(&self, id: &str) -> Option<PeerSession> {
        self.sessions.lock().get(id).cloned()
    }

    /// Remove `id`, returning its session for the caller to close
    pub fn remove(&self, id: &str) -> Option<PeerSession> {
        let removed = self.sessions.lock().remove(id);
        if removed.is_some() {
            debug!(peer_id = %id, "Session removed");
        }
        removed
    }

    /// Remove `id` only if it is still the session of `generation`
    ///
    /// Used when a session reports its own end, so that a late report never
    /// evicts a newer session for the same peer.
    pub fn remove_generation(&self, id: &str, generation: u64) -> Option<PeerSession> {
        let mut sessions = self.sessions.lock();
        match sessions.get(id) {
            Some(session) if session.generation() == generation => {
                debug!(peer_id = %id, generation, "Session evicted");
                sessions.remove(id)
            }
            _ => None,
        }
    }

    /// Whether a session exists for `id`
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether there are no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Peer ids with their role and state, sorted by id
    pub fn snapshot(&self) -> Vec<(String, SessionSnapshot)> {
        let mut entries: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, session)| (id.clone(), session.snapshot()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Remove and close every session, waiting for each to release its transport
    pub async fn clear(&self) {
        let sessions: Vec<PeerSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }

        info!("Closing {} sessions", sessions.len());
        for session in &sessions {
            session.close();
        }
        futures::future::join_all(sessions.iter().map(|s| s.closed())).await;
    }
}
