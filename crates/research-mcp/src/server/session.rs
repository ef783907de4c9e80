//! Session management for the HTTP transport.
//!
//! A session binds one client to one event stream (the ids are identical)
//! and carries the broadcast channel live SSE frames flow through. Session
//! ids are URL-safe and never contain an underscore, which keeps event-id
//! parsing unambiguous.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, broadcast};

use crate::config::limits;

/// A live SSE frame: the event-store id plus serialized JSON payload.
#[derive(Clone, Debug)]
pub struct SseFrame {
    pub event_id: String,
    pub data: String,
}

/// A single MCP session.
pub struct Session {
    /// Session id; doubles as the event stream id.
    pub id: String,

    /// OAuth subject bound at creation, when authenticated.
    pub subject: Option<String>,

    tx: broadcast::Sender<SseFrame>,
    created_at: Instant,
    last_active: RwLock<Instant>,
}

impl Session {
    fn new(id: String, subject: Option<String>) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { id, subject, tx, created_at: Instant::now(), last_active: RwLock::new(Instant::now()) }
    }

    /// Broadcast a frame to live subscribers; dropped when none are listening.
    pub async fn broadcast(&self, frame: SseFrame) {
        let _ = self.tx.send(frame);
        *self.last_active.write().await = Instant::now();
    }

    /// Subscribe to live frames.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SseFrame> {
        self.tx.subscribe()
    }

    /// Refresh the idle timer.
    pub async fn touch(&self) {
        *self.last_active.write().await = Instant::now();
    }

    /// Whether the idle timeout has elapsed.
    pub async fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active.read().await.elapsed() > timeout
    }

    /// Session age, for the ops surface.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

/// Global session registry.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_timeout(limits::SESSION_IDLE_TIMEOUT)
    }

    #[must_use]
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), idle_timeout }
    }

    /// Create a new session. Ids are uuid-simple, so underscore-free.
    pub async fn create(&self, subject: Option<String>) -> Arc<Session> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(Session::new(id.clone(), subject));
        self.sessions.write().await.insert(id, Arc::clone(&session));

        tracing::info!(session_id = %session.id, "Created session");
        session
    }

    /// Look up a session by id, refreshing its idle timer.
    ///
    /// Externally supplied ids containing an underscore are rejected: they
    /// would corrupt event-id parsing.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        if id.is_empty() || id.contains('_') {
            return None;
        }
        let session = self.sessions.read().await.get(id).cloned()?;
        session.touch().await;
        Some(session)
    }

    /// Tear down a session immediately.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            tracing::info!(session_id = %id, "Removed session");
        }
        removed
    }

    /// Close every session (server shutdown).
    pub async fn drain(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        count
    }

    /// Active session count.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove sessions past the idle timeout.
    pub async fn cleanup_stale(&self) -> usize {
        let stale: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut stale = Vec::new();
            for (id, session) in sessions.iter() {
                if session.is_stale(self.idle_timeout).await {
                    stale.push(id.clone());
                }
            }
            stale
        };

        let count = stale.len();
        if count > 0 {
            let mut sessions = self.sessions.write().await;
            for id in stale {
                sessions.remove(&id);
                tracing::info!(session_id = %id, "Idle session closed");
            }
        }
        count
    }

    /// Start the periodic stale-session sweeper.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limits::SESSION_CLEANUP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let cleaned = manager.cleanup_stale().await;
                if cleaned > 0 {
                    tracing::debug!(count = cleaned, "Session cleanup completed");
                }
            }
        });
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish()
    }
}
