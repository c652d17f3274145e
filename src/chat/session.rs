//! Bounded in-memory conversation sessions

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::domain::ChatMessage;

/// One user's chat, holding at most `capacity` messages
#[derive(Debug, Clone)]
pub struct ConversationSession {
    session_id: String,
    messages: VecDeque<ChatMessage>,
    capacity: usize,
    created_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            session_id: session_id.into(),
            messages: VecDeque::with_capacity(capacity),
            capacity,
            created_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message, evicting the oldest once over capacity
    pub fn append(&mut self, message: ChatMessage) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    /// Copy of the log in append order
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: usize,
}

pub type SharedSession = Arc<Mutex<ConversationSession>>;

/// How many sessions the store keeps and for how long
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_sessions: usize,
    /// Sessions unused for longer than this are dropped; `None` keeps them
    pub idle_ttl: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_sessions: usize::MAX,
            idle_ttl: None,
        }
    }
}

struct Slot {
    session: SharedSession,
    last_used: parking_lot::Mutex<Instant>,
}

impl Slot {
    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Nobody holds the session: no turn running or queued, no reader
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.session) == 1
    }
}

/// All live sessions, keyed by id.
///
/// Each session sits behind its own async mutex; the pipeline holds it for
/// the whole turn, which is what serializes turns on one session. Sessions
/// in use are never evicted.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Slot>>,
    capacity: usize,
    retention: RetentionPolicy,
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_retention(capacity, RetentionPolicy::default())
    }

    pub fn with_retention(capacity: usize, retention: RetentionPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity,
            retention,
        }
    }

    /// Look up a session, creating it when missing or when no id is given
    pub fn get_or_create(&self, session_id: Option<&str>) -> (String, SharedSession) {
        let id = match session_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        if let Some(slot) = self.sessions.read().get(&id) {
            slot.touch();
            return (id, slot.session.clone());
        }

        let mut sessions = self.sessions.write();
        if !sessions.contains_key(&id) {
            self.evict(&mut sessions);
        }
        let slot = sessions.entry(id.clone()).or_insert_with(|| Slot {
            session: Arc::new(Mutex::new(ConversationSession::new(&id, self.capacity))),
            last_used: parking_lot::Mutex::new(Instant::now()),
        });
        slot.touch();
        let session = slot.session.clone();
        (id, session)
    }

    /// Drop expired sessions, then the least recently used ones until there
    /// is room for one more
    fn evict(&self, sessions: &mut HashMap<String, Slot>) {
        let before = sessions.len();

        if let Some(ttl) = self.retention.idle_ttl {
            let now = Instant::now();
            sessions.retain(|_, slot| !slot.is_idle() || now.duration_since(slot.last_used()) < ttl);
        }

        let limit = self.retention.max_sessions.max(1);
        if sessions.len() >= limit {
            let mut idle: Vec<(Instant, String)> = sessions
                .iter()
                .filter(|(_, slot)| slot.is_idle())
                .map(|(id, slot)| (slot.last_used(), id.clone()))
                .collect();
            idle.sort();
            let excess = sessions.len() + 1 - limit;
            for (_, id) in idle.into_iter().take(excess) {
                sessions.remove(&id);
            }
        }

        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "Evicted chat sessions");
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.read().get(session_id).map(|slot| slot.session.clone())
    }

    /// Ordered messages of a session. Waits for a turn in flight to finish.
    pub async fn history(&self, session_id: &str) -> Option<Vec<ChatMessage>> {
        let session = self.get(session_id)?;
        let guard = session.lock().await;
        Some(guard.snapshot())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<SharedSession> = self
            .sessions
            .read()
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let guard = session.lock().await;
            infos.push(SessionInfo {
                session_id: guard.session_id().to_string(),
                created_at: guard.created_at(),
                messages: guard.len(),
            });
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
