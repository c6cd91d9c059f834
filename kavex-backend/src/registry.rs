//! In-memory registry of live plugin sessions, keyed by channel.
//!
//! At most one session per channel is ever `Authenticated`: installing a new
//! one and closing the one it supersedes happen under the same map entry
//! lock.

use kavex_db::{Link, TokenHash};
use scc::HashMap;
use scc::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Handshaking,
    Authenticated,
    Closing,
    Closed,
}

/// What a session knows about the link it authenticated as.
#[derive(Debug, Clone)]
pub struct LinkRef {
    pub guild_id: u64,
    pub channel_id: u64,
    pub token_hash: TokenHash,
    pub server_name: String,
}

impl LinkRef {
    /// Build from a stored link, preferring the name the plugin announced.
    pub fn from_link(link: &Link, announced: Option<&str>) -> Self {
        let server_name = announced
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| link.display_name())
            .to_string();
        Self {
            guild_id: link.guild_id,
            channel_id: link.channel_id,
            token_hash: link.token_hash,
            server_name,
        }
    }

    pub fn short_hash(&self) -> &str {
        &self.token_hash[..12]
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// The session's outbound queue is full.
    Full,
    /// The session is closing or gone.
    Closed,
}

/// One live connection. Owned jointly by its connection task and the
/// registry; never persisted.
#[derive(Debug)]
pub struct Session {
    id: u64,
    link: LinkRef,
    outbound: mpsc::Sender<String>,
    state: watch::Sender<SessionState>,
    last_heartbeat: Mutex<Instant>,
}

impl Session {
    /// Create a session in `Handshaking`. Frames pushed through `send` come
    /// out of the returned receiver in order.
    pub fn new(link: LinkRef, queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(queue_capacity.max(1));
        let (state, _) = watch::channel(SessionState::Handshaking);
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            link,
            outbound,
            state,
            last_heartbeat: Mutex::new(Instant::now()),
        });
        (session, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn link(&self) -> &LinkRef {
        &self.link
    }

    pub fn channel_id(&self) -> u64 {
        self.link.channel_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Watch state transitions (used by the connection task to notice
    /// eviction).
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Queue a serialized frame for the socket. Never waits.
    pub fn send(&self, frame: String) -> Result<(), SendError> {
        if self.state() >= SessionState::Closing {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Refresh liveness.
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_heartbeat.lock() {
            *last = Instant::now();
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }

    /// Ask the connection task to shut down. Returns false if the session
    /// was already closing.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state < SessionState::Closing {
                *state = SessionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Final transition, made by the connection task once the socket is gone.
    pub fn mark_closed(&self) {
        self.state.send_replace(SessionState::Closed);
    }

    fn mark_authenticated(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Handshaking {
                *state = SessionState::Authenticated;
                true
            } else {
                false
            }
        });
    }
}

/// Live sessions by channel id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<u64, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` as the channel's live session, closing whichever
    /// session it supersedes. Returns the evicted session, if any.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let channel_id = session.channel_id();
        session.touch();

        let evicted = match self.sessions.entry_async(channel_id).await {
            Entry::Occupied(mut entry) => {
                session.mark_authenticated();
                let old = std::mem::replace(entry.get_mut(), session.clone());
                old.close();
                Some(old)
            }
            Entry::Vacant(entry) => {
                session.mark_authenticated();
                entry.insert_entry(session.clone());
                None
            }
        };

        match &evicted {
            Some(old) => info!(
                channel_id,
                session_id = session.id(),
                evicted_session_id = old.id(),
                "session superseded by reconnect"
            ),
            None => debug!(channel_id, session_id = session.id(), "session registered"),
        }
        evicted
    }

    /// Remove `session` if it is still the channel's registered session.
    /// Returns false when it was already superseded, evicted or swept.
    pub async fn unregister(&self, session: &Session) -> bool {
        match self.sessions.entry_async(session.channel_id()).await {
            Entry::Occupied(entry) if entry.get().id() == session.id() => {
                entry.remove();
                debug!(
                    channel_id = session.channel_id(),
                    session_id = session.id(),
                    "session unregistered"
                );
                true
            }
            _ => false,
        }
    }

    pub fn heartbeat(&self, session: &Session) {
        session.touch();
    }

    /// The channel's authenticated session, if any.
    pub async fn lookup(&self, channel_id: u64) -> Option<Arc<Session>> {
        self.sessions
            .read_async(&channel_id, |_, session| session.clone())
            .await
            .filter(|session| session.is_authenticated())
    }

    /// Close and remove the channel's session (administrative disconnect or
    /// credential rotation).
    pub async fn evict(&self, channel_id: u64) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove_async(&channel_id).await?;
        session.close();
        info!(channel_id, session_id = session.id(), "session evicted");
        Some(session)
    }

    /// Close and remove every session silent for longer than `timeout`.
    pub async fn sweep(&self, now: Instant, timeout: Duration) -> Vec<Arc<Session>> {
        let mut expired = Vec::new();
        self.sessions
            .retain_async(|_, session| {
                let silent = now.saturating_duration_since(session.last_heartbeat());
                if silent > timeout {
                    session.close();
                    expired.push(session.clone());
                    false
                } else {
                    true
                }
            })
            .await;

        for session in &expired {
            info!(
                channel_id = session.channel_id(),
                session_id = session.id(),
                "session timed out"
            );
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
