//! Membership of every admitted session plus the broadcast fan-out.
//!
//! All mutation and iteration goes through one `tokio::sync::Mutex`. A
//! broadcast holds that lock until it has written and flushed the line to every
//! recipient, so broadcasts are totally ordered and two messages can never
//! interleave on the same recipient stream.

use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, Notify},
};
use tracing::{debug, info};

use crate::{line::write_line, notice};

pub type SessionId = u64;

/// Output half of a session's connection.
pub type LineWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Members = HashMap<SessionId, Arc<SessionHandle>>;

/// The registry's view of one session.
///
/// The owning session task keeps its own `Arc` and is the one that finally
/// shuts the writer down; the registry only writes lines through it and, when
/// a write fails, flags the session closed so the owner stops reading.
pub struct SessionHandle {
    id: SessionId,
    username: String,
    writer: Mutex<LineWriter>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl SessionHandle {
    pub fn new(id: SessionId, username: impl Into<String>, writer: LineWriter) -> Self {
        Self {
            id,
            username: username.into(),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the session has been flagged closed.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        // notify_one stores a permit, so a close that lands between the flag
        // check and this await is not lost.
        self.close_signal.notified().await;
    }

    /// Flags the session closed and wakes its owner. Returns `false` if it was
    /// already closed.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_signal.notify_one();
        true
    }

    async fn deliver(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_line(&mut *writer, line).await
    }

    /// Shuts the output half down. Only the owning session calls this.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients that received the submitted line.
    pub delivered: usize,
    /// Sessions whose connection failed during this call and were removed.
    pub evicted: Vec<SessionId>,
}

pub struct Registry {
    sessions: Mutex<Members>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a session that has completed its handshake and announces it to
    /// everyone else. Returns `false` without announcing anything if the id is
    /// already registered.
    pub async fn admit(&self, session: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.lock().await;
        let id = session.id();
        let notice = notice::entered(session.username());

        match sessions.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }

        fan_out(&mut sessions, Some(id), notice).await;
        true
    }

    /// Removes a session and announces its departure.
    ///
    /// Returns `true` only for the call that actually removed it; repeated or
    /// racing calls for the same id see `false` and send nothing.
    pub async fn depart(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.remove(&id) else {
            return false;
        };
        session.close();

        fan_out(&mut sessions, None, notice::left(session.username())).await;
        true
    }

    /// Sends `line` to every registered session except `sender`.
    ///
    /// A recipient whose write fails is removed and closed, and its departure
    /// notice goes out before the lock is released. Delivery to the others
    /// continues regardless.
    ///
    /// A line from a sender that is no longer registered is dropped: once its
    /// departure has been announced, nothing more may be relayed on its behalf.
    pub async fn broadcast(&self, sender: Option<SessionId>, line: &str) -> Delivery {
        let mut sessions = self.sessions.lock().await;
        if let Some(id) = sender {
            if !sessions.contains_key(&id) {
                debug!(session = id, "dropping line from departed sender");
                return Delivery::default();
            }
        }
        fan_out(&mut sessions, sender, line.to_string()).await
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }

    /// Usernames of all current members, sorted. Duplicates are kept.
    pub async fn usernames(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut names: Vec<String> = sessions
            .values()
            .map(|session| session.username().to_string())
            .collect();
        names.sort();
        names
    }
}

async fn fan_out(sessions: &mut Members, sender: Option<SessionId>, line: String) -> Delivery {
    let mut report = Delivery::default();
    let mut pending = VecDeque::from([(sender, line)]);
    let mut first = true;

    while let Some((sender, line)) = pending.pop_front() {
        let mut dead = Vec::new();

        for (id, session) in sessions.iter() {
            if Some(*id) == sender {
                continue;
            }
            match session.deliver(&line).await {
                Ok(()) => {
                    if first {
                        report.delivered += 1;
                    }
                }
                Err(error) => {
                    debug!(session = id, ?error, "write to recipient failed");
                    dead.push(*id);
                }
            }
        }
        first = false;

        for id in dead {
            if let Some(session) = sessions.remove(&id) {
                session.close();
                info!(session = id, username = %session.username(), "evicted dead session");
                report.evicted.push(id);
                pending.push_back((None, notice::left(session.username())));
            }
        }
    }

    report
}
