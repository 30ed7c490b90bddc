use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use super::session::{SessionId, SessionInfo, SessionState};

struct Entry {
    control: TcpStream,
    peer: SocketAddr,
    state: SessionState,
    connected_at: SystemTime,
    frames_received: u64,
}

impl Entry {
    fn info(&self, id: SessionId) -> SessionInfo {
        SessionInfo {
            id,
            peer: self.peer,
            state: self.state,
            connected_at: self.connected_at,
            frames_received: self.frames_received,
        }
    }
}

/// Live sessions of one server, behind a single lock.
///
/// Entries hold a control handle to the session socket so the server can
/// close every connection on shutdown. A session is removed as soon as its
/// connection is closed.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Entry>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Entry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, control: TcpStream, peer: SocketAddr) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(
            id,
            Entry {
                control,
                peer,
                state: SessionState::Connecting,
                connected_at: SystemTime::now(),
                frames_received: 0,
            },
        );
        id
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.state = state;
        }
    }

    pub fn record_frame(&self, id: SessionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.frames_received += 1;
        }
    }

    /// Drop the entry. Returns its final snapshot, marked `Closed`.
    pub fn remove(&self, id: SessionId) -> Option<SessionInfo> {
        self.lock().remove(&id).map(|entry| {
            let mut info = entry.info(id);
            info.state = SessionState::Closed;
            info
        })
    }

    pub fn get(&self, id: SessionId) -> Option<SessionInfo> {
        self.lock().get(&id).map(|entry| entry.info(id))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sessions ordered by id.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| entry.info(*id))
            .collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    /// Shut down every registered socket. Handlers observe the close and
    /// remove their own entries.
    pub fn close_all(&self) -> usize {
        let mut sessions = self.lock();
        for entry in sessions.values_mut() {
            entry.state = SessionState::Closing;
            let _ = entry.control.shutdown(Shutdown::Both);
        }
        sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
