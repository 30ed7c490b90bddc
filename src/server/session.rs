use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use serde::Serialize;

/// Server-assigned session identifier, unique for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Snapshot of one registered session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub connected_at: SystemTime,
    pub frames_received: u64,
}
