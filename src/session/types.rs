use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::mixer::{Handle, ObjectKind, ObjectRef, Snapshot};

/// Connection state of the Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Enumerating,
    Subscribed,
    Reconnecting { backoff_until: Instant },
    Fatal { reason: String },
}

impl SessionState {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionState::Fatal { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Enumerating => write!(f, "loading"),
            SessionState::Subscribed => write!(f, "connected"),
            SessionState::Reconnecting { backoff_until } => {
                let left = backoff_until.saturating_duration_since(Instant::now());
                write!(f, "reconnecting in {}s", left.as_secs() + 1)
            }
            SessionState::Fatal { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Notifications from the server, as queued by a `Transport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Added { kind: ObjectKind, handle: Handle },
    Removed { handle: Handle },
    PropertiesChanged { handle: Handle },
}

/// Commands from the UI to the Session thread
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Move the current level by `delta`
    Adjust { id: ObjectRef, delta: i64 },
    ToggleMute { id: ObjectRef },
}

/// Messages from the Session thread to the UI
#[derive(Debug, Clone)]
pub enum Update {
    /// A new complete view of the registry
    Snapshot(Arc<Snapshot>),
    State(SessionState),
    /// An object appeared through a live notification
    Added(ObjectRef),
    /// A user action could not be carried out
    ActionFailed(String),
    /// Something worth telling the user that is not an error of theirs
    Notice(String),
}
