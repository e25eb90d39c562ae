//! Seam between the Session state machine and the wire protocol.

use std::sync::Arc;

use super::types::ServerEvent;
use crate::bridge::Waker;
use crate::error::SessionError;
use crate::mixer::{AudioObject, Handle, ObjectKind, Properties};

/// Finds the server and opens a fresh client connection.
pub trait Connector: Send {
    fn connect(&mut self) -> Result<Box<dyn Transport>, SessionError>;
}

/// One live client connection.
///
/// Every call may block, but must be bounded by a timeout.
pub trait Transport {
    fn list(&mut self, kind: ObjectKind) -> Result<Vec<Handle>, SessionError>;

    fn properties(&mut self, kind: ObjectKind, handle: &str) -> Result<Properties, SessionError>;

    fn volume(&mut self, kind: ObjectKind, handle: &str) -> Result<Vec<u32>, SessionError>;

    fn muted(&mut self, kind: ObjectKind, handle: &str) -> Result<bool, SessionError>;

    fn set_volume(
        &mut self,
        kind: ObjectKind,
        handle: &str,
        levels: &[u32],
    ) -> Result<(), SessionError>;

    fn set_mute(&mut self, kind: ObjectKind, handle: &str, muted: bool)
    -> Result<(), SessionError>;

    /// Register for add/remove notifications. `wake` is signalled every time
    /// an event is queued.
    fn listen(&mut self, wake: Arc<Waker>) -> Result<(), SessionError>;

    /// Queued notifications, without blocking. An error means the event
    /// stream is gone and the connection with it.
    fn take_events(&mut self) -> Result<Vec<ServerEvent>, SessionError>;

    fn close(&mut self);

    fn fetch(&mut self, kind: ObjectKind, handle: &Handle) -> Result<AudioObject, SessionError> {
        Ok(AudioObject {
            handle: handle.clone(),
            kind,
            properties: self.properties(kind, handle)?,
            volume: self.volume(kind, handle)?,
            muted: self.muted(kind, handle)?,
        })
    }
}
