//! In-memory server used by the Session tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::transport::{Connector, Transport};
use super::types::ServerEvent;
use crate::bridge::Waker;
use crate::error::SessionError;
use crate::mixer::{AudioObject, Handle, ObjectKind, Properties};

#[derive(Default)]
pub struct FakeState {
    pub objects: BTreeMap<String, AudioObject>,
    pub events: VecDeque<ServerEvent>,
    /// Results for upcoming connect attempts; empty means success
    pub connect_results: VecDeque<Result<(), SessionError>>,
    /// Error returned by the next transport call
    pub fail_next: Option<SessionError>,
    pub connects: usize,
    pub set_volume_calls: Vec<(String, Vec<u32>)>,
    pub listening: bool,
    pub waker: Option<Arc<Waker>>,
}

#[derive(Clone, Default)]
pub struct FakeServer(pub Arc<Mutex<FakeState>>);

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: AudioObject) {
        self.0.lock().objects.insert(object.handle.to_string(), object);
    }

    /// Add an object and queue the matching notification.
    pub fn announce(&self, object: AudioObject) {
        let mut state = self.0.lock();
        state.events.push_back(ServerEvent::Added {
            kind: object.kind,
            handle: object.handle.clone(),
        });
        state.objects.insert(object.handle.to_string(), object);
        if let Some(waker) = &state.waker {
            waker.wake();
        }
    }

    pub fn retract(&self, handle: &str) {
        let mut state = self.0.lock();
        state.objects.remove(handle);
        state.events.push_back(ServerEvent::Removed {
            handle: Handle::from(handle),
        });
        if let Some(waker) = &state.waker {
            waker.wake();
        }
    }

    pub fn set_raw_volume(&self, handle: &str, volume: Vec<u32>) {
        if let Some(obj) = self.0.lock().objects.get_mut(handle) {
            obj.volume = volume;
        }
    }

    pub fn set_properties(&self, handle: &str, properties: Properties) {
        if let Some(obj) = self.0.lock().objects.get_mut(handle) {
            obj.properties = properties;
        }
    }

    pub fn fail_next(&self, err: SessionError) {
        self.0.lock().fail_next = Some(err);
    }

    pub fn fail_connects(&self, errors: impl IntoIterator<Item = SessionError>) {
        self.0.lock().connect_results.extend(errors.into_iter().map(Err));
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(FakeConnector(self.clone()))
    }
}

struct FakeConnector(FakeServer);

impl Connector for FakeConnector {
    fn connect(&mut self) -> Result<Box<dyn Transport>, SessionError> {
        let mut state = self.0.0.lock();
        state.connects += 1;
        if let Some(Err(e)) = state.connect_results.pop_front() {
            return Err(e);
        }
        state.listening = false;
        state.events.clear();
        Ok(Box::new(FakeTransport(self.0.clone())))
    }
}

struct FakeTransport(FakeServer);

impl FakeTransport {
    fn with<T>(
        &mut self,
        handle: &str,
        f: impl FnOnce(&mut AudioObject) -> T,
    ) -> Result<T, SessionError> {
        let mut state = self.0.0.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        state
            .objects
            .get_mut(handle)
            .map(f)
            .ok_or_else(|| SessionError::UnknownObject(handle.to_string()))
    }
}

impl Transport for FakeTransport {
    fn list(&mut self, kind: ObjectKind) -> Result<Vec<Handle>, SessionError> {
        let mut state = self.0.0.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        Ok(state
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .map(|o| o.handle.clone())
            .collect())
    }

    fn properties(&mut self, _kind: ObjectKind, handle: &str) -> Result<Properties, SessionError> {
        self.with(handle, |o| o.properties.clone())
    }

    fn volume(&mut self, _kind: ObjectKind, handle: &str) -> Result<Vec<u32>, SessionError> {
        self.with(handle, |o| o.volume.clone())
    }

    fn muted(&mut self, _kind: ObjectKind, handle: &str) -> Result<bool, SessionError> {
        self.with(handle, |o| o.muted)
    }

    fn set_volume(
        &mut self,
        _kind: ObjectKind,
        handle: &str,
        levels: &[u32],
    ) -> Result<(), SessionError> {
        self.with(handle, |o| o.volume = levels.to_vec())?;
        self.0
            .0
            .lock()
            .set_volume_calls
            .push((handle.to_string(), levels.to_vec()));
        Ok(())
    }

    fn set_mute(
        &mut self,
        _kind: ObjectKind,
        handle: &str,
        muted: bool,
    ) -> Result<(), SessionError> {
        self.with(handle, |o| o.muted = muted)
    }

    fn listen(&mut self, wake: Arc<Waker>) -> Result<(), SessionError> {
        let mut state = self.0.0.lock();
        state.listening = true;
        state.waker = Some(wake);
        Ok(())
    }

    fn take_events(&mut self) -> Result<Vec<ServerEvent>, SessionError> {
        let mut state = self.0.0.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        Ok(state.events.drain(..).collect())
    }

    fn close(&mut self) {
        self.0.0.lock().listening = false;
    }
}
