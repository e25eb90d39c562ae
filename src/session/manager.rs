use std::sync::Arc;
use std::time::{Duration, Instant};

use super::backoff::Backoff;
use super::transport::{Connector, Transport};
use super::types::*;
use crate::bridge::{SessionEndpoint, Waker};
use crate::error::{ConnectionError, SessionError};
use crate::mixer::{
    Applied, DisplayItem, Handle, ObjectKind, ObjectRef, ObjectUpdate, Registry,
};

/// Callbacks for live object changes. Enumeration after a (re)connect is
/// reported through snapshots only.
pub trait SessionListener {
    fn on_add(&mut self, _item: &DisplayItem) {}
    fn on_remove(&mut self, _id: &ObjectRef) {}
    fn on_property_change(&mut self, _item: &DisplayItem) {}
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Volume and mute refresh interval
    pub poll_interval: Duration,
    /// Stream property refresh interval
    pub property_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Corruption detections in a row before giving up
    pub corruption_budget: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            property_interval: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            corruption_budget: 3,
        }
    }
}

/// Protocol client state machine. Owns the Registry.
pub struct Session {
    connector: Box<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    state: SessionState,
    registry: Registry,
    listener: Option<Box<dyn SessionListener>>,
    waker: Arc<Waker>,
    backoff: Backoff,
    config: SessionConfig,
    corrupted: u32,
    ever_subscribed: bool,
    next_poll: Instant,
    next_property_poll: Instant,
    last_error: Option<SessionError>,
}

impl Session {
    pub fn new(
        connector: Box<dyn Connector>,
        registry: Registry,
        config: SessionConfig,
        waker: Arc<Waker>,
    ) -> Self {
        let now = Instant::now();
        Self {
            connector,
            transport: None,
            state: SessionState::Disconnected,
            registry,
            listener: None,
            waker,
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            config,
            corrupted: 0,
            ever_subscribed: false,
            next_poll: now,
            next_property_poll: now,
            last_error: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Error behind the most recent state change, if any.
    pub fn take_last_error(&mut self) -> Option<SessionError> {
        self.last_error.take()
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("Session state: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    // ── Connection lifecycle ───────────────────────────────────────────────

    /// Connect, enumerate everything and start listening. On failure the
    /// Session moves to `Reconnecting` or `Fatal` and the error is returned.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        self.connect_at(Instant::now())
    }

    /// `connect` with timers and backoff measured from `now`.
    pub fn connect_at(&mut self, now: Instant) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);
        let result = self
            .connector
            .connect()
            .and_then(|transport| self.enumerate(transport, now));
        if let Err(e) = &result {
            self.fail(e.clone(), now);
        }
        result
    }

    fn enumerate(&mut self, transport: Box<dyn Transport>, now: Instant) -> Result<(), SessionError> {
        self.transport = Some(transport);
        self.set_state(SessionState::Enumerating);
        if !self.registry.is_empty() {
            self.registry.reset_generation();
        }

        // Notifications queue up until enumeration is done
        let wake = self.waker.clone();
        self.transport()?.listen(wake)?;

        let mut forced = Vec::new();
        for kind in [ObjectKind::Sink, ObjectKind::Stream] {
            let handles = self.transport()?.list(kind)?;
            for handle in handles {
                match self.transport()?.fetch(kind, &handle) {
                    Ok(object) => {
                        let applied = self.registry.apply_add(object);
                        forced.extend(applied.newly_forced.map(|l| (handle.clone(), l)));
                    }
                    // Gone between listing and fetching
                    Err(SessionError::UnknownObject(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        self.set_state(SessionState::Subscribed);
        self.ever_subscribed = true;
        self.backoff.reset();
        self.next_poll = now + self.config.poll_interval;
        self.next_property_poll = now + self.config.property_interval;
        log::info!(
            "Subscribed, {} objects in generation {}",
            self.registry.len(),
            self.registry.generation()
        );

        for (handle, level) in forced {
            self.push_forced(&handle, level)?;
        }
        Ok(())
    }

    /// Register the listener for live add/remove/property notifications.
    pub fn subscribe(&mut self, listener: Box<dyn SessionListener>) {
        self.listener = Some(listener);
    }

    /// Drop the connection and all state.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.registry.reset_generation();
        self.set_state(SessionState::Disconnected);
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, SessionError> {
        self.transport.as_mut().ok_or(SessionError::NotConnected)
    }

    fn fail(&mut self, err: SessionError, now: Instant) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.registry.reset_generation();

        let next = match &err {
            SessionError::Corrupted(reason) => {
                self.corrupted += 1;
                log::warn!(
                    "Client state corrupted ({}), reinitialising ({}/{})",
                    reason,
                    self.corrupted,
                    self.config.corruption_budget
                );
                if self.corrupted >= self.config.corruption_budget {
                    SessionState::Fatal {
                        reason: format!("repeated client corruption: {}", reason),
                    }
                } else {
                    // A fresh client is the whole fix, no need to wait
                    SessionState::Reconnecting { backoff_until: now }
                }
            }
            SessionError::Connection(ConnectionError::LookupUnavailable(reason))
                if !self.ever_subscribed =>
            {
                log::error!("No way to reach the audio server: {}", reason);
                SessionState::Fatal {
                    reason: format!("audio server not found: {}", reason),
                }
            }
            _ => {
                let delay = self.backoff.next_delay();
                log::warn!("Session failed ({}), retrying in {:?}", err, delay);
                SessionState::Reconnecting {
                    backoff_until: now + delay,
                }
            }
        };
        self.last_error = Some(err);
        self.set_state(next);
    }

    /// Route an error from a live connection: transport failures and
    /// corruption take the connection down, everything else is the caller's.
    fn check(&mut self, err: SessionError, now: Instant) -> SessionError {
        if err.is_transport_failure() || matches!(err, SessionError::Corrupted(_)) {
            self.fail(err.clone(), now);
        }
        err
    }

    // ── Driving ────────────────────────────────────────────────────────────

    /// Perform whatever the current state calls for at `now`.
    pub fn step(&mut self, now: Instant) {
        match self.state {
            SessionState::Disconnected => {
                let _ = self.connect_at(now);
            }
            SessionState::Reconnecting { backoff_until } if now >= backoff_until => {
                let _ = self.connect_at(now);
            }
            SessionState::Subscribed => {
                let _ = self.poll_tick(now);
            }
            _ => {}
        }
    }

    /// How long the Session context may sleep before `step` has work.
    pub fn next_deadline(&self, now: Instant) -> Duration {
        let at = match &self.state {
            SessionState::Subscribed => self.next_poll.min(self.next_property_poll),
            SessionState::Reconnecting { backoff_until } => *backoff_until,
            SessionState::Fatal { .. } => return Duration::from_secs(3600),
            _ => now,
        };
        at.saturating_duration_since(now)
    }

    /// Apply queued notifications and refresh whatever is due.
    pub fn poll_tick(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Subscribed {
            return Err(SessionError::NotConnected);
        }
        let result = self.poll_inner(now);
        match result {
            Ok(()) => {
                self.corrupted = 0;
                Ok(())
            }
            Err(e) => Err(self.check(e, now)),
        }
    }

    fn poll_inner(&mut self, now: Instant) -> Result<(), SessionError> {
        let events = self.transport()?.take_events()?;
        for event in events {
            self.apply_event(event)?;
        }

        if now >= self.next_poll {
            self.next_poll = now + self.config.poll_interval;
            for handle in self.registry.handles(None) {
                self.refresh_levels(&handle)?;
            }
        }

        if now >= self.next_property_poll {
            self.next_property_poll = now + self.config.property_interval;
            for handle in self.registry.handles(Some(ObjectKind::Stream)) {
                self.refresh_properties(ObjectKind::Stream, &handle)?;
            }
        }
        Ok(())
    }

    fn apply_event(&mut self, event: ServerEvent) -> Result<(), SessionError> {
        match event {
            // Already known: announced while we were still enumerating
            ServerEvent::Added { kind, handle } if self.registry.get(&handle).is_some() => {
                self.refresh_properties(kind, &handle)?;
            }
            ServerEvent::Added { kind, handle } => {
                let object = match self.transport()?.fetch(kind, &handle) {
                    Ok(object) => object,
                    Err(SessionError::UnknownObject(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                let applied = self.registry.apply_add(object);
                log::debug!("Added {}", applied.id);
                self.after_apply(&handle, applied, |l, item| l.on_add(item))?;
            }
            ServerEvent::Removed { handle } => self.remove(&handle),
            ServerEvent::PropertiesChanged { handle } => {
                if let Some(kind) = self.registry.get(&handle).map(|o| o.kind) {
                    self.refresh_properties(kind, &handle)?;
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, handle: &Handle) {
        if self.registry.apply_remove(handle).is_some() {
            let id = self.registry.object_ref(handle);
            log::debug!("Removed {}", id);
            if let Some(listener) = self.listener.as_mut() {
                listener.on_remove(&id);
            }
        }
    }

    fn refresh_levels(&mut self, handle: &Handle) -> Result<(), SessionError> {
        let Some(kind) = self.registry.get(handle).map(|o| o.kind) else {
            return Ok(());
        };
        let transport = self.transport()?;
        let levels = transport
            .volume(kind, handle)
            .and_then(|volume| Ok((volume, transport.muted(kind, handle)?)));
        match levels {
            Ok((volume, muted)) => {
                self.registry.apply_update(
                    handle,
                    ObjectUpdate {
                        volume: Some(volume),
                        muted: Some(muted),
                        properties: None,
                    },
                );
                Ok(())
            }
            // Removal notification is on its way; don't wait for it
            Err(SessionError::UnknownObject(_)) => {
                self.remove(handle);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn refresh_properties(&mut self, kind: ObjectKind, handle: &Handle) -> Result<(), SessionError> {
        let properties = match self.transport()?.properties(kind, handle) {
            Ok(properties) => properties,
            Err(SessionError::UnknownObject(_)) => {
                self.remove(handle);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let unchanged = self
            .registry
            .get(handle)
            .is_some_and(|o| o.properties == properties);
        if unchanged {
            return Ok(());
        }
        if let Some(applied) = self
            .registry
            .apply_update(handle, ObjectUpdate::properties(properties))
        {
            self.after_apply(handle, applied, |l, item| l.on_property_change(item))?;
        }
        Ok(())
    }

    fn after_apply(
        &mut self,
        handle: &Handle,
        applied: Applied,
        notify: impl FnOnce(&mut dyn SessionListener, &DisplayItem),
    ) -> Result<(), SessionError> {
        if let Some(listener) = self.listener.as_mut()
            && let Some(item) = self.registry.item(handle)
        {
            notify(listener.as_mut(), &item);
        }
        if let Some(level) = applied.newly_forced {
            self.push_forced(handle, level)?;
        }
        Ok(())
    }

    /// Send a rule-pinned level to the server.
    fn push_forced(&mut self, handle: &Handle, level: u32) -> Result<(), SessionError> {
        let Some(object) = self.registry.get(handle) else {
            return Ok(());
        };
        let kind = object.kind;
        let volume = vec![level; object.volume.len().max(1)];
        if object.volume == volume {
            return Ok(());
        }
        log::info!("Applying fixed level {} to {}", level, handle);
        match self.transport()?.set_volume(kind, handle, &volume) {
            Ok(()) => {
                self.registry.apply_update(handle, ObjectUpdate::volume(volume));
                Ok(())
            }
            Err(SessionError::UnknownObject(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── User actions ───────────────────────────────────────────────────────

    /// Set every channel of `id` to `level`, clamped to the object's bounds.
    pub fn set_volume(&mut self, id: &ObjectRef, level: u32) -> Result<(), SessionError> {
        let object = self.registry.resolve(id)?;
        let (kind, channels) = (object.kind, object.volume.len().max(1));
        let item = self
            .registry
            .item(&id.handle)
            .ok_or_else(|| SessionError::UnknownObject(id.handle.to_string()))?;
        if item.forced {
            return Err(SessionError::Forced);
        }

        let volume = vec![item.clamp(level); channels];
        match self.transport()?.set_volume(kind, &id.handle, &volume) {
            Ok(()) => {
                self.registry.apply_update(&id.handle, ObjectUpdate::volume(volume));
                Ok(())
            }
            Err(e) => Err(self.check(e, Instant::now())),
        }
    }

    /// Move the displayed level by `delta`.
    pub fn adjust_volume(&mut self, id: &ObjectRef, delta: i64) -> Result<(), SessionError> {
        self.registry.resolve(id)?;
        let current = self
            .registry
            .item(&id.handle)
            .map(|item| item.level)
            .unwrap_or_default();
        let target = (current as i64 + delta).clamp(0, u32::MAX as i64) as u32;
        self.set_volume(id, target)
    }

    pub fn set_mute(&mut self, id: &ObjectRef, muted: bool) -> Result<(), SessionError> {
        let kind = self.registry.resolve(id)?.kind;
        match self.transport()?.set_mute(kind, &id.handle, muted) {
            Ok(()) => {
                self.registry.apply_update(&id.handle, ObjectUpdate::muted(muted));
                Ok(())
            }
            Err(e) => Err(self.check(e, Instant::now())),
        }
    }

    pub fn execute(&mut self, command: Command) -> Result<(), SessionError> {
        match command {
            Command::Adjust { id, delta } => self.adjust_volume(&id, delta),
            Command::ToggleMute { id } => {
                let muted = self.registry.resolve(&id)?.muted;
                self.set_mute(&id, !muted)
            }
        }
    }
}

// ── Session context loop ───────────────────────────────────────────────────

/// Forwards live additions to the UI so it can move focus to them.
struct UiListener {
    added: crossbeam_channel::Sender<ObjectRef>,
}

impl SessionListener for UiListener {
    fn on_add(&mut self, item: &DisplayItem) {
        let _ = self.added.send(item.id.clone());
    }

    fn on_remove(&mut self, id: &ObjectRef) {
        log::trace!("Listener: removed {}", id);
    }

    fn on_property_change(&mut self, item: &DisplayItem) {
        log::trace!("Listener: {} is now {:?}", item.id, item.label);
    }
}

/// Run the Session until told to stop, the UI goes away, or it fails for good.
pub fn run(mut session: Session, endpoint: SessionEndpoint<Command, Update>) {
    let (added_tx, added_rx) = crossbeam_channel::unbounded();
    session.subscribe(Box::new(UiListener { added: added_tx }));

    let mut published_revision = None;
    let mut published_state = None;

    log::info!("Session thread started");
    loop {
        session.step(Instant::now());
        if publish(
            &mut session,
            &endpoint,
            &added_rx,
            &mut published_revision,
            &mut published_state,
        )
        .is_err()
        {
            break;
        }
        if session.state().is_fatal() {
            break;
        }

        let timeout = session.next_deadline(Instant::now());
        endpoint.wait(timeout);

        let drained = endpoint.drain();
        for command in drained.messages {
            log::debug!("Command: {:?}", command);
            if let Err(e) = session.execute(command) {
                log::warn!("Action failed: {}", e);
                if endpoint.send(Update::ActionFailed(e.to_string())).is_err() {
                    break;
                }
            }
        }
        if drained.shutdown || drained.peer_gone {
            break;
        }
    }

    session.close();
    log::info!("Session thread stopped");
}

fn publish(
    session: &mut Session,
    endpoint: &SessionEndpoint<Command, Update>,
    added: &crossbeam_channel::Receiver<ObjectRef>,
    published_revision: &mut Option<u64>,
    published_state: &mut Option<SessionState>,
) -> Result<(), crate::bridge::BridgeError> {
    if published_state.as_ref() != Some(session.state()) {
        if let Some(err) = session.take_last_error()
            && matches!(err, SessionError::Corrupted(_))
        {
            endpoint.send(Update::Notice(format!("reconnecting: {}", err)))?;
        }
        endpoint.send(Update::State(session.state().clone()))?;
        *published_state = Some(session.state().clone());
    }

    let revision = session.registry().revision();
    if *published_revision != Some(revision) {
        let snapshot = session.registry_mut().snapshot();
        endpoint.send(Update::Snapshot(snapshot))?;
        *published_revision = Some(revision);
    }

    // After the snapshot that contains them
    for id in added.try_iter() {
        endpoint.send(Update::Added(id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::{AudioObject, LevelScale, Naming, RuleEngine, RuleSpec};
    use crate::session::fake::FakeServer;
    use std::collections::BTreeMap;

    fn sink(path: &str, alsa_id: &str) -> AudioObject {
        AudioObject::new(path, ObjectKind::Sink)
            .with_property("alsa.id", alsa_id)
            .with_volume(vec![30000, 30000])
    }

    fn stream(path: &str, app: &str) -> AudioObject {
        AudioObject::new(path, ObjectKind::Stream)
            .with_property("application.name", app)
            .with_volume(vec![20000, 20000])
    }

    fn session_with(server: &FakeServer, rules: &[RuleSpec]) -> Session {
        let engine = RuleEngine::compile(rules).unwrap();
        let registry = Registry::new(Arc::new(engine), LevelScale::default(), Naming::default());
        Session::new(
            server.connector(),
            registry,
            SessionConfig::default(),
            Waker::new(),
        )
    }

    fn labels(session: &mut Session) -> Vec<String> {
        session
            .registry_mut()
            .snapshot()
            .items
            .iter()
            .map(|i| i.label.clone())
            .collect()
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<parking_lot::Mutex<Vec<String>>>);

    impl SessionListener for Recorder {
        fn on_add(&mut self, item: &DisplayItem) {
            self.0.lock().push(format!("add {}", item.label));
        }
        fn on_remove(&mut self, id: &ObjectRef) {
            self.0.lock().push(format!("remove {}", id.handle));
        }
        fn on_property_change(&mut self, item: &DisplayItem) {
            self.0.lock().push(format!("change {}", item.label));
        }
    }

    #[test]
    fn test_connect_enumerates_and_subscribes() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        server.insert(sink("/d/1", "PCH"));
        let mut session = session_with(&server, &[]);

        session.connect().unwrap();
        assert_eq!(session.state(), &SessionState::Subscribed);
        assert!(server.0.lock().listening);
        assert_eq!(labels(&mut session), ["PCH", "mpv"]);
    }

    #[test]
    fn test_live_events_applied_after_subscribe() {
        let server = FakeServer::new();
        let mut session = session_with(&server, &[]);
        let recorder = Recorder::default();
        session.subscribe(Box::new(recorder.clone()));
        session.connect().unwrap();

        server.announce(stream("/s/1", "mpv"));
        server.announce(stream("/s/2", "vlc"));
        session.poll_tick(Instant::now()).unwrap();
        assert_eq!(labels(&mut session), ["mpv", "vlc"]);

        server.retract("/s/1");
        session.poll_tick(Instant::now()).unwrap();
        assert_eq!(labels(&mut session), ["vlc"]);
        assert_eq!(
            *recorder.0.lock(),
            ["add mpv", "add vlc", "remove /s/1"]
        );
    }

    #[test]
    fn test_add_for_enumerated_object_is_not_a_live_add() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[]);
        let recorder = Recorder::default();
        session.subscribe(Box::new(recorder.clone()));
        session.connect().unwrap();

        // Announcement raced with enumeration and is replayed afterwards
        server.announce(stream("/s/1", "mpv"));
        session.poll_tick(Instant::now()).unwrap();

        assert!(recorder.0.lock().is_empty());
        assert_eq!(labels(&mut session), ["mpv"]);
    }

    #[test]
    fn test_add_then_remove_before_snapshot_leaves_no_trace() {
        let server = FakeServer::new();
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();
        let before = session.registry_mut().snapshot();

        server.announce(stream("/s/1", "mpv"));
        server.retract("/s/1");
        session.poll_tick(Instant::now()).unwrap();
        assert_eq!(session.registry_mut().snapshot().items, before.items);
    }

    #[test]
    fn test_transport_failure_clears_registry_until_reenumerated() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();
        let old_id = session.registry_mut().snapshot().items[0].id.clone();

        server.fail_next(ConnectionError::Refused("socket closed".into()).into());
        let start = Instant::now();
        assert!(session.poll_tick(start).is_err());
        assert!(matches!(session.state(), SessionState::Reconnecting { .. }));
        assert!(session.registry_mut().snapshot().items.is_empty());

        // Nothing happens before the backoff elapses
        session.step(start);
        assert!(matches!(session.state(), SessionState::Reconnecting { .. }));

        session.step(start + Duration::from_secs(2));
        assert_eq!(session.state(), &SessionState::Subscribed);
        assert_eq!(labels(&mut session), ["mpv"]);
        assert_eq!(session.set_mute(&old_id, true), Err(SessionError::Stale));
    }

    #[test]
    fn test_reconnect_backoff_grows() {
        let server = FakeServer::new();
        server.fail_connects([
            ConnectionError::Refused("down".into()).into(),
            ConnectionError::Refused("down".into()).into(),
        ]);
        let mut session = session_with(&server, &[]);

        let t0 = Instant::now();
        session.step(t0);
        let SessionState::Reconnecting { backoff_until: first } = *session.state() else {
            panic!("expected Reconnecting");
        };
        assert_eq!(first, t0 + Duration::from_secs(1));

        // Not due yet
        session.step(first - Duration::from_millis(1));
        assert_eq!(server.0.lock().connects, 1);

        session.step(first);
        let SessionState::Reconnecting { backoff_until: second } = *session.state() else {
            panic!("expected Reconnecting");
        };
        assert_eq!(second, first + Duration::from_secs(2));
        session.step(second);
        assert_eq!(session.state(), &SessionState::Subscribed);
        assert_eq!(server.0.lock().connects, 3);
    }

    #[test]
    fn test_lookup_unavailable_is_fatal_before_first_connect() {
        let server = FakeServer::new();
        server.fail_connects([ConnectionError::LookupUnavailable("no bus".into()).into()]);
        let mut session = session_with(&server, &[]);
        session.step(Instant::now());
        assert!(session.state().is_fatal());
    }

    #[test]
    fn test_lookup_unavailable_after_subscribe_reconnects() {
        let server = FakeServer::new();
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();

        server.fail_next(ConnectionError::Timeout.into());
        let _ = session.poll_tick(Instant::now());
        server.fail_connects([ConnectionError::LookupUnavailable("no bus".into()).into()]);
        session.step(Instant::now() + Duration::from_secs(5));
        assert!(matches!(session.state(), SessionState::Reconnecting { .. }));
    }

    #[test]
    fn test_corruption_reinitialises_then_goes_fatal() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();

        for round in 1..=3 {
            server.fail_next(SessionError::Corrupted("UnknownMethod".into()));
            let _ = session.poll_tick(Instant::now());
            if round < 3 {
                // Immediate retry with a fresh client
                assert!(matches!(session.state(), SessionState::Reconnecting { .. }));
                session.step(Instant::now());
                assert_eq!(session.state(), &SessionState::Subscribed);
            }
        }
        assert!(session.state().is_fatal());
    }

    #[test]
    fn test_successful_poll_resets_corruption_count() {
        let server = FakeServer::new();
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();

        for _ in 0..5 {
            server.fail_next(SessionError::Corrupted("UnknownMethod".into()));
            let _ = session.poll_tick(Instant::now());
            session.step(Instant::now());
            session.poll_tick(Instant::now()).unwrap();
        }
        assert_eq!(session.state(), &SessionState::Subscribed);
    }

    #[test]
    fn test_poll_refreshes_volume_and_mute() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();

        server.set_raw_volume("/s/1", vec![40000, 40000]);
        server.0.lock().objects.get_mut("/s/1").unwrap().muted = true;
        session.poll_tick(Instant::now() + Duration::from_secs(1)).unwrap();

        let item = session.registry_mut().snapshot().items[0].clone();
        assert_eq!(item.level, 40000);
        assert!(item.muted);
    }

    #[test]
    fn test_volume_set_rule_overrides_poll_and_is_pushed() {
        let rule = RuleSpec {
            equals: BTreeMap::from([("application.name".to_string(), "mpv".to_string())]),
            volume_set: Some(0.5),
            ..Default::default()
        };
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[rule]);
        session.connect().unwrap();

        let pushed = server.0.lock().set_volume_calls.clone();
        assert_eq!(pushed, [("/s/1".to_string(), vec![32768, 32768])]);

        server.set_raw_volume("/s/1", vec![60000, 60000]);
        session.poll_tick(Instant::now() + Duration::from_secs(1)).unwrap();
        let item = session.registry_mut().snapshot().items[0].clone();
        assert_eq!(item.level, 32768);

        let id = item.id.clone();
        assert_eq!(session.set_volume(&id, 1000), Err(SessionError::Forced));
    }

    #[test]
    fn test_property_poll_reevaluates_rules() {
        let hide = RuleSpec {
            equals: BTreeMap::from([("media.role".to_string(), "event".to_string())]),
            hidden: Some(true),
            ..Default::default()
        };
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[hide]);
        let recorder = Recorder::default();
        session.subscribe(Box::new(recorder.clone()));
        session.connect().unwrap();
        assert_eq!(labels(&mut session), ["mpv"]);

        let mut props = stream("/s/1", "mpv").properties;
        props.insert("media.role".into(), "event".into());
        server.set_properties("/s/1", props);
        session.poll_tick(Instant::now() + Duration::from_secs(11)).unwrap();

        assert!(labels(&mut session).is_empty());
        assert!(session.registry().get("/s/1").is_some());
        assert_eq!(*recorder.0.lock(), ["change mpv"]);
    }

    #[test]
    fn test_set_volume_clamps_and_confirms() {
        let rule = RuleSpec {
            equals: BTreeMap::from([("application.name".to_string(), "mpv".to_string())]),
            volume_max: Some(0.5),
            ..Default::default()
        };
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[rule]);
        session.connect().unwrap();
        let id = session.registry_mut().snapshot().items[0].id.clone();

        session.set_volume(&id, 60000).unwrap();
        assert_eq!(server.0.lock().objects["/s/1"].volume, vec![32768, 32768]);
        assert_eq!(session.registry_mut().snapshot().items[0].level, 32768);

        session.adjust_volume(&id, -2768).unwrap();
        assert_eq!(session.registry_mut().snapshot().items[0].level, 30000);
    }

    #[test]
    fn test_action_errors_are_reported_without_state_change() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();
        let id = session.registry_mut().snapshot().items[0].id.clone();

        server.fail_next(SessionError::UnknownObject("/s/1".into()));
        assert_eq!(
            session.execute(Command::ToggleMute { id: id.clone() }),
            Err(SessionError::UnknownObject("/s/1".into()))
        );
        assert_eq!(session.state(), &SessionState::Subscribed);

        session.execute(Command::ToggleMute { id }).unwrap();
        assert!(session.registry_mut().snapshot().items[0].muted);
    }

    #[test]
    fn test_action_transport_failure_triggers_reconnect() {
        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let mut session = session_with(&server, &[]);
        session.connect().unwrap();
        let id = session.registry_mut().snapshot().items[0].id.clone();

        server.fail_next(ConnectionError::Timeout.into());
        assert!(session.set_mute(&id, true).is_err());
        assert!(matches!(session.state(), SessionState::Reconnecting { .. }));
    }

    #[test]
    fn test_run_publishes_and_stops() {
        use crate::bridge::Bridge;

        let server = FakeServer::new();
        server.insert(stream("/s/1", "mpv"));
        let session_server = server.clone();
        let (bridge, ui) = Bridge::<Command, Update>::spawn(8, move |end| {
            let engine = RuleEngine::default();
            let registry =
                Registry::new(Arc::new(engine), LevelScale::default(), Naming::default());
            let session = Session::new(
                session_server.connector(),
                registry,
                SessionConfig::default(),
                end.waker(),
            );
            run(session, end);
        })
        .unwrap();

        let mut snapshot = None;
        for _ in 0..50 {
            ui.wait(Duration::from_millis(100));
            for update in ui.drain().messages {
                if let Update::Snapshot(s) = update
                    && !s.items.is_empty()
                {
                    snapshot = Some(s);
                }
            }
            if snapshot.is_some() {
                break;
            }
        }
        let snapshot = snapshot.expect("no snapshot published");
        assert_eq!(snapshot.items[0].label, "mpv");

        // Live addition arrives as a snapshot followed by an Added marker
        server.announce(stream("/s/2", "vlc"));
        let mut added = None;
        for _ in 0..50 {
            ui.wait(Duration::from_millis(100));
            for update in ui.drain().messages {
                if let Update::Added(id) = update {
                    added = Some(id);
                }
            }
            if added.is_some() {
                break;
            }
        }
        assert_eq!(added.map(|id| id.handle.to_string()), Some("/s/2".to_string()));

        assert_eq!(
            bridge.stop(Duration::from_secs(2)),
            crate::bridge::StopOutcome::Clean
        );
        assert!(!server.0.lock().listening);
    }
}
