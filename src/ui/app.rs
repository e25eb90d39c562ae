//! UI state
//!
//! Everything the terminal loop knows: the last snapshot, which item has
//! focus, the Session state and a transient status message. Keys turn into
//! `Command`s for the Session; nothing here changes levels locally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{FocusDefault, Options};
use crate::mixer::{ObjectRef, Snapshot};
use crate::session::{Command, SessionState, Update};

/// How long a status message stays on screen
const STATUS_TTL: Duration = Duration::from_secs(5);

/// Keys the mixer reacts to, already decoded from terminal events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Up,
    Down,
    Quieter,
    Louder,
    ToggleMute,
    Quit,
    Redraw,
}

/// What the terminal loop should do after a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    None,
    Redraw,
    Quit,
    Send(Command),
}

pub struct App {
    /// Last complete view published by the Session
    snapshot: Arc<Snapshot>,
    /// Focused item, if any
    focus: Option<ObjectRef>,
    /// Index the focused item had, to land nearby when it goes away
    focus_index: usize,
    /// Session connection state
    state: SessionState,
    /// The Session thread is gone; the snapshot is frozen
    degraded: bool,
    /// Transient message and when it was posted
    status: Option<(String, Instant)>,
    /// Time of the last keypress
    last_key: Option<Instant>,
    /// Level delta per Quieter/Louder press
    step: u32,
    focus_default: FocusDefault,
    focus_new_items: bool,
    focus_delay: Duration,
    /// Screen needs repainting
    dirty: bool,
}

impl App {
    pub fn new(options: &Options) -> Self {
        Self {
            snapshot: Arc::new(Snapshot::default()),
            focus: None,
            focus_index: 0,
            state: SessionState::Disconnected,
            degraded: false,
            status: None,
            last_key: None,
            step: options.scale().step(options.adjust_step),
            focus_default: options.focus_default,
            focus_new_items: options.focus_new_items,
            focus_delay: options.focus_delay(),
            dirty: true,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn focused_index(&self) -> Option<usize> {
        self.focus.as_ref().and_then(|id| self.snapshot.index_of(id))
    }

    /// Returns whether a repaint is due, and clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    /// Current status message, if it has not expired.
    pub fn status(&self, now: Instant) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|(_, at)| now.duration_since(*at) < STATUS_TTL)
            .map(|(text, _)| text.as_str())
    }

    pub fn set_status(&mut self, text: impl Into<String>, now: Instant) {
        self.status = Some((text.into(), now));
        self.dirty = true;
    }

    /// Drop an expired status message; returns whether one was dropped.
    pub fn expire_status(&mut self, now: Instant) -> bool {
        if self.status.is_some() && self.status(now).is_none() {
            self.status = None;
            self.dirty = true;
            return true;
        }
        false
    }

    /// The Session side is gone. Keep showing what we have, marked stale.
    pub fn mark_degraded(&mut self) {
        if !self.degraded {
            log::error!("Session thread exited, display is stale");
            self.degraded = true;
            self.dirty = true;
        }
    }

    // ── Session updates ────────────────────────────────────────────────────

    pub fn apply(&mut self, update: Update, now: Instant) {
        match update {
            Update::Snapshot(snapshot) => {
                self.snapshot = snapshot;
                self.refocus();
            }
            Update::State(state) => {
                log::debug!("UI: session is {}", state);
                self.state = state;
            }
            Update::Added(id) => {
                if self.may_steal_focus(now) && self.snapshot.find(&id).is_some() {
                    log::debug!("Focusing new item {}", id);
                    self.set_focus(id);
                }
            }
            Update::ActionFailed(reason) => self.set_status(reason, now),
            Update::Notice(text) => self.set_status(text, now),
        }
        self.dirty = true;
    }

    fn may_steal_focus(&self, now: Instant) -> bool {
        self.focus_new_items
            && self
                .last_key
                .is_none_or(|at| now.duration_since(at) >= self.focus_delay)
    }

    fn set_focus(&mut self, id: ObjectRef) {
        if let Some(index) = self.snapshot.index_of(&id) {
            self.focus_index = index;
        }
        self.focus = Some(id);
    }

    /// Keep focus valid after a new snapshot: the same item if it is still
    /// there, otherwise the one that took its place.
    fn refocus(&mut self) {
        let items = &self.snapshot.items;
        if items.is_empty() {
            self.focus = None;
            return;
        }
        if let Some(index) = self.focused_index() {
            self.focus_index = index;
            return;
        }
        let index = match self.focus {
            Some(_) => self.focus_index.min(items.len() - 1),
            None => match self.focus_default {
                FocusDefault::First => 0,
                FocusDefault::Last => items.len() - 1,
            },
        };
        self.focus_index = index;
        self.focus = Some(items[index].id.clone());
    }

    // ── Keys ───────────────────────────────────────────────────────────────

    pub fn handle_key(&mut self, key: Key, now: Instant) -> Action {
        self.last_key = Some(now);
        match key {
            Key::Quit => Action::Quit,
            Key::Redraw => {
                self.dirty = true;
                Action::Redraw
            }
            Key::Up => self.move_focus(-1),
            Key::Down => self.move_focus(1),
            Key::Quieter => self.command(now, |id, step| Command::Adjust {
                id,
                delta: -(step as i64),
            }),
            Key::Louder => self.command(now, |id, step| Command::Adjust {
                id,
                delta: step as i64,
            }),
            Key::ToggleMute => self.command(now, |id, _| Command::ToggleMute { id }),
        }
    }

    /// Move focus with wrap-around.
    fn move_focus(&mut self, by: isize) -> Action {
        let len = self.snapshot.items.len();
        if len == 0 {
            return Action::None;
        }
        let index = match self.focused_index() {
            Some(i) => (i as isize + by).rem_euclid(len as isize) as usize,
            None => match self.focus_default {
                FocusDefault::First => 0,
                FocusDefault::Last => len - 1,
            },
        };
        let id = self.snapshot.items[index].id.clone();
        self.set_focus(id);
        self.dirty = true;
        Action::Redraw
    }

    fn command(&mut self, now: Instant, build: impl FnOnce(ObjectRef, u32) -> Command) -> Action {
        if self.degraded {
            self.set_status("session stopped, display is stale", now);
            return Action::None;
        }
        let Some(item) = self.focused_index().map(|i| &self.snapshot.items[i]) else {
            return Action::None;
        };
        if item.forced {
            let label = item.label.clone();
            self.set_status(format!("{}: level is fixed by a rule", label), now);
            return Action::None;
        }
        Action::Send(build(item.id.clone(), self.step))
    }
}
