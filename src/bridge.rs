//! Bridge between the UI and Session threads.
//!
//! Each direction is a bounded, ordered lane plus a wake latch. Senders block
//! when a lane is full instead of dropping messages. The receiving side blocks
//! on its latch with a timeout, and any number of wakes before it gets there
//! collapse into a single drain pass.
//!
//! The Session thread is spawned through the Bridge so that `stop()` can join
//! it with a deadline, and so its exit (clean or not) is visible to the UI.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Lane contents: a payload or the shutdown sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope<T> {
    Message(T),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToSession,
    ToUi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("the other side of the bridge has exited")]
    PeerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Clean,
    /// The Session thread did not exit in time and was left detached.
    TimedOut,
}

/// Blocking wait with an external interrupt.
#[derive(Debug, Default)]
pub struct Waker {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Waker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn wake(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    /// Block until woken or until `timeout` passes. Returns whether a wake
    /// was consumed; the latch is cleared either way.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while !*pending {
            if self.cond.wait_until(&mut pending, deadline).timed_out() {
                break;
            }
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// Result of one drain pass.
#[derive(Debug)]
pub struct Drained<T> {
    pub messages: Vec<T>,
    pub shutdown: bool,
    /// The other side exited; nothing more will arrive.
    pub peer_gone: bool,
}

/// One side of the bridge: an inbox it drains and an outbox it sends on.
pub struct Endpoint<In, Out> {
    inbox: Receiver<Envelope<In>>,
    outbox: Sender<Envelope<Out>>,
    waker: Arc<Waker>,
    peer_waker: Arc<Waker>,
    alive: Arc<AtomicBool>,
    peer_alive: Arc<AtomicBool>,
}

impl<In, Out> Endpoint<In, Out> {
    /// Enqueue a message for the other side and wake it. Blocks while the
    /// lane is full.
    pub fn send(&self, message: Out) -> Result<(), BridgeError> {
        self.outbox
            .send(Envelope::Message(message))
            .map_err(|_| BridgeError::PeerGone)?;
        self.peer_waker.wake();
        Ok(())
    }

    /// Handle other producers (input pumps, transport readers) use to wake
    /// this side.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.waker.wait(timeout)
    }

    pub fn peer_alive(&self) -> bool {
        self.peer_alive.load(Ordering::Acquire)
    }

    /// Take everything currently queued, in order, up to a shutdown sentinel.
    pub fn drain(&self) -> Drained<In> {
        let mut drained = Drained {
            messages: Vec::new(),
            shutdown: false,
            peer_gone: false,
        };
        loop {
            match self.inbox.try_recv() {
                Ok(Envelope::Message(message)) => drained.messages.push(message),
                Ok(Envelope::Shutdown) => {
                    drained.shutdown = true;
                    break;
                }
                Err(TryRecvError::Empty) => {
                    drained.peer_gone = !self.peer_alive();
                    break;
                }
                Err(TryRecvError::Disconnected) => {
                    drained.peer_gone = true;
                    break;
                }
            }
        }
        drained
    }
}

impl<In, Out> Drop for Endpoint<In, Out> {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.peer_waker.wake();
    }
}

/// Messages flowing UI -> Session are `Up`, Session -> UI are `Down`.
pub type UiEndpoint<Up, Down> = Endpoint<Down, Up>;
pub type SessionEndpoint<Up, Down> = Endpoint<Up, Down>;

pub struct Bridge<Up, Down> {
    to_session: Sender<Envelope<Up>>,
    to_ui: Sender<Envelope<Down>>,
    session_waker: Arc<Waker>,
    ui_waker: Arc<Waker>,
    worker: Option<(JoinHandle<()>, Receiver<()>)>,
}

impl<Up, Down> Bridge<Up, Down>
where
    Up: Send + 'static,
    Down: Send + 'static,
{
    /// Create both lanes and run `session` on its own thread with the
    /// Session endpoint. Returns the bridge and the UI endpoint.
    pub fn spawn<F>(capacity: usize, session: F) -> std::io::Result<(Self, UiEndpoint<Up, Down>)>
    where
        F: FnOnce(SessionEndpoint<Up, Down>) + Send + 'static,
    {
        let (to_session, session_inbox) = crossbeam_channel::bounded(capacity.max(1));
        let (to_ui, ui_inbox) = crossbeam_channel::bounded(capacity.max(1));
        let session_waker = Waker::new();
        let ui_waker = Waker::new();
        let session_alive = Arc::new(AtomicBool::new(true));
        let ui_alive = Arc::new(AtomicBool::new(true));

        let session_end = Endpoint {
            inbox: session_inbox,
            outbox: to_ui.clone(),
            waker: session_waker.clone(),
            peer_waker: ui_waker.clone(),
            alive: session_alive.clone(),
            peer_alive: ui_alive.clone(),
        };
        let ui_end = Endpoint {
            inbox: ui_inbox,
            outbox: to_session.clone(),
            waker: ui_waker.clone(),
            peer_waker: session_waker.clone(),
            alive: ui_alive,
            peer_alive: session_alive,
        };

        // Dropped when the thread ends, however it ends
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("mixtty-session".into())
            .spawn(move || {
                let _exit = exit_tx;
                session(session_end);
            })?;

        Ok((
            Self {
                to_session,
                to_ui,
                session_waker,
                ui_waker,
                worker: Some((handle, exit_rx)),
            },
            ui_end,
        ))
    }

    pub fn wake(&self, direction: Direction) {
        match direction {
            Direction::ToSession => self.session_waker.wake(),
            Direction::ToUi => self.ui_waker.wake(),
        }
    }

    /// Ask both sides to shut down and wait up to `timeout` for the Session
    /// thread to exit.
    ///
    /// The UI lane sentinel is best effort: the caller is normally the UI
    /// context itself, which is no longer draining.
    pub fn stop(mut self, timeout: Duration) -> StopOutcome {
        let deadline = Instant::now() + timeout;

        let _ = self.to_session.send_deadline(Envelope::Shutdown, deadline);
        self.wake(Direction::ToSession);
        if let Err(TrySendError::Full(_)) = self.to_ui.try_send(Envelope::Shutdown) {
            log::debug!("UI lane full, shutdown sentinel skipped");
        }
        self.wake(Direction::ToUi);

        let Some((handle, exited)) = self.worker.take() else {
            return StopOutcome::Clean;
        };
        match exited.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Session thread did not exit within {:?}", timeout);
                StopOutcome::TimedOut
            }
            _ => {
                if handle.join().is_err() {
                    log::error!("Session thread panicked");
                }
                StopOutcome::Clean
            }
        }
    }
}
