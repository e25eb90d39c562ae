//! Keyboard pump
//!
//! Terminal input is read on its own thread so the UI loop only ever blocks
//! on its bridge latch. Decoded keys are queued and the latch is woken.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use super::app::Key;
use crate::bridge::Waker;

/// How long one `poll` may block before the stop flag is checked again
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of reading the terminal: a key, or the error that ended input.
pub type Input = io::Result<Key>;

/// Map a terminal key event to a mixer key.
pub fn decode(key: &KeyEvent) -> Option<Key> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return match key.code {
            KeyCode::Char('l') => Some(Key::Redraw),
            KeyCode::Char('c') => Some(Key::Quit),
            _ => None,
        };
    }
    match key.code {
        KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('p') => Some(Key::Up),
        KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('n') => Some(Key::Down),
        KeyCode::Left | KeyCode::Char('h') | KeyCode::Char('b') => Some(Key::Quieter),
        KeyCode::Right | KeyCode::Char('l') | KeyCode::Char('f') => Some(Key::Louder),
        KeyCode::Char(' ') | KeyCode::Char('m') => Some(Key::ToggleMute),
        KeyCode::Char('q') => Some(Key::Quit),
        _ => None,
    }
}

pub struct InputPump {
    keys: Receiver<Input>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputPump {
    pub fn spawn(waker: Arc<Waker>) -> io::Result<Self> {
        let (tx, keys) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let run = running.clone();
        let handle = std::thread::Builder::new()
            .name("mixtty-input".into())
            .spawn(move || pump(tx, run, waker))?;
        Ok(Self {
            keys,
            running,
            handle: Some(handle),
        })
    }

    pub fn keys(&self) -> &Receiver<Input> {
        &self.keys
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::error!("Input thread panicked");
        }
    }
}

impl Drop for InputPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump(tx: Sender<Input>, running: Arc<AtomicBool>, waker: Arc<Waker>) {
    while running.load(Ordering::SeqCst) {
        let key = match event::poll(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) => decode(&key).map(Ok),
                Ok(Event::Resize(..)) => Some(Ok(Key::Redraw)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        };
        let Some(key) = key else { continue };
        let failed = key.is_err();
        if tx.send(key).is_err() {
            break;
        }
        waker.wake();
        if failed {
            break;
        }
    }
    log::debug!("Input thread stopped");
}
