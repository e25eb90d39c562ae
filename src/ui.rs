//! Terminal front end
//!
//! Runs on the main thread. Blocks only on the bridge latch, which the
//! Session thread and the keyboard pump both wake.

mod app;
mod input;
mod view;

use std::time::{Duration, Instant};

use app::{Action, App};
use input::InputPump;
use view::Screen;

use crate::bridge::UiEndpoint;
use crate::config::Options;
use crate::error::AppError;
use crate::session::{Command, SessionState, Update};

/// Redraw/poll tick when nothing wakes the UI
const TICK: Duration = Duration::from_millis(250);

/// Drive the screen until the user quits or the Session fails for good.
pub fn run(endpoint: &UiEndpoint<Command, Update>, options: &Options) -> Result<(), AppError> {
    let mut screen = Screen::enter(options.scale(), options.encoding)?;
    let mut pump = InputPump::spawn(endpoint.waker())?;
    let mut app = App::new(options);

    let result = event_loop(endpoint, &mut app, &mut screen, &pump);

    pump.stop();
    drop(screen);
    result
}

fn event_loop(
    endpoint: &UiEndpoint<Command, Update>,
    app: &mut App,
    screen: &mut Screen,
    pump: &InputPump,
) -> Result<(), AppError> {
    loop {
        let now = Instant::now();
        app.expire_status(now);
        if app.take_dirty() {
            screen.draw(app, now)?;
        }

        endpoint.wait(TICK);
        let now = Instant::now();

        for input in pump.keys().try_iter() {
            let key = input?;
            log::debug!("Keypress: {:?}", key);
            match app.handle_key(key, now) {
                Action::Quit => {
                    log::info!("Quit requested");
                    return Ok(());
                }
                Action::Send(command) => {
                    if endpoint.send(command).is_err() {
                        app.mark_degraded();
                    }
                }
                Action::Redraw | Action::None => {}
            }
        }

        let drained = endpoint.drain();
        for update in drained.messages {
            app.apply(update, now);
        }
        if let SessionState::Fatal { reason } = app.state() {
            return Err(AppError::Fatal(reason.clone()));
        }
        if drained.shutdown || drained.peer_gone {
            app.mark_degraded();
        }
    }
}
