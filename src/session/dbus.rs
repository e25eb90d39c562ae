//! PulseAudio control protocol over D-Bus.
//!
//! PulseAudio exposes its control interface on a private peer-to-peer D-Bus
//! server. Its address is looked up through the session bus, or, for a
//! system-wide daemon that has no session bus presence, found at a
//! well-known socket path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use thiserror::Error;
use zbus::blocking::{Connection, MessageIterator};
use zbus::zvariant::{ObjectPath, OwnedValue, Value};

use super::transport::{Connector, Transport};
use super::types::ServerEvent;
use crate::bridge::Waker;
use crate::config::Encoding;
use crate::error::{ConnectionError, SessionError};
use crate::mixer::{Handle, ObjectKind, Properties};

const ENV_SERVER: &str = "PULSE_DBUS_SERVER";
const SYSTEM_SOCKET: &str = "/run/pulse/dbus-socket";

const LOOKUP_NAME: &str = "org.PulseAudio1";
const LOOKUP_PATH: &str = "/org/pulseaudio/server_lookup1";
const LOOKUP_IFACE: &str = "org.PulseAudio.ServerLookup1";
/// Nobody owns the lookup name: the daemon is not running.
const SERVICE_UNKNOWN_ERROR: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
/// Time a freshly started daemon gets to claim its bus name
const START_GRACE: Duration = Duration::from_secs(1);

const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
const CORE_PATH: &str = "/org/pulseaudio/core1";
const CORE_IFACE: &str = "org.PulseAudio.Core1";

const SIGNALS: &[&str] = &[
    "org.PulseAudio.Core1.NewSink",
    "org.PulseAudio.Core1.SinkRemoved",
    "org.PulseAudio.Core1.NewPlaybackStream",
    "org.PulseAudio.Core1.PlaybackStreamRemoved",
    "org.PulseAudio.Core1.Stream.PropertyListUpdated",
];

/// Error name the server answers with once the client's cached state has
/// drifted from the server's; only a fresh connection recovers from it.
const CORRUPTION_ERROR: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const MISSING_OBJECT_ERRORS: &[&str] = &[
    "org.freedesktop.DBus.Error.UnknownObject",
    "org.PulseAudio.Core1.NoSuchEntityError",
];

fn interface(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Sink => "org.PulseAudio.Core1.Device",
        ObjectKind::Stream => "org.PulseAudio.Core1.Stream",
    }
}

fn classify_method_error(name: &str, detail: String) -> SessionError {
    if name == CORRUPTION_ERROR {
        SessionError::Corrupted(format!("{}: {}", name, detail))
    } else if MISSING_OBJECT_ERRORS.contains(&name) {
        SessionError::UnknownObject(detail)
    } else {
        SessionError::Protocol(format!("{}: {}", name, detail))
    }
}

fn classify(err: zbus::Error) -> SessionError {
    match &err {
        zbus::Error::MethodError(name, detail, _) => {
            classify_method_error(name.as_str(), detail.clone().unwrap_or_default())
        }
        zbus::Error::InputOutput(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            ConnectionError::Timeout.into()
        }
        zbus::Error::InputOutput(io) => ConnectionError::Refused(io.to_string()).into(),
        _ => SessionError::Protocol(err.to_string()),
    }
}

/// Why the session bus could not tell us the server address.
#[derive(Debug, Error)]
enum LookupError {
    #[error("server not running: {0}")]
    ServiceUnknown(String),

    #[error("{0}")]
    Other(String),
}

impl From<zbus::Error> for LookupError {
    fn from(err: zbus::Error) -> Self {
        match &err {
            zbus::Error::MethodError(name, detail, _) if name.as_str() == SERVICE_UNKNOWN_ERROR => {
                LookupError::ServiceUnknown(detail.clone().unwrap_or_default())
            }
            _ => LookupError::Other(err.to_string()),
        }
    }
}

fn lookup_other(err: impl std::fmt::Display) -> LookupError {
    LookupError::Other(err.to_string())
}

/// Ask the desktop's PulseAudio to start; it daemonizes and returns at once.
fn start_server() {
    log::info!("PulseAudio is not running, starting it");
    let status = Command::new("pulseaudio")
        .args(["--start", "--log-target=syslog"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("pulseaudio --start exited with {}", status),
        Err(e) => log::warn!("Failed to run pulseaudio --start: {}", e),
    }
    std::thread::sleep(START_GRACE);
}

fn wrong_type(what: &str, err: impl std::fmt::Display) -> SessionError {
    SessionError::Protocol(format!("unexpected {} reply: {}", what, err))
}

#[derive(Debug, Clone)]
pub struct DbusConnector {
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub encoding: Encoding,
    /// Socket of a system-wide daemon, tried when the session bus has no answer
    pub system_socket: PathBuf,
    /// Run `pulseaudio --start` once when the lookup finds no server
    pub autostart: bool,
}

impl DbusConnector {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(2),
            encoding,
            system_socket: PathBuf::from(SYSTEM_SOCKET),
            autostart: true,
        }
    }

    fn discover(&self) -> Result<String, SessionError> {
        self.discover_with(
            std::env::var(ENV_SERVER).ok(),
            || self.lookup_session(),
            start_server,
        )
    }

    /// Server address: explicit override, then the session bus lookup
    /// service (starting the daemon once if nobody answers), then the
    /// system-wide socket.
    fn discover_with(
        &self,
        env: Option<String>,
        mut lookup: impl FnMut() -> Result<String, LookupError>,
        mut start: impl FnMut(),
    ) -> Result<String, SessionError> {
        if let Some(address) = env
            && !address.is_empty()
        {
            log::debug!("Using server address from {}: {}", ENV_SERVER, address);
            return Ok(address);
        }

        let mut result = lookup();
        if self.autostart
            && let Err(LookupError::ServiceUnknown(_)) = result
        {
            start();
            result = lookup();
        }
        let lookup_err = match result {
            Ok(address) => {
                log::debug!("Got server address from session bus: {}", address);
                return Ok(address);
            }
            Err(e) => e,
        };
        log::debug!(
            "Session bus lookup failed ({}), trying {}",
            lookup_err,
            self.system_socket.display()
        );

        if self.system_socket.exists() {
            return Ok(format!("unix:path={}", self.system_socket.display()));
        }
        Err(ConnectionError::LookupUnavailable(lookup_err.to_string()).into())
    }

    fn lookup_session(&self) -> Result<String, LookupError> {
        let bus = Connection::session().map_err(lookup_other)?;
        let reply = bus.call_method(
            Some(LOOKUP_NAME),
            LOOKUP_PATH,
            Some(PROPERTIES_IFACE),
            "Get",
            &(LOOKUP_IFACE, "Address"),
        )?;
        let value: OwnedValue = reply.body().deserialize()?;
        String::try_from(value).map_err(lookup_other)
    }

    fn open(&self) -> Result<DbusTransport, SessionError> {
        let address = self.discover()?;
        let conn = zbus::blocking::connection::Builder::address(address.as_str())
            .map_err(|e| ConnectionError::Refused(format!("{}: {}", address, e)))?
            .p2p()
            .method_timeout(self.call_timeout)
            .build()
            .map_err(|e| match classify(e) {
                SessionError::Protocol(msg) => ConnectionError::Refused(msg).into(),
                other => other,
            })?;
        log::info!("Connected to PulseAudio at {}", address);
        Ok(DbusTransport {
            conn,
            encoding: self.encoding,
            events: None,
            closing: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Connector for DbusConnector {
    /// Discovery and connect run on a helper thread so a hung socket can
    /// not stall the Session past `connect_timeout`.
    fn connect(&mut self) -> Result<Box<dyn Transport>, SessionError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let this = self.clone();
        std::thread::Builder::new()
            .name("mixtty-connect".into())
            .spawn(move || {
                let _ = tx.send(this.open());
            })
            .map_err(|e| ConnectionError::Refused(e.to_string()))?;

        match rx.recv_timeout(self.connect_timeout) {
            Ok(result) => result.map(|t| Box::new(t) as Box<dyn Transport>),
            Err(_) => Err(ConnectionError::Timeout.into()),
        }
    }
}

pub struct DbusTransport {
    conn: Connection,
    encoding: Encoding,
    events: Option<Receiver<ServerEvent>>,
    closing: Arc<AtomicBool>,
}

impl DbusTransport {
    fn get(&self, path: &str, iface: &str, property: &str) -> Result<OwnedValue, SessionError> {
        let reply = self
            .conn
            .call_method(
                None::<&str>,
                path,
                Some(PROPERTIES_IFACE),
                "Get",
                &(iface, property),
            )
            .map_err(classify)?;
        reply.body().deserialize::<OwnedValue>().map_err(classify)
    }

    fn set(&self, path: &str, iface: &str, property: &str, value: Value<'_>) -> Result<(), SessionError> {
        self.conn
            .call_method(
                None::<&str>,
                path,
                Some(PROPERTIES_IFACE),
                "Set",
                &(iface, property, value),
            )
            .map_err(classify)?;
        Ok(())
    }
}

impl Transport for DbusTransport {
    fn list(&mut self, kind: ObjectKind) -> Result<Vec<Handle>, SessionError> {
        let property = match kind {
            ObjectKind::Sink => "Sinks",
            ObjectKind::Stream => "PlaybackStreams",
        };
        let value = self.get(CORE_PATH, CORE_IFACE, property)?;
        let paths: Vec<ObjectPath<'static>> =
            Vec::try_from(value).map_err(|e| wrong_type(property, e))?;
        Ok(paths.iter().map(|p| Handle::from(p.as_str())).collect())
    }

    fn properties(&mut self, kind: ObjectKind, handle: &str) -> Result<Properties, SessionError> {
        let value = self.get(handle, interface(kind), "PropertyList")?;
        let raw: HashMap<String, Vec<u8>> =
            HashMap::try_from(value).map_err(|e| wrong_type("PropertyList", e))?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, self.encoding.decode(&v)))
            .collect())
    }

    fn volume(&mut self, kind: ObjectKind, handle: &str) -> Result<Vec<u32>, SessionError> {
        let value = self.get(handle, interface(kind), "Volume")?;
        Vec::try_from(value).map_err(|e| wrong_type("Volume", e))
    }

    fn muted(&mut self, kind: ObjectKind, handle: &str) -> Result<bool, SessionError> {
        let value = self.get(handle, interface(kind), "Mute")?;
        bool::try_from(value).map_err(|e| wrong_type("Mute", e))
    }

    fn set_volume(
        &mut self,
        kind: ObjectKind,
        handle: &str,
        levels: &[u32],
    ) -> Result<(), SessionError> {
        self.set(handle, interface(kind), "Volume", Value::from(levels.to_vec()))
    }

    fn set_mute(
        &mut self,
        kind: ObjectKind,
        handle: &str,
        muted: bool,
    ) -> Result<(), SessionError> {
        self.set(handle, interface(kind), "Mute", Value::from(muted))
    }

    fn listen(&mut self, wake: Arc<Waker>) -> Result<(), SessionError> {
        // Start reading before registering so nothing sent in between is lost
        let (tx, rx) = crossbeam_channel::unbounded();
        let messages = MessageIterator::from(self.conn.clone());
        let closing = self.closing.clone();
        std::thread::Builder::new()
            .name("mixtty-signals".into())
            .spawn(move || {
                for message in messages {
                    let message = match message {
                        Ok(m) => m,
                        Err(e) => {
                            if !closing.load(Ordering::Acquire) {
                                log::warn!("Signal stream failed: {}", e);
                            }
                            break;
                        }
                    };
                    let Some(event) = parse_signal(&message) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                    wake.wake();
                }
                // Dropping `tx` tells the Session the stream ended
                wake.wake();
            })
            .map_err(|e| ConnectionError::Refused(e.to_string()))?;
        self.events = Some(rx);

        for signal in SIGNALS {
            self.conn
                .call_method(
                    None::<&str>,
                    CORE_PATH,
                    Some(CORE_IFACE),
                    "ListenForSignal",
                    &(*signal, Vec::<ObjectPath<'static>>::new()),
                )
                .map_err(classify)?;
        }
        Ok(())
    }

    fn take_events(&mut self) -> Result<Vec<ServerEvent>, SessionError> {
        let Some(rx) = &self.events else {
            return Ok(Vec::new());
        };
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => return Ok(events),
                Err(TryRecvError::Disconnected) if events.is_empty() => {
                    return Err(ConnectionError::Refused("signal stream closed".into()).into());
                }
                // Report what we have; the closed stream shows up next time
                Err(TryRecvError::Disconnected) => return Ok(events),
            }
        }
    }

    fn close(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.events = None;
        if let Err(e) = self.conn.clone().close() {
            log::debug!("Error closing connection: {}", e);
        }
    }
}

fn parse_signal(message: &zbus::Message) -> Option<ServerEvent> {
    let header = message.header();
    if header.message_type() != zbus::message::Type::Signal {
        return None;
    }
    let argument = message
        .body()
        .deserialize::<ObjectPath<'_>>()
        .ok()
        .map(|path| Handle::from(path.as_str()));
    signal_event(header.member()?.as_str(), header.path()?.as_str(), argument)
}

/// `path` is the emitting object, `argument` the object path the signal
/// carries, if any.
fn signal_event(member: &str, path: &str, argument: Option<Handle>) -> Option<ServerEvent> {
    match member {
        "NewSink" => Some(ServerEvent::Added {
            kind: ObjectKind::Sink,
            handle: argument?,
        }),
        "NewPlaybackStream" => Some(ServerEvent::Added {
            kind: ObjectKind::Stream,
            handle: argument?,
        }),
        "SinkRemoved" | "PlaybackStreamRemoved" => Some(ServerEvent::Removed { handle: argument? }),
        "PropertyListUpdated" => Some(ServerEvent::PropertiesChanged {
            handle: Handle::from(path),
        }),
        _ => None,
    }
}
