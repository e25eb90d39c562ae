mod backoff;
mod dbus;
#[cfg(test)]
mod fake;
mod manager;
mod transport;
mod types;

// Re-export public types
pub use dbus::DbusConnector;
pub use manager::{Session, SessionConfig, run};
pub use types::*;
