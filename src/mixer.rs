mod label;
mod registry;
mod rules;
mod types;

// Re-export public types
pub use label::Naming;
pub use registry::{Applied, Registry};
pub use rules::{RuleEngine, RuleSpec};
pub use types::*;
