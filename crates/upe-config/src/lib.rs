//! CLI argument parsing and rule-file loading for the userspace packet
//! engine. Every error here is startup-only, per `spec.md` §7's
//! Configuration error class.

pub mod cli;
pub mod error;
pub mod rule_file;

pub use cli::Args;
pub use error::ConfigError;
pub use rule_file::{load as load_rules, ParsedAction, ParsedRule};
