//! Core domain types for atomd.
//!
//! Atoms, config identities, the error type, the elapsed-time clock and the
//! service configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigBuilder, ConfigWatcher, EngineConfig};
pub use error::{AtomdError, ConfigError, Result};
pub use types::{Atom, AtomBuilder, AttributionNode, ConfigKey, FieldType, FieldValue};
