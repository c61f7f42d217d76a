use thiserror::Error;

use crate::core::types::ConfigKey;

/// Structural problems in an uploaded stats config.
///
/// These are always detected at upload time; a config that fails validation
/// never replaces the one already installed under the same key.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("duplicate matcher id {0}")]
    DuplicateMatcherId(i64),

    #[error("duplicate metric id {0}")]
    DuplicateMetricId(i64),

    #[error("duplicate predicate id {0}")]
    DuplicatePredicateId(i64),

    #[error("duplicate alert id {0}")]
    DuplicateAlertId(i64),

    #[error("{owner} references unknown {kind} id {target}")]
    DanglingReference {
        owner: String,
        kind: &'static str,
        target: i64,
    },

    #[error("matcher {matcher_id} references unknown atom id {atom_id}")]
    UnknownAtomId { matcher_id: i64, atom_id: i32 },

    #[error("matcher {matcher_id}: atom {atom_id} has no field at position {position}")]
    FieldOutOfRange {
        matcher_id: i64,
        atom_id: i32,
        position: u32,
    },

    #[error(
        "matcher {matcher_id}: field {position} is declared {declared} but constraint compares {found}"
    )]
    FieldTypeMismatch {
        matcher_id: i64,
        position: u32,
        declared: &'static str,
        found: &'static str,
    },

    #[error("matcher {matcher_id}: atom {atom_id} carries no attribution chain")]
    NoAttributionChain { matcher_id: i64, atom_id: i32 },

    #[error("combination matcher {0} is part of a cycle")]
    MatcherCycle(i64),

    #[error("combination matcher {0} has an invalid number of children for its operation")]
    InvalidCombination(i64),

    #[error("metric {metric_id}: {reason}")]
    InvalidMetric { metric_id: i64, reason: String },

    #[error("alert {alert_id}: {reason}")]
    InvalidAlert { alert_id: i64, reason: String },
}

#[derive(Error, Debug)]
pub enum AtomdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid stats config: {0}")]
    InvalidStatsConfig(#[from] ConfigError),

    #[error("Config not found: {0}")]
    ConfigNotFound(ConfigKey),

    #[error("Too many configs: limit is {limit}")]
    TooManyConfigs { limit: usize },

    #[error("Malformed atom: {0}")]
    MalformedAtom(String),

    #[error("No puller registered for atom {0}")]
    NoPuller(i32),

    #[error("Pull of atom {atom_id} failed: {reason}")]
    PullFailed { atom_id: i32, reason: String },

    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Channel send error")]
    ChannelSend,
}

/// Result type alias for atomd operations
pub type Result<T> = std::result::Result<T, AtomdError>;

impl AtomdError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new malformed-atom error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedAtom(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Creates a new parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Creates a new pull failure
    pub fn pull_failed<S: Into<String>>(atom_id: i32, reason: S) -> Self {
        Self::PullFailed {
            atom_id,
            reason: reason.into(),
        }
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Timeout { .. } => true,
            Self::PullFailed { .. } => true,
            Self::ChannelSend => true,
            _ => false,
        }
    }

    /// Returns the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::InvalidStatsConfig(_) | Self::TooManyConfigs { .. } => "config",
            Self::ConfigNotFound(_) => "not_found",
            Self::MalformedAtom(_) | Self::Decode(_) => "ingress",
            Self::NoPuller(_) | Self::PullFailed { .. } => "pull",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Serialization(_) | Self::Parse { .. } => "serialization",
            Self::Network(_) => "network",
            Self::Join(_) => "async",
            Self::ChannelSend => "channel",
        }
    }
}
