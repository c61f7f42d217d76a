//! atomd - config-driven telemetry atom aggregation.
//!
//! Producers log typed, timestamped records ("atoms"). Consumers upload stats
//! configs that declare which atoms to match and which metrics to build from
//! them: events, counts, durations, gauges and values, optionally gated by
//! conditions and activations and sliced into dimensions. The engine keeps
//! every installed config's metrics up to date and serves bucketed reports
//! on demand.
//!
//! # Architecture
//!
//! - `matcher`: simple and combination atom matchers
//! - `engine`: stats config validation, per-config processors, predicates
//!   and activations
//! - `metrics`: the five metric producers, bucketing and dimension keys
//! - `puller`: pulled-atom callbacks, caching and the pull alarm schedule
//! - `subscriber`: anomaly alert broadcast to subscribers
//! - `receiver`: HTTP API with protobuf and JSON atom ingress
//! - `cli`: command-line interface
//!
//! # Example
//!
//! ```no_run
//! use atomd_lib::core::Config;
//! use atomd_lib::Application;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let app = Application::new(config)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod application;
pub mod cli;
pub mod core;
pub mod engine;
pub mod matcher;
pub mod metrics;
pub mod monitoring;
pub mod puller;
pub mod receiver;
pub mod report;
pub mod schema;
pub mod subscriber;
pub mod uid_map;

pub use application::Application;
pub use crate::core::{Config, Result};
