//! Shared foundation for the tablift workspace.
//!
//! Holds the error taxonomy, logging bootstrap, runtime configuration
//! bundle, and the domain types (statuses, phases, result shapes) that the
//! ingest and migrate crates exchange.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::ImportConfig;
pub use error::{Result, TabliftError};
