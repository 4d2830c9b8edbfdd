//! Configuration management for parwork
//!
//! Engine settings are merged from embedded defaults, user and repository
//! files, an optional custom file, `PARWORK_` environment variables and
//! command line flags, in that order.

pub mod core;

pub use core::{ConfigOverrides, EngineConfig};
