//! # Core Runtime Module
//!
//! Provides the runtime infrastructure around the playback driver:
//! - Logging and tracing infrastructure
//! - Driver configuration with fail-fast capability checks
//! - Driver event bus
//!
//! ## Overview
//!
//! Nothing in this crate talks to a sound server. It establishes the logging
//! conventions, configuration shape and event broadcasting used by
//! `core-playback`.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{DriverConfig, DriverConfigBuilder, DriverSettings};
pub use error::{Error, Result};
pub use events::{DriverEvent, EventBus, RequestOutcome};
