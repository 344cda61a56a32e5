//! # Host Bridge Traits
//!
//! Contracts between the playback driver and the pieces it does not own.
//!
//! ## Overview
//!
//! The driver talks to a sound server, resolves event names to sound files and
//! forwards its logs to the host. Each of those is a trait here so the driver
//! can run against a real server adapter or the in-memory loopback used by the
//! tests.
//!
//! ## Traits
//!
//! ### Sound Server
//! - [`SoundServer`](server::SoundServer) - Factory for server connections
//! - [`ServerConnection`](server::ServerConnection) - Asynchronous server calls
//! - [`ServerEventSink`](server::ServerEventSink) - Receives server notifications
//!
//! ### Sound Files
//! - [`SoundLookup`](sound::SoundLookup) - Resolve an event name to a sound file
//! - [`SoundFile`](sound::SoundFile) - PCM metadata and data access
//!
//! ### Utilities
//! - [`PropList`](props::PropList) - Caller-side property container
//! - [`LoggerSink`](logging::LoggerSink) - Forward structured logs to the host
//!
//! ## Fail-Fast Strategy
//!
//! The driver fails fast with a descriptive error when a required capability
//! is missing:
//!
//! ```ignore
//! use core_runtime::Error;
//!
//! let server = self.server
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "SoundServer".to_string(),
//!         message: "No sound server adapter provided".to_string(),
//!     })?;
//! ```
//!
//! ## Thread Safety
//!
//! Factories and lookups are shared between threads and require
//! `Send + Sync`. A [`ServerConnection`](server::ServerConnection) is owned by
//! exactly one driver and only needs `Send`.

pub mod error;
pub mod logging;
pub mod props;
pub mod server;
pub mod sound;

pub use error::BridgeError;

// Re-export commonly used types
pub use logging::{ConsoleLogger, LogEntry, LogLevel, LoggerSink};
pub use props::{keys, CacheControl, PropEntry, PropList};
pub use server::{
    ContextState, OperationId, OperationOutcome, SampleFormat, SampleSpec, ServerConnection,
    ServerErrorCode, ServerEvent, ServerEventSink, ServerPropList, ServerResult, SinkInputId,
    SoundServer, StreamId, StreamState, Volume,
};
pub use sound::{SoundFile, SoundLookup, ThemeCache};
