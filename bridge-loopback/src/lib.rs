//! # Loopback Bridge Implementations
//!
//! In-memory implementations of the sound bridge traits.
//!
//! ## Overview
//!
//! - `SoundServer` / `ServerConnection` using [`LoopbackServer`], a server
//!   that keeps its sample cache and streams in memory and answers every
//!   request with the same event sequence a real server would
//! - `SoundLookup` using [`StaticSoundLookup`], a fixed table of event sounds
//! - `SoundFile` using [`MemorySoundFile`]
//!
//! The server exposes knobs to script failures (refused connections,
//! evicted or failed uploads, failing writes and kills, dropped
//! connections), knobs that hold drains, play completions and write requests
//! so a client can be caught mid-request, and accessors to observe what a
//! client did.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_loopback::{LoopbackServer, StaticSoundLookup};
//! use std::sync::Arc;
//!
//! let server = LoopbackServer::new();
//! let lookup = StaticSoundLookup::new().with_sound("bell", spec, pcm);
//!
//! let config = DriverConfig::builder()
//!     .server(Arc::new(server.clone()))
//!     .lookup(Arc::new(lookup))
//!     .build()?;
//! ```

mod server;
mod sound;

pub use server::{
    CachedSample, CompletedStream, LoopbackConnection, LoopbackServer, PlayedSample, WRITE_CHUNK,
};
pub use sound::{MemorySoundFile, StaticSoundLookup};
