//! # Event Sound Playback Driver
//!
//! Plays named event sounds ("bell", "message-new-instant", ...) through a
//! sound server, tracks each request until the server reports it finished
//! and lets callers cancel requests by id.
//!
//! ## Overview
//!
//! - [`Driver::open`] connects and starts a dedicated event-loop thread
//! - [`Driver::play`] first asks the server to play a cached sample. When the
//!   sample is missing and the request's cache policy allows it, the sound is
//!   uploaded with [`Driver::cache`] and the play retried. Otherwise the
//!   sound file is streamed directly.
//! - [`Driver::play_with_callback`] and [`Driver::play_tracked`] report the
//!   final result exactly once
//! - [`Driver::cancel`] kills every tracked request with a given id
//!
//! ## Example
//!
//! ```ignore
//! use bridge_traits::{keys, PropList};
//! use core_playback::Driver;
//! use core_runtime::config::DriverConfig;
//!
//! let driver = Driver::open(config)?;
//! let props = PropList::new()
//!     .with(keys::EVENT_ID, "bell")
//!     .with(keys::CACHE_CONTROL, "volatile");
//!
//! driver.play_with_callback(1, &props, |id, result| {
//!     println!("request {id} finished: {result:?}");
//! })?;
//! ```
//!
//! ## Threading
//!
//! Completions run on the event-loop thread, except those of requests that
//! are still outstanding when the driver closes: they receive
//! [`DriverError::Destroyed`] on the closing thread.

mod connection;
mod driver;
pub mod error;
mod feeder;
mod handle;
mod orchestrator;
pub mod proplist;
pub mod registry;

pub use connection::EVENT_LOOP_THREAD;
pub use driver::Driver;
pub use error::{translate, DriverError, Result};
pub use handle::PlaybackHandle;
pub use proplist::RequestProps;
pub use registry::{FinishCallback, RequestId};
