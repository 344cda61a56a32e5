//! Workspace placeholder crate.
//!
//! This crate exists to expose shared feature flags that map to the individual
//! workspace crates (`core-playback`, `core-runtime`, `bridge-loopback`).
//! Host applications can depend on `chime-workspace` and enable the documented
//! features without needing to wire each crate individually.

#[cfg(feature = "driver")]
pub use core_playback as playback;

#[cfg(feature = "driver")]
pub use core_runtime as runtime;

#[cfg(feature = "loopback")]
pub use bridge_loopback as loopback;
