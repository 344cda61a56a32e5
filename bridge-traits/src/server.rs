//! Sound server bridge traits.
//!
//! The sound server is purely event driven: every call on a
//! [`ServerConnection`] returns immediately and the outcome (connection state
//! changes, operation results, stream write requests, drain confirmations)
//! arrives later as a [`ServerEvent`] posted to the [`ServerEventSink`] the
//! connection was created with.
//!
//! ## Threading
//!
//! The driver calls every `ServerConnection` method while holding its
//! coordination lock, and consumes events on a single event-loop thread.
//! Implementations may post events from inside a method call; posting must
//! never block.
//!
//! ## Stream protocol
//!
//! ```text
//! create_stream ──> connect_playback / connect_upload
//!                        │
//!        StreamState(Creating) ─> StreamState(Ready)
//!                                      │
//!                  StreamWriteRequest ─┴─> write ... (repeat)
//!                                      │
//!          playback: drain ─> StreamDrained
//!          upload:   finish_upload ─> StreamState(Terminated)
//! ```
//!
//! Write requests are only issued for streams that already reported
//! [`StreamState::Ready`].

use crate::error::{BridgeError, Result};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Raw error code reported by the sound server.
///
/// The defined range is `OK..MAX`; values outside of it are still
/// representable because a newer server may report codes this crate does not
/// know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerErrorCode(pub u32);

impl ServerErrorCode {
    pub const OK: Self = Self(0);
    pub const ACCESS: Self = Self(1);
    pub const COMMAND: Self = Self(2);
    pub const INVALID: Self = Self(3);
    pub const EXIST: Self = Self(4);
    pub const NO_ENTITY: Self = Self(5);
    pub const CONNECTION_REFUSED: Self = Self(6);
    pub const PROTOCOL: Self = Self(7);
    pub const TIMEOUT: Self = Self(8);
    pub const AUTH_KEY: Self = Self(9);
    pub const INTERNAL: Self = Self(10);
    pub const CONNECTION_TERMINATED: Self = Self(11);
    pub const KILLED: Self = Self(12);
    pub const INVALID_SERVER: Self = Self(13);
    pub const MODULE_INIT_FAILED: Self = Self(14);
    pub const BAD_STATE: Self = Self(15);
    pub const NO_DATA: Self = Self(16);
    pub const VERSION: Self = Self(17);
    pub const TOO_LARGE: Self = Self(18);
    /// One past the last defined code.
    pub const MAX: Self = Self(19);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    fn name(self) -> Option<&'static str> {
        const NAMES: [&str; 19] = [
            "ok",
            "access denied",
            "unknown command",
            "invalid argument",
            "entity exists",
            "no such entity",
            "connection refused",
            "protocol error",
            "timeout",
            "no authentication key",
            "internal error",
            "connection terminated",
            "entity killed",
            "invalid server",
            "module initialization failed",
            "bad state",
            "no data",
            "incompatible protocol version",
            "too large",
        ];
        NAMES.get(self.0 as usize).copied()
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "unknown server error ({})", self.0),
        }
    }
}

impl std::error::Error for ServerErrorCode {}

pub type ServerResult<T> = std::result::Result<T, ServerErrorCode>;

/// Connection lifecycle as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

impl ContextState {
    /// Failed and Terminated are final; the connection never recovers.
    pub fn is_final(self) -> bool {
        matches!(self, ContextState::Failed | ContextState::Terminated)
    }
}

/// Per-stream lifecycle as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn is_final(self) -> bool {
        matches!(self, StreamState::Failed | StreamState::Terminated)
    }
}

/// Server-side handle of one active playback (a "sink input").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkInputId(pub u32);

impl fmt::Display for SinkInputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection-local handle of a stream created with
/// [`ServerConnection::create_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Handle of an asynchronous server operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

/// PCM sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 16-bit, native endian.
    S16Ne,
    /// Signed 16-bit, reverse (non-native) endian.
    S16Re,
    /// Unsigned 8-bit.
    U8,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Ne | SampleFormat::S16Re => 2,
            SampleFormat::U8 => 1,
        }
    }
}

/// Stream format negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub channels: u8,
    pub rate: u32,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, channels: u8, rate: u32) -> Self {
        Self {
            format,
            channels,
            rate,
        }
    }

    /// Size in bytes of one frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    pub fn is_valid(&self) -> bool {
        self.channels > 0 && self.rate > 0
    }
}

/// Linear software volume factor (1.0 = unity gain).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Volume(f64);

impl Volume {
    pub const MUTED: Self = Self(0.0);
    pub const NORM: Self = Self(1.0);

    /// Convert a decibel value to a linear factor. `-inf` mutes.
    pub fn from_db(db: f64) -> Self {
        if db == f64::NEG_INFINITY {
            return Self::MUTED;
        }
        Self(10f64.powf(db / 20.0))
    }

    pub fn linear(self) -> f64 {
        self.0
    }

    pub fn to_db(self) -> f64 {
        if self.0 <= 0.0 {
            f64::NEG_INFINITY
        } else {
            20.0 * self.0.log10()
        }
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::NORM
    }
}

/// The server's own property-list representation.
///
/// Keys must be non-empty printable ASCII without `=`; values are opaque
/// bytes. String values are stored without terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerPropList {
    entries: BTreeMap<String, Vec<u8>>,
}

impl ServerPropList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_is_valid(key: &str) -> bool {
        !key.is_empty() && key.bytes().all(|b| (0x20..0x7f).contains(&b) && b != b'=')
    }

    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if !Self::key_is_valid(key) {
            return Err(BridgeError::InvalidArgument(format!(
                "invalid property key '{}'",
                key.escape_debug()
            )));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    pub fn sets(&mut self, key: &str, value: &str) -> Result<()> {
        self.set(key, value.as_bytes())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// String view of a value; `None` if absent or not UTF-8.
    pub fn gets(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn unset(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &[u8]) -> bool) {
        self.entries.retain(|key, value| keep(key, value));
    }

    /// Replace-merge: every key of `other` overwrites the same key here.
    pub fn update(&mut self, other: &ServerPropList) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of an asynchronous server operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The operation created a sink input (sample playback).
    SinkInput(SinkInputId),
    /// The operation completed without a payload.
    Success,
    /// The operation failed with the given code.
    Failed(ServerErrorCode),
}

/// Asynchronous notification from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The connection changed state.
    ContextState(ContextState),
    /// A sink input went away (only delivered after
    /// [`ServerConnection::subscribe_sink_inputs`]).
    SinkInputRemoved(SinkInputId),
    /// An operation returned by the connection finished.
    OperationComplete {
        operation: OperationId,
        outcome: OperationOutcome,
    },
    /// A stream changed state.
    StreamState { stream: StreamId, state: StreamState },
    /// The server wants up to `bytes` more bytes on `stream`.
    StreamWriteRequest { stream: StreamId, bytes: usize },
    /// A drain requested with [`ServerConnection::drain`] finished.
    StreamDrained { stream: StreamId, success: bool },
}

/// Receiver side of server notifications.
pub trait ServerEventSink: Send + Sync {
    /// Queue an event for the driver's event loop. Must not block.
    fn post(&self, event: ServerEvent);
}

/// One connection to the sound server.
pub trait ServerConnection: Send {
    /// Start connecting. Progress is reported through `ContextState` events.
    fn connect(&mut self, server: Option<&str>) -> ServerResult<()>;

    fn state(&self) -> ContextState;

    /// Error code of the last failure on this connection.
    fn last_error(&self) -> ServerErrorCode;

    /// Play a sample from the server's cache.
    fn play_sample(
        &mut self,
        name: &str,
        device: Option<&str>,
        volume: Volume,
        props: &ServerPropList,
    ) -> ServerResult<OperationId>;

    /// Ask for `SinkInputRemoved` notifications.
    fn subscribe_sink_inputs(&mut self) -> ServerResult<OperationId>;

    /// Replace-merge the client property list.
    fn update_proplist(&mut self, props: &ServerPropList) -> ServerResult<OperationId>;

    fn kill_sink_input(&mut self, index: SinkInputId) -> ServerResult<OperationId>;

    fn create_stream(
        &mut self,
        name: &str,
        spec: &SampleSpec,
        props: &ServerPropList,
    ) -> ServerResult<StreamId>;

    fn connect_playback(&mut self, stream: StreamId, device: Option<&str>) -> ServerResult<()>;

    /// Connect `stream` as an upload into the sample cache, `length` bytes long.
    fn connect_upload(&mut self, stream: StreamId, length: u64) -> ServerResult<()>;

    fn stream_state(&self, stream: StreamId) -> StreamState;

    /// Sink input backing a ready playback stream.
    fn stream_index(&self, stream: StreamId) -> Option<SinkInputId>;

    /// Hand `data` to the server. Ownership of the buffer moves to the server.
    fn write(&mut self, stream: StreamId, data: Bytes) -> ServerResult<()>;

    /// Commit an upload stream into the sample cache.
    fn finish_upload(&mut self, stream: StreamId) -> ServerResult<()>;

    /// Request a `StreamDrained` event once all written data has been played.
    fn drain(&mut self, stream: StreamId) -> ServerResult<()>;

    /// Tear down a stream. Harmless on streams that already ended.
    fn disconnect_stream(&mut self, stream: StreamId);

    fn disconnect(&mut self);
}

/// Factory for server connections.
pub trait SoundServer: Send + Sync {
    /// Driver name this server answers to.
    fn name(&self) -> &str;

    fn new_connection(
        &self,
        client_name: &str,
        props: ServerPropList,
        events: Arc<dyn ServerEventSink>,
    ) -> ServerResult<Box<dyn ServerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ServerErrorCode::NO_ENTITY.to_string(), "no such entity (5)");
        assert_eq!(
            ServerErrorCode(99).to_string(),
            "unknown server error (99)"
        );
    }

    #[test]
    fn test_proplist_key_validation() {
        let mut list = ServerPropList::new();
        assert!(list.sets("media.name", "bell").is_ok());
        assert!(list.sets("", "x").is_err());
        assert!(list.sets("a=b", "x").is_err());
        assert!(list.sets("tab\there", "x").is_err());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_proplist_gets_requires_utf8() {
        let mut list = ServerPropList::new();
        list.set("raw", &[0xc3, 0x28]).unwrap();
        assert!(list.get("raw").is_some());
        assert_eq!(list.gets("raw"), None);
    }

    #[test]
    fn test_proplist_update_replaces() {
        let mut base = ServerPropList::new();
        base.sets("a", "1").unwrap();
        base.sets("b", "2").unwrap();

        let mut other = ServerPropList::new();
        other.sets("b", "3").unwrap();
        base.update(&other);

        assert_eq!(base.gets("a"), Some("1"));
        assert_eq!(base.gets("b"), Some("3"));
    }

    #[test]
    fn test_volume_from_db() {
        assert!((Volume::from_db(0.0).linear() - 1.0).abs() < 1e-9);
        assert!((Volume::from_db(-20.0).linear() - 0.1).abs() < 1e-9);
        assert_eq!(Volume::from_db(f64::NEG_INFINITY), Volume::MUTED);
        assert!((Volume::from_db(-6.0).to_db() + 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_spec_frame_size() {
        let spec = SampleSpec::new(SampleFormat::S16Ne, 2, 44_100);
        assert_eq!(spec.frame_size(), 4);
        assert!(spec.is_valid());
        assert!(!SampleSpec::new(SampleFormat::U8, 0, 8_000).is_valid());
    }
}
