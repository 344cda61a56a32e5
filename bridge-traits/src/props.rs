//! Caller-side property container.
//!
//! [`PropList`] is the ordered key/value store that callers attach to a
//! context or a single play request. It carries its own lock so it can be
//! shared between the thread that fills it and the driver that reads it;
//! readers that need a consistent view of every entry go through
//! [`PropList::with_locked`].

use crate::error::{BridgeError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;

/// Well-known property keys.
pub mod keys {
    /// Name of the event sound to play (e.g. `"bell"`).
    pub const EVENT_ID: &str = "event.id";
    /// Human-readable description of the event.
    pub const EVENT_DESCRIPTION: &str = "event.description";
    /// Name of the media being played.
    pub const MEDIA_NAME: &str = "media.name";
    /// Application name reported to the sound server.
    pub const APPLICATION_NAME: &str = "application.name";

    /// Keys under this prefix are private to the driver and never sent to the server.
    pub const INTERNAL_PREFIX: &str = "chime.";
    /// Playback volume in decibels, as a decimal string.
    pub const VOLUME: &str = "chime.volume";
    /// Cache policy for the named sample (`never`, `permanent` or `volatile`).
    pub const CACHE_CONTROL: &str = "chime.cache-control";
    /// Sound theme to resolve the event against.
    pub const THEME_NAME: &str = "chime.xdg-theme.name";
}

/// Policy governing whether a missing named sample may be uploaded to the
/// server's cache and the play retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheControl {
    /// Never upload; play by streaming directly.
    #[default]
    Never,
    /// Upload and keep the sample for the lifetime of the server.
    Permanent,
    /// Upload; the server may evict the sample at will.
    Volatile,
}

impl CacheControl {
    /// Returns `true` if this policy allows an upload-and-retry cycle.
    pub fn allows_upload(self) -> bool {
        !matches!(self, CacheControl::Never)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheControl::Never => "never",
            CacheControl::Permanent => "permanent",
            CacheControl::Volatile => "volatile",
        }
    }
}

impl FromStr for CacheControl {
    type Err = BridgeError;

    /// Strict parse: exactly one of the three lowercase keywords.
    fn from_str(value: &str) -> Result<Self> {
        match value {
            "never" => Ok(CacheControl::Never),
            "permanent" => Ok(CacheControl::Permanent),
            "volatile" => Ok(CacheControl::Volatile),
            other => Err(BridgeError::InvalidArgument(format!(
                "unknown cache control '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key/value pair of a [`PropList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropEntry {
    key: String,
    value: Vec<u8>,
}

impl PropEntry {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Ordered, internally locked property container.
#[derive(Default)]
pub struct PropList {
    entries: Mutex<Vec<PropEntry>>,
}

impl PropList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a raw byte value, replacing any previous value in place.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.iter_mut().find(|entry| entry.key == key) {
            entry.value = value;
        } else {
            entries.push(PropEntry { key, value });
        }
    }

    /// Set a string value.
    pub fn sets(&self, key: impl Into<String>, value: &str) {
        self.set(key, value.as_bytes().to_vec());
    }

    /// Builder-style variant of [`PropList::sets`].
    pub fn with(self, key: impl Into<String>, value: &str) -> Self {
        self.sets(key, value);
        self
    }

    /// Returns the value of `key` as a string, if present and valid UTF-8.
    pub fn gets(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| String::from_utf8(entry.value.clone()).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().iter().any(|entry| entry.key == key)
    }

    pub fn unset(&self, key: &str) {
        self.entries.lock().retain(|entry| entry.key != key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run `f` over every entry while holding the container lock.
    ///
    /// The lock is released as soon as `f` returns; callers must not perform
    /// blocking work inside the closure.
    pub fn with_locked<R>(&self, f: impl FnOnce(&[PropEntry]) -> R) -> R {
        let entries = self.entries.lock();
        f(&entries)
    }
}

impl Clone for PropList {
    fn clone(&self) -> Self {
        Self {
            entries: Mutex::new(self.entries.lock().clone()),
        }
    }
}

impl fmt::Debug for PropList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_map()
            .entries(
                entries
                    .iter()
                    .map(|entry| (&entry.key, String::from_utf8_lossy(&entry.value))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_in_place() {
        let props = PropList::new();
        props.sets("a", "1");
        props.sets("b", "2");
        props.sets("a", "3");

        let keys: Vec<String> =
            props.with_locked(|entries| entries.iter().map(|e| e.key().to_string()).collect());
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(props.gets("a"), Some("3".to_string()));
    }

    #[test]
    fn test_gets_rejects_non_utf8() {
        let props = PropList::new();
        props.set("blob", vec![0xff, 0xfe]);
        assert!(props.contains("blob"));
        assert_eq!(props.gets("blob"), None);
    }

    #[test]
    fn test_cache_control_strict_parse() {
        assert_eq!("never".parse::<CacheControl>().unwrap(), CacheControl::Never);
        assert_eq!(
            "permanent".parse::<CacheControl>().unwrap(),
            CacheControl::Permanent
        );
        assert_eq!(
            "volatile".parse::<CacheControl>().unwrap(),
            CacheControl::Volatile
        );
        assert!("Volatile".parse::<CacheControl>().is_err());
        assert!(" never".parse::<CacheControl>().is_err());
        assert!("".parse::<CacheControl>().is_err());
    }

    #[test]
    fn test_cache_control_allows_upload() {
        assert!(!CacheControl::Never.allows_upload());
        assert!(CacheControl::Permanent.allows_upload());
        assert!(CacheControl::Volatile.allows_upload());
    }
}
