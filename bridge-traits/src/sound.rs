//! Sound file and sound lookup bridge traits.
//!
//! Decoding and theme resolution live outside the driver. The driver only
//! needs the format metadata of a resolved file and a way to pull raw PCM
//! bytes out of it on demand.

use crate::error::Result;
use crate::props::PropList;
use crate::server::{SampleFormat, SampleSpec};
use std::collections::HashMap;

/// An opened, decoded sound file.
pub trait SoundFile: Send {
    fn sample_format(&self) -> SampleFormat;

    fn channels(&self) -> u8;

    fn rate(&self) -> u32;

    /// Total size of the PCM data in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes of PCM data. `Ok(0)` means end of file.
    fn read_arbitrary(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Stream format with every field taken from the file.
    fn sample_spec(&self) -> SampleSpec {
        SampleSpec::new(self.sample_format(), self.channels(), self.rate())
    }
}

/// Lookup state a [`SoundLookup`] may cache between calls.
///
/// The driver owns one per context, hands it to every lookup and drops it
/// when the context is closed.
#[derive(Debug, Clone, Default)]
pub struct ThemeCache {
    theme: String,
    resolved: HashMap<String, String>,
}

impl ThemeCache {
    pub fn new(theme: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            resolved: HashMap::new(),
        }
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    /// Remember that `event_id` resolved to `source`.
    pub fn remember(&mut self, event_id: impl Into<String>, source: impl Into<String>) {
        self.resolved.insert(event_id.into(), source.into());
    }

    pub fn resolved(&self, event_id: &str) -> Option<&str> {
        self.resolved.get(event_id).map(String::as_str)
    }
}

/// Resolves an event name to a sound file.
pub trait SoundLookup: Send + Sync {
    /// Resolve `event_id` using the context-wide and per-request properties.
    ///
    /// `theme` starts out `None` and may be populated lazily.
    fn lookup(
        &self,
        event_id: &str,
        context_props: &PropList,
        request_props: &PropList,
        theme: &mut Option<ThemeCache>,
    ) -> Result<Box<dyn SoundFile>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub File {}

        impl SoundFile for File {
            fn sample_format(&self) -> SampleFormat;
            fn channels(&self) -> u8;
            fn rate(&self) -> u32;
            fn size(&self) -> u64;
            fn read_arbitrary(&mut self, buf: &mut [u8]) -> Result<usize>;
        }
    }

    #[test]
    fn test_sample_spec_takes_every_field_from_file() {
        let mut file = MockFile::new();
        file.expect_sample_format().return_const(SampleFormat::U8);
        file.expect_channels().return_const(2u8);
        file.expect_rate().return_const(22_050u32);

        let spec = file.sample_spec();
        assert_eq!(spec.format, SampleFormat::U8);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.rate, 22_050);
    }

    #[test]
    fn test_theme_cache_remembers() {
        let mut cache = ThemeCache::new("freedesktop");
        assert_eq!(cache.theme(), "freedesktop");
        assert_eq!(cache.resolved("bell"), None);

        cache.remember("bell", "freedesktop/stereo/bell.oga");
        assert_eq!(cache.resolved("bell"), Some("freedesktop/stereo/bell.oga"));
    }
}
