//! In-memory sound files and event lookup

use bridge_traits::{
    error::{BridgeError, Result},
    keys,
    props::PropList,
    server::{SampleFormat, SampleSpec},
    sound::{SoundFile, SoundLookup, ThemeCache},
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

const DEFAULT_THEME: &str = "freedesktop";

/// PCM data held in memory.
#[derive(Debug, Clone)]
pub struct MemorySoundFile {
    spec: SampleSpec,
    data: Bytes,
    position: usize,
}

impl MemorySoundFile {
    pub fn new(spec: SampleSpec, data: Bytes) -> Self {
        Self {
            spec,
            data,
            position: 0,
        }
    }

    /// `frames` frames of silence in the given format.
    pub fn silence(spec: SampleSpec, frames: usize) -> Self {
        let fill = match spec.format {
            SampleFormat::U8 => 0x80,
            SampleFormat::S16Ne | SampleFormat::S16Re => 0,
        };
        let data = vec![fill; frames * spec.frame_size()];
        Self::new(spec, Bytes::from(data))
    }
}

impl SoundFile for MemorySoundFile {
    fn sample_format(&self) -> SampleFormat {
        self.spec.format
    }

    fn channels(&self) -> u8 {
        self.spec.channels
    }

    fn rate(&self) -> u32 {
        self.spec.rate
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_arbitrary(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Event lookup backed by a fixed table.
///
/// The theme cache is populated on first use with the theme named by
/// `chime.xdg-theme.name` (request properties first, then context
/// properties) and records every event it resolves.
#[derive(Default)]
pub struct StaticSoundLookup {
    sounds: Mutex<HashMap<String, (SampleSpec, Bytes)>>,
    lookups: AtomicUsize,
}

impl StaticSoundLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sound(self, event_id: impl Into<String>, spec: SampleSpec, data: Bytes) -> Self {
        self.insert(event_id, spec, data);
        self
    }

    pub fn insert(&self, event_id: impl Into<String>, spec: SampleSpec, data: Bytes) {
        self.sounds.lock().insert(event_id.into(), (spec, data));
    }

    /// Number of lookups performed so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl SoundLookup for StaticSoundLookup {
    fn lookup(
        &self,
        event_id: &str,
        context_props: &PropList,
        request_props: &PropList,
        theme: &mut Option<ThemeCache>,
    ) -> Result<Box<dyn SoundFile>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let cache = theme.get_or_insert_with(|| {
            let name = request_props
                .gets(keys::THEME_NAME)
                .or_else(|| context_props.gets(keys::THEME_NAME))
                .unwrap_or_else(|| DEFAULT_THEME.to_string());
            debug!(theme = %name, "Loaded sound theme");
            ThemeCache::new(name)
        });

        let (spec, data) = self
            .sounds
            .lock()
            .get(event_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("no sound for event '{}'", event_id)))?;

        let source = format!("{}/{}", cache.theme(), event_id);
        cache.remember(event_id, source);
        Ok(Box::new(MemorySoundFile::new(spec, data)))
    }
}
