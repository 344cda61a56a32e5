//! # Outstanding Request Registry
//!
//! Every request that may still receive server notifications after `play`
//! returns lives here until it reaches its final result. An entry is linked
//! when the request succeeded and either streams its own data or carries a
//! completion. Detached named-sample plays are never linked.
//!
//! The registry is guarded by its own mutex which is only ever taken while
//! the coordination lock is held (see [`crate::connection`]), and never
//! across a server call.

use crate::error::Result;
use bridge_traits::{SinkInputId, SoundFile, StreamId};
use core_runtime::events::{DriverEvent, EventBus, RequestOutcome};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Caller-chosen identifier grouping requests for cancellation.
pub type RequestId = u32;

/// Callback invoked exactly once with a request's final result.
pub type FinishCallback = Box<dyn FnOnce(RequestId, Result<()>) + Send + 'static>;

/// Where a request's final result goes.
pub enum Completion {
    /// Nobody is waiting.
    Detached,
    Callback(FinishCallback),
    /// Backs a [`PlaybackHandle`](crate::PlaybackHandle).
    Channel(oneshot::Sender<Result<()>>),
}

impl Completion {
    /// Returns `true` if a final result has somewhere to go.
    pub fn is_attached(&self) -> bool {
        !matches!(self, Completion::Detached)
    }

    pub(crate) fn fire(self, id: RequestId, result: Result<()>) {
        match self {
            Completion::Detached => {}
            Completion::Callback(callback) => callback(id, result),
            Completion::Channel(sender) => {
                if sender.send(result).is_err() {
                    debug!(id, "Playback handle dropped before completion");
                }
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Completion::Detached => "Detached",
            Completion::Callback(_) => "Callback",
            Completion::Channel(_) => "Channel",
        };
        f.write_str(kind)
    }
}

/// A sound file being fed into a server stream.
pub struct StreamFeed {
    pub stream: StreamId,
    pub file: Box<dyn SoundFile>,
    /// Bytes still owed to the server, for uploads of known length.
    pub remaining: Option<u64>,
    /// Set once the end of data was reached and drain or finish was issued.
    pub finishing: bool,
}

impl StreamFeed {
    pub fn playback(stream: StreamId, file: Box<dyn SoundFile>) -> Self {
        Self {
            stream,
            file,
            remaining: None,
            finishing: false,
        }
    }

    pub fn upload(stream: StreamId, file: Box<dyn SoundFile>) -> Self {
        let remaining = Some(file.size());
        Self {
            stream,
            file,
            remaining,
            finishing: false,
        }
    }
}

impl fmt::Debug for StreamFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFeed")
            .field("stream", &self.stream)
            .field("remaining", &self.remaining)
            .field("finishing", &self.finishing)
            .finish()
    }
}

#[derive(Debug)]
pub enum Source {
    /// Played from the server's sample cache.
    Sample,
    /// Streamed by this client.
    Stream(StreamFeed),
}

/// One live request.
#[derive(Debug)]
pub struct Outstanding {
    pub id: RequestId,
    /// Set once the server reported where the request is playing.
    pub sink_input: Option<SinkInputId>,
    pub completion: Completion,
    pub source: Source,
}

impl Outstanding {
    pub fn sample(id: RequestId, sink_input: SinkInputId, completion: Completion) -> Self {
        Self {
            id,
            sink_input: Some(sink_input),
            completion,
            source: Source::Sample,
        }
    }

    pub fn stream(&self) -> Option<StreamId> {
        match &self.source {
            Source::Stream(feed) => Some(feed.stream),
            Source::Sample => None,
        }
    }

    pub fn is_sample(&self) -> bool {
        matches!(self.source, Source::Sample)
    }

    /// Release the request's resources and pair its completion with a result.
    pub fn finish(self, result: Result<()>) -> Finished {
        Finished {
            id: self.id,
            completion: self.completion,
            result,
        }
    }
}

/// A final result waiting to be delivered outside every lock.
#[must_use = "a finished request must be delivered"]
pub struct Finished {
    id: RequestId,
    completion: Completion,
    result: Result<()>,
}

impl Finished {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn result(&self) -> Result<()> {
        self.result
    }

    /// Report on the bus, then fire the completion.
    pub fn deliver(self, events: Option<&EventBus>) {
        match self.result {
            Ok(()) => debug!(id = self.id, "Request finished"),
            Err(error) => debug!(id = self.id, %error, "Request failed"),
        }

        if let Some(bus) = events {
            let outcome = match self.result {
                Ok(()) => RequestOutcome::Success,
                Err(error) => RequestOutcome::Failed(error.to_string()),
            };
            bus.emit(DriverEvent::RequestFinished {
                id: self.id,
                outcome,
            });
        }

        self.completion.fire(self.id, self.result);
    }
}

impl fmt::Debug for Finished {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finished")
            .field("id", &self.id)
            .field("result", &self.result)
            .finish()
    }
}

/// Deliver a batch in order.
pub fn deliver_all(finished: Vec<Finished>, events: Option<&EventBus>) {
    for item in finished {
        item.deliver(events);
    }
}

/// Opaque position of a linked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey(u64);

/// Linked requests in link order.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<EntryKey, Outstanding>,
    next_key: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, request: Outstanding) -> EntryKey {
        let key = EntryKey(self.next_key);
        self.next_key += 1;
        self.entries.insert(key, request);
        key
    }

    /// Put a request back under the key it was unlinked from.
    pub fn relink(&mut self, key: EntryKey, request: Outstanding) {
        if self.entries.insert(key, request).is_some() {
            warn!(?key, "Relinked over a live registry entry");
        }
    }

    pub fn unlink(&mut self, key: EntryKey) -> Option<Outstanding> {
        self.entries.remove(&key)
    }

    /// Unlink every request matching `predicate`, in link order.
    pub fn unlink_where(&mut self, mut predicate: impl FnMut(&Outstanding) -> bool) -> Vec<Outstanding> {
        let keys: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|(_, request)| predicate(request))
            .map(|(key, _)| *key)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    /// Unlink everything.
    pub fn drain(&mut self) -> Vec<Outstanding> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn find_stream(&self, stream: StreamId) -> Option<EntryKey> {
        self.entries
            .iter()
            .find(|(_, request)| request.stream() == Some(stream))
            .map(|(key, _)| *key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<(RequestId, Result<()>)>>>;

    fn recording(log: &Log) -> Completion {
        let log = Arc::clone(log);
        Completion::Callback(Box::new(move |id, result| {
            log.lock().unwrap().push((id, result));
        }))
    }

    #[test]
    fn test_link_and_unlink_where_preserves_order() {
        let mut registry = Registry::new();
        registry.link(Outstanding::sample(1, SinkInputId(10), Completion::Detached));
        registry.link(Outstanding::sample(2, SinkInputId(11), Completion::Detached));
        registry.link(Outstanding::sample(1, SinkInputId(12), Completion::Detached));

        let removed = registry.unlink_where(|r| r.id == 1);
        let sinks: Vec<_> = removed.iter().map(|r| r.sink_input).collect();
        assert_eq!(sinks, vec![Some(SinkInputId(10)), Some(SinkInputId(12))]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unlink_and_relink_keeps_key() {
        let mut registry = Registry::new();
        let first = registry.link(Outstanding::sample(1, SinkInputId(1), Completion::Detached));
        registry.link(Outstanding::sample(2, SinkInputId(2), Completion::Detached));

        let request = registry.unlink(first).unwrap();
        assert_eq!(registry.len(), 1);
        registry.relink(first, request);

        let order: Vec<_> = registry.drain().into_iter().map(|r| r.id).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_finished_fires_completion_once() {
        let log: Log = Arc::default();
        let request = Outstanding::sample(7, SinkInputId(0), recording(&log));

        let finished = request.finish(Err(DriverError::Canceled));
        assert_eq!(finished.id(), 7);
        finished.deliver(None);

        assert_eq!(*log.lock().unwrap(), vec![(7, Err(DriverError::Canceled))]);
    }

    #[test]
    fn test_channel_completion() {
        let (tx, mut rx) = oneshot::channel();
        let request = Outstanding::sample(3, SinkInputId(0), Completion::Channel(tx));
        assert!(request.completion.is_attached());

        request.finish(Ok(())).deliver(None);
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_deliver_reports_on_bus() {
        let bus = EventBus::new(4);
        let mut events = bus.subscribe();

        Outstanding::sample(9, SinkInputId(0), Completion::Detached)
            .finish(Err(DriverError::Destroyed))
            .deliver(Some(&bus));

        assert_eq!(
            events.try_recv().unwrap(),
            DriverEvent::RequestFinished {
                id: 9,
                outcome: RequestOutcome::Failed("Destroyed".to_string()),
            }
        );
    }
}
