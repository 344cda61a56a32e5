//! # Play, Cache and Cancel
//!
//! The request paths a driver exposes. Each one runs on the caller's thread,
//! takes the coordination lock for its server calls and blocks on the
//! condvar until the event loop reports the outcome it needs.
//!
//! ## Play strategy
//!
//! ```text
//! play_sample ──ok──> playing from cache
//!     │
//!     └─ not found ─┬─ policy allows upload, attempts left ─> cache ─> retry
//!                   └─ otherwise ─> direct stream
//! ```

use crate::connection::{retire, OperationSlot, PendingSample};
use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::feeder::{FeedPurpose, FeedSlot, LocalFeed};
use crate::handle::PlaybackHandle;
use crate::proplist::{self, RequestProps};
use crate::registry::{Completion, RequestId, StreamFeed};
use bridge_traits::{CacheControl, OperationOutcome, PropList, ServerPropList, SoundFile};
use core_runtime::events::DriverEvent;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

/// Result of one play attempt from the server's cache.
enum CachedPlay {
    Playing,
    /// The sample is not cached; the completion comes back for the next try.
    Missing(Completion),
}

impl Driver {
    /// Play the sound for `props` and forget about it.
    pub fn play(&self, id: RequestId, props: &PropList) -> Result<()> {
        self.start(id, props, Completion::Detached)
    }

    /// Play and invoke `on_finish` exactly once, on the event-loop thread,
    /// when playback ends, fails or is canceled.
    ///
    /// The callback is not invoked when this returns an error. From inside a
    /// callback only [`Driver::cancel`] and the query methods may be used;
    /// `play` and `cache` return [`DriverError::State`] there.
    pub fn play_with_callback<F>(&self, id: RequestId, props: &PropList, on_finish: F) -> Result<()>
    where
        F: FnOnce(RequestId, Result<()>) + Send + 'static,
    {
        self.start(id, props, Completion::Callback(Box::new(on_finish)))
    }

    /// Play and return a handle resolving with the final result.
    pub fn play_tracked(&self, id: RequestId, props: &PropList) -> Result<PlaybackHandle> {
        let (tx, rx) = oneshot::channel();
        self.start(id, props, Completion::Channel(tx))?;
        Ok(PlaybackHandle::new(id, rx))
    }

    #[instrument(skip(self, props))]
    fn start(&self, id: RequestId, props: &PropList, completion: Completion) -> Result<()> {
        self.ensure_off_loop()?;
        let mut server_props = proplist::to_server_props(props)?;
        let request = RequestProps::parse(&server_props)?;
        proplist::strip_internal_keys(&mut server_props);

        if completion.is_attached() {
            self.subscribe()?;
        }

        let policy = request.policy();
        let mut completion = completion;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.play_cached(id, &request, &server_props, completion)? {
                CachedPlay::Playing => {
                    debug!(event_id = %request.event_id, attempts, "Playing cached sample");
                    self.shared.emit(DriverEvent::PlaybackStarted { id, direct: false });
                    return Ok(());
                }
                CachedPlay::Missing(returned) => completion = returned,
            }

            if !policy.allows_upload() || attempts >= self.settings.max_play_attempts {
                break;
            }
            self.cache(props)?;
        }

        debug!(event_id = %request.event_id, attempts, "Falling back to direct stream");
        self.play_direct(id, &request, props, &server_props, completion)
    }

    fn play_cached(
        &self,
        id: RequestId,
        request: &RequestProps,
        server_props: &ServerPropList,
        completion: Completion,
    ) -> Result<CachedPlay> {
        let mut guard = self.shared.lock();
        guard.ensure_ready()?;

        let device = guard.device.clone();
        let operation = guard
            .connection
            .play_sample(&request.event_id, device.as_deref(), request.volume, server_props)
            .map_err(DriverError::from_server)?;
        guard.operations.insert(
            operation,
            OperationSlot {
                outcome: None,
                pending: Some(PendingSample { id, completion }),
            },
        );

        let slot = guard.wait_operation(operation)?;
        match slot.outcome {
            Some(OperationOutcome::SinkInput(_)) => Ok(CachedPlay::Playing),
            Some(OperationOutcome::Success) | None => {
                // Without a sink input the request can never be finished.
                warn!(id, event_id = %request.event_id, "Sample played without a sink input");
                Err(DriverError::Io)
            }
            Some(OperationOutcome::Failed(code)) => {
                let error = DriverError::from_server(code);
                if !error.is_retryable_with_cache() {
                    return Err(error);
                }
                let completion = slot
                    .pending
                    .map_or(Completion::Detached, |pending| pending.completion);
                Ok(CachedPlay::Missing(completion))
            }
        }
    }

    fn play_direct(
        &self,
        id: RequestId,
        request: &RequestProps,
        props: &PropList,
        server_props: &ServerPropList,
        completion: Completion,
    ) -> Result<()> {
        let file = self.lookup_sound(&request.event_id, props)?;
        let spec = file.sample_spec();

        let mut guard = self.shared.lock();
        guard.ensure_ready()?;

        let stream = guard
            .connection
            .create_stream(&request.event_id, &spec, server_props)
            .map_err(DriverError::from_server)?;
        guard.feeds.insert(
            stream,
            FeedSlot::Pending(LocalFeed {
                feed: StreamFeed::playback(stream, file),
                purpose: FeedPurpose::Playback { id, completion },
            }),
        );

        let device = guard.device.clone();
        if let Err(code) = guard.connection.connect_playback(stream, device.as_deref()) {
            guard.feeds.remove(&stream);
            guard.connection.disconnect_stream(stream);
            return Err(DriverError::from_server(code));
        }

        match guard.wait_feed(stream)? {
            FeedSlot::Linked => {
                drop(guard);
                info!(id, event_id = %request.event_id, "Streaming directly");
                self.shared.emit(DriverEvent::PlaybackStarted { id, direct: true });
                Ok(())
            }
            FeedSlot::Failed(error) => Err(error),
            FeedSlot::Pending(_) | FeedSlot::Uploaded => Err(DriverError::State),
        }
    }

    /// Upload the sound for `props` into the server's sample cache under its
    /// event id.
    ///
    /// An absent cache-control property is treated as permanent. An explicit
    /// `never` is rejected before any lookup.
    #[instrument(skip(self, props))]
    pub fn cache(&self, props: &PropList) -> Result<()> {
        self.ensure_off_loop()?;
        let mut server_props = proplist::to_server_props(props)?;
        let event_id = proplist::event_id(&server_props)?;
        if proplist::cache_control(&server_props)? == Some(CacheControl::Never) {
            debug!(%event_id, "Refusing to cache with policy never");
            return Err(DriverError::Invalid);
        }
        proplist::strip_internal_keys(&mut server_props);

        let file = self.lookup_sound(&event_id, props)?;
        let spec = file.sample_spec();
        let size = file.size();

        let mut guard = self.shared.lock();
        guard.ensure_ready()?;

        let stream = guard
            .connection
            .create_stream(&event_id, &spec, &server_props)
            .map_err(DriverError::from_server)?;
        guard.feeds.insert(
            stream,
            FeedSlot::Pending(LocalFeed {
                feed: StreamFeed::upload(stream, file),
                purpose: FeedPurpose::Upload,
            }),
        );

        if let Err(code) = guard.connection.connect_upload(stream, size) {
            guard.feeds.remove(&stream);
            guard.connection.disconnect_stream(stream);
            return Err(DriverError::from_server(code));
        }

        match guard.wait_feed(stream)? {
            FeedSlot::Uploaded => {
                drop(guard);
                info!(%event_id, size, "Sample uploaded");
                self.shared.emit(DriverEvent::SampleUploaded { name: event_id });
                Ok(())
            }
            FeedSlot::Failed(error) => {
                warn!(%event_id, %error, "Sample upload failed");
                Err(error)
            }
            FeedSlot::Pending(_) | FeedSlot::Linked => Err(DriverError::State),
        }
    }

    /// Cancel every tracked request with `id`.
    ///
    /// Each match is killed on the server and its completion receives
    /// [`DriverError::Canceled`] on the event-loop thread. Requests without a
    /// sink input yet are skipped. All matches are processed even if a kill
    /// fails; the first failure is returned.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: RequestId) -> Result<()> {
        let mut first_error = None;
        let mut finished = Vec::new();
        {
            let mut guard = self.shared.lock();
            let (coord, mut registry) = guard.split();
            let matches = registry.unlink_where(|r| r.id == id && r.sink_input.is_some());
            drop(registry);

            for request in matches {
                if let Some(index) = request.sink_input {
                    if let Err(code) = coord.connection.kill_sink_input(index) {
                        let error = DriverError::from_server(code);
                        warn!(id, %index, %error, "Failed to kill sink input");
                        first_error.get_or_insert(error);
                    }
                }
                finished.push(retire(
                    coord.connection.as_mut(),
                    request,
                    Err(DriverError::Canceled),
                ));
            }
        }

        debug!(id, canceled = finished.len(), "Cancel processed");
        self.shared.deliver_later(finished);
        first_error.map_or(Ok(()), Err)
    }

    /// Subscribe to sink-input removals once per connection.
    pub(crate) fn subscribe(&self) -> Result<()> {
        let mut guard = self.shared.lock();
        if guard.subscribed {
            return Ok(());
        }
        guard
            .connection
            .subscribe_sink_inputs()
            .map_err(DriverError::from_server)?;
        guard.subscribed = true;
        debug!("Subscribed to sink input events");
        Ok(())
    }

    fn lookup_sound(&self, event_id: &str, request_props: &PropList) -> Result<Box<dyn SoundFile>> {
        let mut theme = self.theme.lock();
        self.lookup
            .lookup(event_id, &self.props, request_props, &mut *theme)
            .map_err(|err| {
                debug!(%event_id, error = %err, "Sound lookup failed");
                DriverError::from(err)
            })
    }
}
