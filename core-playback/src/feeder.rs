//! Stream feeding: answers the server's write requests from sound files and
//! tracks the lifecycle of streams this client owns.
//!
//! A stream starts out as a *local* feed owned by the caller that created
//! it. An upload stays local until the server terminates it. A playback
//! stream is promoted into the registry when it becomes ready, after which
//! drain, failure or cancellation finish it.

use crate::connection::{retire, CoordinationGuard};
use crate::error::{DriverError, Result};
use crate::registry::{Completion, Finished, Outstanding, RequestId, Source, StreamFeed};
use bridge_traits::{ServerConnection, StreamId, StreamState};
use bytes::Bytes;
use tracing::{debug, trace, warn};

/// What a caller-owned stream is for.
pub(crate) enum FeedPurpose {
    Upload,
    Playback {
        id: RequestId,
        completion: Completion,
    },
}

pub(crate) struct LocalFeed {
    pub feed: StreamFeed,
    pub purpose: FeedPurpose,
}

/// Progress of a caller-owned stream, as seen by the waiting caller.
pub(crate) enum FeedSlot {
    Pending(LocalFeed),
    /// Upload accepted into the server's sample cache.
    Uploaded,
    /// Playback stream promoted into the registry.
    Linked,
    Failed(DriverError),
}

#[derive(Debug, PartialEq, Eq)]
enum Pumped {
    /// Wrote what was asked; more data remains.
    Wrote,
    /// The file is exhausted.
    Exhausted,
}

/// Copy up to `bytes` from the file into the stream, at most `chunk_limit`
/// per write.
fn pump(
    connection: &mut dyn ServerConnection,
    feed: &mut StreamFeed,
    bytes: usize,
    chunk_limit: usize,
) -> Result<Pumped> {
    let mut budget = match feed.remaining {
        Some(remaining) => bytes.min(usize::try_from(remaining).unwrap_or(usize::MAX)),
        None => bytes,
    };

    while budget > 0 {
        let mut buf = vec![0u8; budget.min(chunk_limit)];
        let read = feed.file.read_arbitrary(&mut buf)?;
        if read == 0 {
            return Ok(Pumped::Exhausted);
        }
        buf.truncate(read);

        connection
            .write(feed.stream, Bytes::from(buf))
            .map_err(DriverError::from_server)?;

        budget -= read;
        if let Some(remaining) = feed.remaining.as_mut() {
            *remaining -= read as u64;
        }
    }

    if feed.remaining == Some(0) {
        Ok(Pumped::Exhausted)
    } else {
        Ok(Pumped::Wrote)
    }
}

pub(crate) fn on_write_request(
    guard: &mut CoordinationGuard<'_>,
    stream: StreamId,
    bytes: usize,
    finished: &mut Vec<Finished>,
) {
    let chunk_limit = guard.chunk_limit;

    let coord = &mut **guard;
    match coord.feeds.get_mut(&stream) {
        Some(FeedSlot::Pending(LocalFeed {
            feed,
            purpose: FeedPurpose::Upload,
        })) => {
            let result = feed_upload(coord.connection.as_mut(), feed, bytes, chunk_limit);
            if let Err(error) = result {
                warn!(?stream, %error, "Sample upload failed");
                coord.connection.disconnect_stream(stream);
                coord.feeds.insert(stream, FeedSlot::Failed(error));
            }
            return;
        }
        Some(FeedSlot::Pending(_)) => {
            trace!(?stream, "Write request before stream ready");
            return;
        }
        _ => {}
    }

    let (coord, mut registry) = guard.split();
    let Some(key) = registry.find_stream(stream) else {
        trace!(?stream, "Write request for unknown stream");
        return;
    };
    let Some(mut request) = registry.unlink(key) else {
        return;
    };
    drop(registry);

    let connection = coord.connection.as_mut();
    let outcome = match &mut request.source {
        Source::Stream(feed) if !feed.finishing => {
            match pump(connection, feed, bytes, chunk_limit) {
                Ok(Pumped::Wrote) => Ok(()),
                Ok(Pumped::Exhausted) => connection
                    .drain(stream)
                    .map(|()| feed.finishing = true)
                    .map_err(DriverError::from_server),
                Err(error) => Err(error),
            }
        }
        _ => Ok(()),
    };

    match outcome {
        Ok(()) => guard.registry().relink(key, request),
        Err(error) => {
            warn!(id = request.id, ?stream, %error, "Stream write failed");
            finished.push(retire(guard.connection.as_mut(), request, Err(error)));
        }
    }
}

fn feed_upload(
    connection: &mut dyn ServerConnection,
    feed: &mut StreamFeed,
    bytes: usize,
    chunk_limit: usize,
) -> Result<()> {
    if feed.finishing {
        return Ok(());
    }
    if pump(connection, feed, bytes, chunk_limit)? == Pumped::Exhausted {
        feed.finishing = true;
        connection
            .finish_upload(feed.stream)
            .map_err(DriverError::from_server)?;
    }
    Ok(())
}

pub(crate) fn on_stream_state(
    guard: &mut CoordinationGuard<'_>,
    stream: StreamId,
    state: StreamState,
    finished: &mut Vec<Finished>,
) {
    if matches!(guard.feeds.get(&stream), Some(FeedSlot::Pending(_))) {
        local_stream_state(guard, stream, state);
        return;
    }

    if !state.is_final() {
        return;
    }

    let (coord, mut registry) = guard.split();
    let Some(request) = registry
        .find_stream(stream)
        .and_then(|key| registry.unlink(key))
    else {
        return;
    };
    drop(registry);

    let error = match state {
        StreamState::Failed => coord.connection_error(),
        _ => DriverError::Destroyed,
    };
    debug!(id = request.id, ?stream, ?state, %error, "Stream ended early");
    finished.push(retire(coord.connection.as_mut(), request, Err(error)));
}

fn local_stream_state(guard: &mut CoordinationGuard<'_>, stream: StreamId, state: StreamState) {
    let (coord, mut registry) = guard.split();
    let recorded_error = coord.connection_error();
    let Some(slot) = coord.feeds.get_mut(&stream) else {
        return;
    };
    let is_upload = matches!(
        slot,
        FeedSlot::Pending(LocalFeed {
            purpose: FeedPurpose::Upload,
            ..
        })
    );

    let next = match state {
        StreamState::Failed => FeedSlot::Failed(recorded_error),
        StreamState::Terminated if is_upload => FeedSlot::Uploaded,
        StreamState::Terminated if coord.connection.last_error().is_ok() => {
            FeedSlot::Failed(DriverError::Destroyed)
        }
        StreamState::Terminated => FeedSlot::Failed(recorded_error),
        StreamState::Ready if !is_upload => FeedSlot::Linked,
        _ => return,
    };

    let previous = std::mem::replace(slot, next);
    if let FeedSlot::Pending(LocalFeed {
        feed,
        purpose: FeedPurpose::Playback { id, completion },
    }) = previous
    {
        if matches!(slot, FeedSlot::Linked) {
            match coord.connection.stream_index(stream) {
                Some(index) => {
                    debug!(id, ?stream, %index, "Direct stream playing");
                    registry.link(Outstanding {
                        id,
                        sink_input: Some(index),
                        completion,
                        source: Source::Stream(feed),
                    });
                }
                None => {
                    warn!(id, ?stream, "Ready stream has no sink input");
                    *slot = FeedSlot::Failed(recorded_error);
                    drop(registry);
                    coord.connection.disconnect_stream(stream);
                }
            }
            return;
        }
    }

    if let FeedSlot::Failed(error) = slot {
        debug!(?stream, ?state, %error, "Local stream failed");
        drop(registry);
        coord.connection.disconnect_stream(stream);
    }
}

pub(crate) fn on_drained(
    guard: &mut CoordinationGuard<'_>,
    stream: StreamId,
    success: bool,
    finished: &mut Vec<Finished>,
) {
    let (coord, mut registry) = guard.split();
    let Some(request) = registry
        .find_stream(stream)
        .and_then(|key| registry.unlink(key))
    else {
        trace!(?stream, "Drain for unknown stream");
        return;
    };
    drop(registry);

    let result = if success {
        Ok(())
    } else {
        Err(coord.connection_error())
    };
    finished.push(retire(coord.connection.as_mut(), request, result));
}
