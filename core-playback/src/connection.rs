//! # Connection Coordination
//!
//! Owns the server connection, the event-loop thread and the locks that
//! order caller threads against it.
//!
//! ## Locking
//!
//! ```text
//! coordination (Mutex<Coordination> + Condvar)
//!   └── registry (Mutex<Registry>)
//! ```
//!
//! Every server call is made with the coordination lock held. The registry
//! lock nests inside it and can only be reached through
//! [`CoordinationGuard::split`], so the order cannot be inverted. Callers
//! that wait for an outcome block on the condvar, which releases the
//! coordination lock while the loop thread dispatches.
//!
//! ## Event loop
//!
//! Server notifications are posted into an unbounded channel and handled on
//! a dedicated thread named `chime-event-loop`. Completions are collected
//! while dispatching and fired after both locks are released, so a callback
//! may call back into the driver.

use crate::error::{DriverError, Result};
use crate::feeder::{self, FeedSlot};
use crate::registry::{self, Completion, Finished, Outstanding, Registry, RequestId};
use bridge_traits::{
    ContextState, OperationId, OperationOutcome, ServerConnection, ServerErrorCode, ServerEvent,
    ServerEventSink, SinkInputId, StreamId,
};
use core_runtime::events::{DriverEvent, EventBus};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Name of the thread that dispatches server notifications and fires
/// completions.
pub const EVENT_LOOP_THREAD: &str = "chime-event-loop";

/// Work for the event-loop thread.
pub(crate) enum LoopMessage {
    Server(ServerEvent),
    /// Completions produced on a caller thread.
    Deliver(Vec<Finished>),
    Quit,
}

/// Forwards server notifications into the loop channel.
pub(crate) struct LoopSink {
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl LoopSink {
    pub fn new(tx: mpsc::UnboundedSender<LoopMessage>) -> Self {
        Self { tx }
    }
}

impl ServerEventSink for LoopSink {
    fn post(&self, event: ServerEvent) {
        if self.tx.send(LoopMessage::Server(event)).is_err() {
            trace!("Event loop stopped; dropping server event");
        }
    }
}

/// A play waiting for the server to say where the sample is playing.
pub(crate) struct PendingSample {
    pub id: RequestId,
    pub completion: Completion,
}

#[derive(Default)]
pub(crate) struct OperationSlot {
    pub outcome: Option<OperationOutcome>,
    pub pending: Option<PendingSample>,
}

/// State guarded by the coordination lock.
pub(crate) struct Coordination {
    pub connection: Box<dyn ServerConnection>,
    pub operations: HashMap<OperationId, OperationSlot>,
    pub feeds: HashMap<StreamId, FeedSlot>,
    pub subscribed: bool,
    pub device: Option<String>,
    pub chunk_limit: usize,
}

impl Coordination {
    /// Error describing the connection's last failure.
    pub fn connection_error(&self) -> DriverError {
        DriverError::from_server(self.connection.last_error())
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match self.connection.state() {
            ContextState::Ready => Ok(()),
            state => {
                debug!(?state, "Connection not ready");
                Err(DriverError::State)
            }
        }
    }
}

/// State shared between the driver handle and its event loop.
pub(crate) struct Shared {
    coordination: Mutex<Coordination>,
    signal: Condvar,
    registry: Mutex<Registry>,
    loop_tx: mpsc::UnboundedSender<LoopMessage>,
    pub events: Option<EventBus>,
}

impl Shared {
    pub fn new(
        connection: Box<dyn ServerConnection>,
        device: Option<String>,
        chunk_limit: usize,
        events: Option<EventBus>,
        loop_tx: mpsc::UnboundedSender<LoopMessage>,
    ) -> Self {
        Self {
            coordination: Mutex::new(Coordination {
                connection,
                operations: HashMap::new(),
                feeds: HashMap::new(),
                subscribed: false,
                device,
                chunk_limit,
            }),
            signal: Condvar::new(),
            registry: Mutex::new(Registry::new()),
            loop_tx,
            events,
        }
    }

    pub fn lock(&self) -> CoordinationGuard<'_> {
        CoordinationGuard {
            guard: self.coordination.lock(),
            registry: &self.registry,
            signal: &self.signal,
        }
    }

    /// Registry size. Taken under the coordination lock, since write
    /// handling unlinks a stream's entry while it feeds the server.
    pub fn outstanding_count(&self) -> usize {
        let mut guard = self.lock();
        let count = guard.registry().len();
        count
    }

    pub fn emit(&self, event: DriverEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    /// Fire completions on the loop thread, or inline if the loop is gone.
    pub fn deliver_later(&self, finished: Vec<Finished>) {
        if finished.is_empty() {
            return;
        }
        if let Err(mpsc::error::SendError(LoopMessage::Deliver(finished))) =
            self.loop_tx.send(LoopMessage::Deliver(finished))
        {
            registry::deliver_all(finished, self.events.as_ref());
        }
    }

    fn dispatch(&self, event: ServerEvent) {
        let mut finished = Vec::new();
        {
            let mut guard = self.lock();
            match event {
                ServerEvent::ContextState(state) => {
                    on_context_state(&mut guard, state, self.events.as_ref(), &mut finished)
                }
                ServerEvent::SinkInputRemoved(index) => {
                    on_sink_input_removed(&mut guard, index, &mut finished)
                }
                ServerEvent::OperationComplete { operation, outcome } => {
                    on_operation_complete(&mut guard, operation, outcome)
                }
                ServerEvent::StreamState { stream, state } => {
                    feeder::on_stream_state(&mut guard, stream, state, &mut finished)
                }
                ServerEvent::StreamWriteRequest { stream, bytes } => {
                    feeder::on_write_request(&mut guard, stream, bytes, &mut finished)
                }
                ServerEvent::StreamDrained { stream, success } => {
                    feeder::on_drained(&mut guard, stream, success, &mut finished)
                }
            }
            guard.notify();
        }
        registry::deliver_all(finished, self.events.as_ref());
    }
}

/// Held coordination lock with controlled access to the registry.
pub(crate) struct CoordinationGuard<'a> {
    guard: MutexGuard<'a, Coordination>,
    registry: &'a Mutex<Registry>,
    signal: &'a Condvar,
}

impl CoordinationGuard<'_> {
    /// Borrow the coordination state and lock the registry under it.
    pub fn split(&mut self) -> (&mut Coordination, MutexGuard<'_, Registry>) {
        let registry = self.registry.lock();
        (&mut *self.guard, registry)
    }

    pub fn registry(&mut self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Release the lock until the loop thread signals, then reacquire it.
    pub fn wait(&mut self) {
        self.signal.wait(&mut self.guard);
    }

    pub fn notify(&self) {
        self.signal.notify_all();
    }

    /// Block until the operation's outcome arrives and take its slot.
    pub fn wait_operation(&mut self, operation: OperationId) -> Result<OperationSlot> {
        loop {
            let done = match self.operations.get(&operation) {
                Some(slot) => slot.outcome.is_some(),
                None => return Err(DriverError::State),
            };
            if done {
                return self.operations.remove(&operation).ok_or(DriverError::State);
            }
            self.wait();
        }
    }

    /// Block until a locally owned stream settles and take its slot.
    pub fn wait_feed(&mut self, stream: StreamId) -> Result<FeedSlot> {
        loop {
            let settled = match self.feeds.get(&stream) {
                Some(slot) => !matches!(slot, FeedSlot::Pending(_)),
                None => return Err(DriverError::State),
            };
            if settled {
                return self.feeds.remove(&stream).ok_or(DriverError::State);
            }
            self.wait();
        }
    }
}

impl Deref for CoordinationGuard<'_> {
    type Target = Coordination;

    fn deref(&self) -> &Coordination {
        &self.guard
    }
}

impl DerefMut for CoordinationGuard<'_> {
    fn deref_mut(&mut self) -> &mut Coordination {
        &mut self.guard
    }
}

fn on_context_state(
    guard: &mut CoordinationGuard<'_>,
    state: ContextState,
    events: Option<&EventBus>,
    finished: &mut Vec<Finished>,
) {
    if !state.is_final() {
        trace!(?state, "Context state changed");
        return;
    }

    let (coord, mut registry) = guard.split();
    let error = match state {
        ContextState::Terminated => DriverError::Destroyed,
        _ => coord.connection_error(),
    };
    let lost = registry.drain();
    drop(registry);

    error!(?state, %error, outstanding = lost.len(), "Sound server connection lost");

    for request in lost {
        finished.push(retire(coord.connection.as_mut(), request, Err(error)));
    }

    let code = match coord.connection.last_error() {
        ServerErrorCode::OK => ServerErrorCode::CONNECTION_TERMINATED,
        code => code,
    };
    for slot in coord.operations.values_mut() {
        if slot.outcome.is_none() {
            slot.outcome = Some(OperationOutcome::Failed(code));
        }
    }
    for slot in coord.feeds.values_mut() {
        if matches!(slot, FeedSlot::Pending(_)) {
            *slot = FeedSlot::Failed(error);
        }
    }

    if let Some(bus) = events {
        bus.emit(DriverEvent::ConnectionLost {
            reason: error.to_string(),
        });
    }
}

fn on_sink_input_removed(
    guard: &mut CoordinationGuard<'_>,
    index: SinkInputId,
    finished: &mut Vec<Finished>,
) {
    let done = guard
        .registry()
        .unlink_where(|r| r.is_sample() && r.sink_input == Some(index));

    trace!(%index, matched = done.len(), "Sink input removed");
    finished.extend(done.into_iter().map(|request| request.finish(Ok(()))));
}

fn on_operation_complete(
    guard: &mut CoordinationGuard<'_>,
    operation: OperationId,
    outcome: OperationOutcome,
) {
    let (coord, mut registry) = guard.split();
    let Some(slot) = coord.operations.get_mut(&operation) else {
        if let OperationOutcome::Failed(code) = outcome {
            warn!(?operation, %code, "Background operation failed");
        }
        return;
    };

    if let OperationOutcome::SinkInput(index) = outcome {
        // Link before any removal event for this sink input is dispatched.
        let attached = slot
            .pending
            .as_ref()
            .is_some_and(|pending| pending.completion.is_attached());
        if let Some(pending) = slot.pending.take().filter(|_| attached) {
            debug!(id = pending.id, %index, "Tracking cached sample");
            registry.link(Outstanding::sample(pending.id, index, pending.completion));
        }
    }
    slot.outcome = Some(outcome);
}

/// Tear down a request's stream, if any, and pair it with its result.
pub(crate) fn retire(
    connection: &mut dyn ServerConnection,
    request: Outstanding,
    result: Result<()>,
) -> Finished {
    if let Some(stream) = request.stream() {
        connection.disconnect_stream(stream);
    }
    request.finish(result)
}

/// The dedicated dispatch thread.
pub(crate) struct EventLoop {
    handle: Option<JoinHandle<()>>,
    thread: ThreadId,
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl EventLoop {
    pub fn spawn(
        shared: Arc<Shared>,
        tx: mpsc::UnboundedSender<LoopMessage>,
        rx: mpsc::UnboundedReceiver<LoopMessage>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(EVENT_LOOP_THREAD.to_string())
            .spawn(move || run(shared, rx))
            .map_err(|err| {
                error!(error = %err, "Failed to spawn event loop thread");
                DriverError::Oom
            })?;

        Ok(Self {
            thread: handle.thread().id(),
            handle: Some(handle),
            tx,
        })
    }

    /// Returns `true` when called from a completion running on the loop.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Stop dispatching. Joins unless called from the loop thread itself.
    pub fn stop(&mut self) {
        let _ = self.tx.send(LoopMessage::Quit);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.is_current() {
            debug!("Event loop stopped from its own thread; not joining");
            return;
        }
        if handle.join().is_err() {
            error!("Event loop thread panicked");
        }
    }
}

fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<LoopMessage>) {
    debug!("Event loop started");
    while let Some(message) = rx.blocking_recv() {
        match message {
            LoopMessage::Server(event) => shared.dispatch(event),
            LoopMessage::Deliver(finished) => {
                registry::deliver_all(finished, shared.events.as_ref())
            }
            LoopMessage::Quit => break,
        }
    }
    debug!("Event loop stopped");
}
