//! In-memory sound server

use bridge_traits::server::{
    ContextState, OperationId, OperationOutcome, SampleSpec, ServerConnection, ServerErrorCode,
    ServerEvent, ServerEventSink, ServerPropList, ServerResult, SinkInputId, SoundServer,
    StreamId, StreamState, Volume,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

/// Number of bytes requested per write request.
pub const WRITE_CHUNK: usize = 4096;

/// A sample stored in the loopback cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSample {
    pub spec: SampleSpec,
    pub data: Bytes,
}

/// A `play_sample` call as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedSample {
    pub name: String,
    pub device: Option<String>,
    pub volume: Volume,
    pub props: ServerPropList,
}

/// A playback stream that was drained to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedStream {
    pub name: String,
    pub device: Option<String>,
    pub spec: SampleSpec,
    pub props: ServerPropList,
    pub data: Bytes,
}

/// In-memory sound server used by tests and demos.
///
/// Cloning yields another handle to the same server, so a test can keep one
/// handle for assertions while the driver owns the connection.
#[derive(Clone, Default)]
pub struct LoopbackServer {
    state: Arc<Mutex<ServerState>>,
}

#[derive(Default)]
struct ServerState {
    unreachable: bool,
    samples: HashMap<String, CachedSample>,
    sink_inputs: BTreeMap<SinkInputId, SinkInputOwner>,
    next_sink_input: u32,
    clients: BTreeMap<u64, ClientState>,
    next_client: u64,

    discard_uploads: usize,
    hold_drains: bool,
    held_drains: Vec<(u64, StreamId)>,
    fail_writes: Option<ServerErrorCode>,
    fail_uploads: Option<ServerErrorCode>,
    failing_kills: Option<(usize, ServerErrorCode)>,
    omit_sink_inputs: bool,
    hold_plays: bool,
    held_plays: Vec<(u64, OperationId, OperationOutcome)>,
    hold_write_requests: bool,
    held_write_requests: Vec<(u64, StreamId, usize)>,

    play_requests: usize,
    uploads: usize,
    played: Vec<PlayedSample>,
    killed: Vec<SinkInputId>,
    completed: Vec<CompletedStream>,
}

#[derive(Debug, Clone, Copy)]
struct SinkInputOwner {
    client: u64,
    stream: Option<StreamId>,
}

struct ClientState {
    name: String,
    props: ServerPropList,
    events: Arc<dyn ServerEventSink>,
    state: ContextState,
    last_error: ServerErrorCode,
    subscribed: bool,
    next_operation: u64,
    next_stream: u64,
    streams: HashMap<StreamId, StreamRecord>,
}

struct StreamRecord {
    name: String,
    spec: SampleSpec,
    props: ServerPropList,
    state: StreamState,
    kind: StreamKind,
    data: Vec<u8>,
    requested: usize,
}

enum StreamKind {
    Unconnected,
    Playback {
        device: Option<String>,
        sink_input: Option<SinkInputId>,
    },
    Upload {
        length: u64,
    },
}

impl ClientState {
    fn post(&self, event: ServerEvent) {
        trace!(client = %self.name, ?event, "Posting server event");
        self.events.post(event);
    }

    fn next_operation(&mut self) -> OperationId {
        self.next_operation += 1;
        OperationId(self.next_operation)
    }

    fn complete(&mut self, outcome: OperationOutcome) -> OperationId {
        let operation = self.next_operation();
        self.post(ServerEvent::OperationComplete { operation, outcome });
        operation
    }

    fn set_stream_state(&mut self, stream: StreamId, state: StreamState) {
        if let Some(record) = self.streams.get_mut(&stream) {
            record.state = state;
            self.post(ServerEvent::StreamState { stream, state });
        }
    }

    fn request(&mut self, stream: StreamId, bytes: usize) {
        if let Some(record) = self.streams.get_mut(&stream) {
            record.requested = bytes;
            self.post(ServerEvent::StreamWriteRequest { stream, bytes });
        }
    }
}

impl ServerState {
    fn allocate_sink_input(&mut self, owner: SinkInputOwner) -> SinkInputId {
        let index = SinkInputId(self.next_sink_input);
        self.next_sink_input += 1;
        self.sink_inputs.insert(index, owner);
        index
    }

    /// Remove a sink input and notify its owner if subscribed.
    fn remove_sink_input(&mut self, index: SinkInputId) -> Option<SinkInputOwner> {
        let owner = self.sink_inputs.remove(&index)?;
        if let Some(client) = self.clients.get(&owner.client) {
            if client.subscribed && client.state == ContextState::Ready {
                client.post(ServerEvent::SinkInputRemoved(index));
            }
        }
        Some(owner)
    }

    fn ready_client(&mut self, id: u64) -> ServerResult<&mut ClientState> {
        match self.clients.get_mut(&id) {
            Some(client) if client.state == ContextState::Ready => Ok(client),
            Some(_) => Err(ServerErrorCode::BAD_STATE),
            None => Err(ServerErrorCode::CONNECTION_TERMINATED),
        }
    }

    fn drain_complete(&mut self, client: u64, stream: StreamId) {
        let Some(client) = self.clients.get(&client) else {
            return;
        };
        let Some(record) = client.streams.get(&stream) else {
            return;
        };
        if record.state != StreamState::Ready {
            return;
        }

        let device = match &record.kind {
            StreamKind::Playback { device, .. } => device.clone(),
            _ => None,
        };
        self.completed.push(CompletedStream {
            name: record.name.clone(),
            device,
            spec: record.spec,
            props: record.props.clone(),
            data: Bytes::copy_from_slice(&record.data),
        });
        client.post(ServerEvent::StreamDrained {
            stream,
            success: true,
        });
    }
}

impl LoopbackServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that refuses every connection.
    pub fn unreachable() -> Self {
        let server = Self::new();
        server.state.lock().unreachable = true;
        server
    }

    /// Store a sample in the cache as if it had been uploaded earlier.
    pub fn preload_sample(&self, name: impl Into<String>, spec: SampleSpec, data: Bytes) {
        self.state
            .lock()
            .samples
            .insert(name.into(), CachedSample { spec, data });
    }

    /// Accept the next `count` uploads without storing them, as if the server
    /// evicted them immediately.
    pub fn discard_uploads(&self, count: usize) {
        self.state.lock().discard_uploads = count;
    }

    /// Queue drain requests instead of answering them until
    /// [`LoopbackServer::complete_drains`] is called.
    pub fn hold_drains(&self, hold: bool) {
        self.state.lock().hold_drains = hold;
    }

    /// Answer every queued drain request.
    pub fn complete_drains(&self) {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held_drains);
        for (client, stream) in held {
            state.drain_complete(client, stream);
        }
    }

    /// Drain requests queued by [`LoopbackServer::hold_drains`].
    pub fn held_drains(&self) -> usize {
        self.state.lock().held_drains.len()
    }

    /// Fail every subsequent upload stream with `code` once it is connected
    /// (`None` restores uploads).
    pub fn fail_uploads(&self, code: Option<ServerErrorCode>) {
        self.state.lock().fail_uploads = code;
    }

    /// Reject the next `count` sink-input kills with `code`.
    pub fn fail_next_kills(&self, count: usize, code: ServerErrorCode) {
        self.state.lock().failing_kills = (count > 0).then_some((count, code));
    }

    /// Play cached samples without reporting the sink input they created.
    pub fn omit_sink_inputs(&self, omit: bool) {
        self.state.lock().omit_sink_inputs = omit;
    }

    /// Queue sample play completions until [`LoopbackServer::complete_plays`]
    /// is called.
    pub fn hold_plays(&self, hold: bool) {
        self.state.lock().hold_plays = hold;
    }

    pub fn held_plays(&self) -> usize {
        self.state.lock().held_plays.len()
    }

    /// Report every queued sample play completion.
    pub fn complete_plays(&self) {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held_plays);
        for (client, operation, outcome) in held {
            if let Some(client) = state.clients.get(&client) {
                client.post(ServerEvent::OperationComplete { operation, outcome });
            }
        }
    }

    /// Withhold the first write request of newly connected streams, leaving
    /// them ready but idle.
    pub fn hold_write_requests(&self, hold: bool) {
        self.state.lock().hold_write_requests = hold;
    }

    pub fn held_write_requests(&self) -> usize {
        self.state.lock().held_write_requests.len()
    }

    /// Send every withheld write request.
    pub fn release_write_requests(&self) {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held_write_requests);
        for (client, stream, bytes) in held {
            if let Some(client) = state.clients.get_mut(&client) {
                client.request(stream, bytes);
            }
        }
    }

    /// Make every subsequent `write` fail with `code` (`None` restores writes).
    pub fn fail_writes(&self, code: Option<ServerErrorCode>) {
        self.state.lock().fail_writes = code;
    }

    /// Let a sink input play to its natural end.
    pub fn finish_sink_input(&self, index: SinkInputId) -> bool {
        self.state.lock().remove_sink_input(index).is_some()
    }

    /// Let every sample playback play to its natural end.
    pub fn finish_all_sink_inputs(&self) -> usize {
        let mut state = self.state.lock();
        let samples: Vec<SinkInputId> = state
            .sink_inputs
            .iter()
            .filter(|(_, owner)| owner.stream.is_none())
            .map(|(index, _)| *index)
            .collect();
        for index in &samples {
            state.remove_sink_input(*index);
        }
        samples.len()
    }

    /// Drop every client connection with `code`.
    pub fn fail_connection(&self, code: ServerErrorCode) {
        let mut state = self.state.lock();
        state.sink_inputs.clear();

        for client in state.clients.values_mut() {
            if client.state.is_final() {
                continue;
            }
            debug!(client = %client.name, %code, "Failing loopback connection");
            client.state = ContextState::Failed;
            client.last_error = code;
            client.post(ServerEvent::ContextState(ContextState::Failed));

            let live: Vec<StreamId> = client
                .streams
                .iter()
                .filter(|(_, record)| !record.state.is_final())
                .map(|(id, _)| *id)
                .collect();
            for stream in live {
                client.set_stream_state(stream, StreamState::Failed);
            }
        }
        state.held_plays.clear();
        state.held_write_requests.clear();
    }

    pub fn play_requests(&self) -> usize {
        self.state.lock().play_requests
    }

    /// Number of finished uploads, discarded ones included.
    pub fn uploads(&self) -> usize {
        self.state.lock().uploads
    }

    pub fn cached_samples(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().samples.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cached_sample(&self, name: &str) -> Option<CachedSample> {
        self.state.lock().samples.get(name).cloned()
    }

    pub fn sink_inputs(&self) -> Vec<SinkInputId> {
        self.state.lock().sink_inputs.keys().copied().collect()
    }

    pub fn killed_sink_inputs(&self) -> Vec<SinkInputId> {
        self.state.lock().killed.clone()
    }

    pub fn played_samples(&self) -> Vec<PlayedSample> {
        self.state.lock().played.clone()
    }

    pub fn completed_streams(&self) -> Vec<CompletedStream> {
        self.state.lock().completed.clone()
    }

    /// Whether the most recent client subscribed to sink-input removals.
    pub fn subscribed(&self) -> bool {
        self.state
            .lock()
            .clients
            .values()
            .next_back()
            .is_some_and(|client| client.subscribed)
    }

    /// Property list of the most recent client.
    pub fn client_props(&self) -> Option<ServerPropList> {
        self.state
            .lock()
            .clients
            .values()
            .next_back()
            .map(|client| client.props.clone())
    }

    pub fn client_name(&self) -> Option<String> {
        self.state
            .lock()
            .clients
            .values()
            .next_back()
            .map(|client| client.name.clone())
    }

    pub fn context_state(&self) -> Option<ContextState> {
        self.state
            .lock()
            .clients
            .values()
            .next_back()
            .map(|client| client.state)
    }
}

impl SoundServer for LoopbackServer {
    fn name(&self) -> &str {
        "loopback"
    }

    fn new_connection(
        &self,
        client_name: &str,
        props: ServerPropList,
        events: Arc<dyn ServerEventSink>,
    ) -> ServerResult<Box<dyn ServerConnection>> {
        let mut state = self.state.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(
            id,
            ClientState {
                name: client_name.to_string(),
                props,
                events,
                state: ContextState::Unconnected,
                last_error: ServerErrorCode::OK,
                subscribed: false,
                next_operation: 0,
                next_stream: 0,
                streams: HashMap::new(),
            },
        );
        debug!(client = client_name, id, "Created loopback connection");

        Ok(Box::new(LoopbackConnection {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Client connection to a [`LoopbackServer`].
pub struct LoopbackConnection {
    id: u64,
    state: Arc<Mutex<ServerState>>,
}

impl LoopbackConnection {
    fn with_client<R>(&self, f: impl FnOnce(&ClientState) -> R) -> Option<R> {
        self.state.lock().clients.get(&self.id).map(f)
    }
}

impl ServerConnection for LoopbackConnection {
    fn connect(&mut self, server: Option<&str>) -> ServerResult<()> {
        let mut state = self.state.lock();
        let unreachable = state.unreachable;
        let client = state
            .clients
            .get_mut(&self.id)
            .ok_or(ServerErrorCode::CONNECTION_TERMINATED)?;
        if client.state != ContextState::Unconnected {
            return Err(ServerErrorCode::BAD_STATE);
        }

        debug!(server = server.unwrap_or("<default>"), "Connecting to loopback server");
        client.state = ContextState::Connecting;
        client.post(ServerEvent::ContextState(ContextState::Connecting));

        if unreachable {
            client.state = ContextState::Failed;
            client.last_error = ServerErrorCode::CONNECTION_REFUSED;
            client.post(ServerEvent::ContextState(ContextState::Failed));
        } else {
            client.state = ContextState::Ready;
            client.post(ServerEvent::ContextState(ContextState::Ready));
        }
        Ok(())
    }

    fn state(&self) -> ContextState {
        self.with_client(|client| client.state)
            .unwrap_or(ContextState::Terminated)
    }

    fn last_error(&self) -> ServerErrorCode {
        self.with_client(|client| client.last_error)
            .unwrap_or(ServerErrorCode::CONNECTION_TERMINATED)
    }

    fn play_sample(
        &mut self,
        name: &str,
        device: Option<&str>,
        volume: Volume,
        props: &ServerPropList,
    ) -> ServerResult<OperationId> {
        let mut state = self.state.lock();
        state.ready_client(self.id)?;

        state.play_requests += 1;
        state.played.push(PlayedSample {
            name: name.to_string(),
            device: device.map(str::to_string),
            volume,
            props: props.clone(),
        });

        let outcome = if !state.samples.contains_key(name) {
            OperationOutcome::Failed(ServerErrorCode::NO_ENTITY)
        } else if state.omit_sink_inputs {
            OperationOutcome::Success
        } else {
            let index = state.allocate_sink_input(SinkInputOwner {
                client: self.id,
                stream: None,
            });
            OperationOutcome::SinkInput(index)
        };

        let hold = state.hold_plays;
        let client = state.ready_client(self.id)?;
        if !hold {
            return Ok(client.complete(outcome));
        }
        let operation = client.next_operation();
        state.held_plays.push((self.id, operation, outcome));
        Ok(operation)
    }

    fn subscribe_sink_inputs(&mut self) -> ServerResult<OperationId> {
        let mut state = self.state.lock();
        let client = state.ready_client(self.id)?;
        client.subscribed = true;
        Ok(client.complete(OperationOutcome::Success))
    }

    fn update_proplist(&mut self, props: &ServerPropList) -> ServerResult<OperationId> {
        let mut state = self.state.lock();
        let client = state.ready_client(self.id)?;
        client.props.update(props);
        Ok(client.complete(OperationOutcome::Success))
    }

    fn kill_sink_input(&mut self, index: SinkInputId) -> ServerResult<OperationId> {
        let mut state = self.state.lock();
        state.ready_client(self.id)?;

        if let Some((count, code)) = state.failing_kills {
            state.failing_kills = (count > 1).then_some((count - 1, code));
            return Err(code);
        }

        let owner = state
            .remove_sink_input(index)
            .ok_or(ServerErrorCode::NO_ENTITY)?;
        state.killed.push(index);

        if let (Some(stream), Some(client)) = (owner.stream, state.clients.get_mut(&owner.client))
        {
            client.last_error = ServerErrorCode::KILLED;
            client.set_stream_state(stream, StreamState::Failed);
        }

        let client = state.ready_client(self.id)?;
        Ok(client.complete(OperationOutcome::Success))
    }

    fn create_stream(
        &mut self,
        name: &str,
        spec: &SampleSpec,
        props: &ServerPropList,
    ) -> ServerResult<StreamId> {
        if !spec.is_valid() {
            return Err(ServerErrorCode::INVALID);
        }

        let mut state = self.state.lock();
        let client = state.ready_client(self.id)?;
        client.next_stream += 1;
        let stream = StreamId(client.next_stream);
        client.streams.insert(
            stream,
            StreamRecord {
                name: name.to_string(),
                spec: *spec,
                props: props.clone(),
                state: StreamState::Unconnected,
                kind: StreamKind::Unconnected,
                data: Vec::new(),
                requested: 0,
            },
        );
        Ok(stream)
    }

    fn connect_playback(&mut self, stream: StreamId, device: Option<&str>) -> ServerResult<()> {
        let mut state = self.state.lock();
        {
            let client = state.ready_client(self.id)?;
            let record = client
                .streams
                .get(&stream)
                .ok_or(ServerErrorCode::NO_ENTITY)?;
            if !matches!(record.kind, StreamKind::Unconnected) {
                return Err(ServerErrorCode::BAD_STATE);
            }
        }

        let index = state.allocate_sink_input(SinkInputOwner {
            client: self.id,
            stream: Some(stream),
        });
        let hold = state.hold_write_requests;
        let client = state.ready_client(self.id)?;
        if let Some(record) = client.streams.get_mut(&stream) {
            record.kind = StreamKind::Playback {
                device: device.map(str::to_string),
                sink_input: Some(index),
            };
        }
        client.set_stream_state(stream, StreamState::Creating);
        client.set_stream_state(stream, StreamState::Ready);
        if hold {
            state.held_write_requests.push((self.id, stream, WRITE_CHUNK));
        } else {
            client.request(stream, WRITE_CHUNK);
        }
        Ok(())
    }

    fn connect_upload(&mut self, stream: StreamId, length: u64) -> ServerResult<()> {
        let mut state = self.state.lock();
        let fail_uploads = state.fail_uploads;
        let hold = state.hold_write_requests;
        let client = state.ready_client(self.id)?;
        let record = client
            .streams
            .get_mut(&stream)
            .ok_or(ServerErrorCode::NO_ENTITY)?;
        if !matches!(record.kind, StreamKind::Unconnected) {
            return Err(ServerErrorCode::BAD_STATE);
        }
        record.kind = StreamKind::Upload { length };

        client.set_stream_state(stream, StreamState::Creating);
        if let Some(code) = fail_uploads {
            client.last_error = code;
            client.set_stream_state(stream, StreamState::Failed);
            return Ok(());
        }
        client.set_stream_state(stream, StreamState::Ready);

        let bytes = (length as usize).min(WRITE_CHUNK);
        if hold {
            state.held_write_requests.push((self.id, stream, bytes));
        } else {
            client.request(stream, bytes);
        }
        Ok(())
    }

    fn stream_state(&self, stream: StreamId) -> StreamState {
        self.with_client(|client| {
            client
                .streams
                .get(&stream)
                .map(|record| record.state)
                .unwrap_or(StreamState::Terminated)
        })
        .unwrap_or(StreamState::Terminated)
    }

    fn stream_index(&self, stream: StreamId) -> Option<SinkInputId> {
        self.with_client(|client| match client.streams.get(&stream).map(|r| &r.kind) {
            Some(StreamKind::Playback { sink_input, .. }) => *sink_input,
            _ => None,
        })
        .flatten()
    }

    fn write(&mut self, stream: StreamId, data: Bytes) -> ServerResult<()> {
        let mut state = self.state.lock();
        let fail_writes = state.fail_writes;
        let client = state.ready_client(self.id)?;
        if let Some(code) = fail_writes {
            client.last_error = code;
            return Err(code);
        }

        let record = client
            .streams
            .get_mut(&stream)
            .ok_or(ServerErrorCode::NO_ENTITY)?;
        if record.state != StreamState::Ready {
            return Err(ServerErrorCode::BAD_STATE);
        }

        record.data.extend_from_slice(&data);
        record.requested = record.requested.saturating_sub(data.len());
        trace!(stream = stream.0, bytes = data.len(), "Loopback write");

        if record.requested > 0 {
            return Ok(());
        }
        let next = match record.kind {
            StreamKind::Upload { length } => {
                let received = record.data.len() as u64;
                if received > length {
                    return Err(ServerErrorCode::TOO_LARGE);
                }
                (length - received).min(WRITE_CHUNK as u64) as usize
            }
            StreamKind::Playback { .. } => WRITE_CHUNK,
            StreamKind::Unconnected => 0,
        };
        if next > 0 {
            client.request(stream, next);
        }
        Ok(())
    }

    fn finish_upload(&mut self, stream: StreamId) -> ServerResult<()> {
        let mut state = self.state.lock();
        let client = state.ready_client(self.id)?;
        let record = client
            .streams
            .get(&stream)
            .ok_or(ServerErrorCode::NO_ENTITY)?;
        if !matches!(record.kind, StreamKind::Upload { .. }) || record.state != StreamState::Ready
        {
            return Err(ServerErrorCode::BAD_STATE);
        }

        let name = record.name.clone();
        let sample = CachedSample {
            spec: record.spec,
            data: Bytes::copy_from_slice(&record.data),
        };
        client.set_stream_state(stream, StreamState::Terminated);

        state.uploads += 1;
        if state.discard_uploads > 0 {
            state.discard_uploads -= 1;
            debug!(sample = %name, "Discarding uploaded sample");
        } else {
            debug!(sample = %name, bytes = sample.data.len(), "Stored uploaded sample");
            state.samples.insert(name, sample);
        }
        Ok(())
    }

    fn drain(&mut self, stream: StreamId) -> ServerResult<()> {
        let mut state = self.state.lock();
        let client = state.ready_client(self.id)?;
        let record = client
            .streams
            .get(&stream)
            .ok_or(ServerErrorCode::NO_ENTITY)?;
        if !matches!(record.kind, StreamKind::Playback { .. }) || record.state != StreamState::Ready
        {
            return Err(ServerErrorCode::BAD_STATE);
        }

        if state.hold_drains {
            state.held_drains.push((self.id, stream));
        } else {
            state.drain_complete(self.id, stream);
        }
        Ok(())
    }

    fn disconnect_stream(&mut self, stream: StreamId) {
        let mut state = self.state.lock();
        let sink_input = {
            let Some(client) = state.clients.get_mut(&self.id) else {
                return;
            };
            let Some(record) = client.streams.get(&stream) else {
                return;
            };
            if record.state.is_final() {
                return;
            }
            let sink_input = match record.kind {
                StreamKind::Playback { sink_input, .. } => sink_input,
                _ => None,
            };
            client.set_stream_state(stream, StreamState::Terminated);
            sink_input
        };

        if let Some(index) = sink_input {
            state.remove_sink_input(index);
        }
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        let Some(client) = state.clients.get_mut(&self.id) else {
            return;
        };
        if client.state == ContextState::Terminated {
            return;
        }
        client.state = ContextState::Terminated;
        client.streams.clear();
        client.post(ServerEvent::ContextState(ContextState::Terminated));

        let id = self.id;
        state.sink_inputs.retain(|_, owner| owner.client != id);
        state.held_drains.retain(|(client, _)| *client != id);
        state.held_plays.retain(|(client, _, _)| *client != id);
        state.held_write_requests.retain(|(client, _, _)| *client != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::server::SampleFormat;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ServerEvent>>,
    }

    impl ServerEventSink for Recorder {
        fn post(&self, event: ServerEvent) {
            self.events.lock().push(event);
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<ServerEvent> {
            std::mem::take(&mut self.events.lock())
        }
    }

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Ne, 1, 8_000)
    }

    fn connected(server: &LoopbackServer) -> (Box<dyn ServerConnection>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut conn = server
            .new_connection("test", ServerPropList::new(), recorder.clone())
            .unwrap();
        conn.connect(None).unwrap();
        recorder.take();
        (conn, recorder)
    }

    #[test]
    fn test_connect_reports_states() {
        let server = LoopbackServer::new();
        let recorder = Arc::new(Recorder::default());
        let mut conn = server
            .new_connection("test", ServerPropList::new(), recorder.clone())
            .unwrap();
        conn.connect(None).unwrap();

        assert_eq!(
            recorder.take(),
            vec![
                ServerEvent::ContextState(ContextState::Connecting),
                ServerEvent::ContextState(ContextState::Ready),
            ]
        );
        assert_eq!(conn.state(), ContextState::Ready);
    }

    #[test]
    fn test_unreachable_server_refuses() {
        let server = LoopbackServer::unreachable();
        let recorder = Arc::new(Recorder::default());
        let mut conn = server
            .new_connection("test", ServerPropList::new(), recorder.clone())
            .unwrap();
        conn.connect(None).unwrap();

        assert_eq!(conn.state(), ContextState::Failed);
        assert_eq!(conn.last_error(), ServerErrorCode::CONNECTION_REFUSED);
    }

    #[test]
    fn test_play_missing_sample_fails_with_no_entity() {
        let server = LoopbackServer::new();
        let (mut conn, recorder) = connected(&server);

        let op = conn
            .play_sample("bell", None, Volume::NORM, &ServerPropList::new())
            .unwrap();

        assert_eq!(
            recorder.take(),
            vec![ServerEvent::OperationComplete {
                operation: op,
                outcome: OperationOutcome::Failed(ServerErrorCode::NO_ENTITY),
            }]
        );
        assert_eq!(server.play_requests(), 1);
    }

    #[test]
    fn test_upload_then_play() {
        let server = LoopbackServer::new();
        let (mut conn, recorder) = connected(&server);

        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_upload(stream, 4).unwrap();
        let events = recorder.take();
        assert_eq!(
            events.last(),
            Some(&ServerEvent::StreamWriteRequest { stream, bytes: 4 })
        );

        conn.write(stream, Bytes::from_static(&[1, 2, 3, 4])).unwrap();
        conn.finish_upload(stream).unwrap();
        assert_eq!(server.cached_samples(), vec!["bell".to_string()]);

        let op = conn
            .play_sample("bell", None, Volume::NORM, &ServerPropList::new())
            .unwrap();
        let events = recorder.take();
        assert!(events.contains(&ServerEvent::OperationComplete {
            operation: op,
            outcome: OperationOutcome::SinkInput(SinkInputId(0)),
        }));
    }

    #[test]
    fn test_discarded_upload_is_counted() {
        let server = LoopbackServer::new();
        server.discard_uploads(1);
        let (mut conn, _recorder) = connected(&server);

        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_upload(stream, 0).unwrap();
        conn.finish_upload(stream).unwrap();

        assert_eq!(server.uploads(), 1);
        assert!(server.cached_samples().is_empty());
    }

    #[test]
    fn test_kill_notifies_subscribers() {
        let server = LoopbackServer::new();
        server.preload_sample("bell", spec(), Bytes::new());
        let (mut conn, recorder) = connected(&server);
        conn.subscribe_sink_inputs().unwrap();
        conn.play_sample("bell", None, Volume::NORM, &ServerPropList::new())
            .unwrap();
        recorder.take();

        conn.kill_sink_input(SinkInputId(0)).unwrap();
        let events = recorder.take();
        assert_eq!(events[0], ServerEvent::SinkInputRemoved(SinkInputId(0)));
        assert_eq!(server.killed_sink_inputs(), vec![SinkInputId(0)]);
        assert_eq!(
            conn.kill_sink_input(SinkInputId(0)),
            Err(ServerErrorCode::NO_ENTITY)
        );
    }

    #[test]
    fn test_playback_drain_records_stream() {
        let server = LoopbackServer::new();
        let (mut conn, recorder) = connected(&server);

        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_playback(stream, Some("speakers")).unwrap();
        assert_eq!(conn.stream_index(stream), Some(SinkInputId(0)));

        conn.write(stream, Bytes::from_static(b"abcd")).unwrap();
        server.hold_drains(true);
        conn.drain(stream).unwrap();
        assert!(server.completed_streams().is_empty());

        recorder.take();
        server.complete_drains();
        assert_eq!(
            recorder.take(),
            vec![ServerEvent::StreamDrained {
                stream,
                success: true
            }]
        );

        let completed = server.completed_streams();
        assert_eq!(completed[0].data, Bytes::from_static(b"abcd"));
        assert_eq!(completed[0].device.as_deref(), Some("speakers"));
    }

    #[test]
    fn test_fail_writes() {
        let server = LoopbackServer::new();
        let (mut conn, _recorder) = connected(&server);
        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_playback(stream, None).unwrap();

        server.fail_writes(Some(ServerErrorCode::INTERNAL));
        assert_eq!(
            conn.write(stream, Bytes::from_static(b"x")),
            Err(ServerErrorCode::INTERNAL)
        );
        assert_eq!(conn.last_error(), ServerErrorCode::INTERNAL);
    }

    #[test]
    fn test_fail_connection_fails_streams() {
        let server = LoopbackServer::new();
        let (mut conn, recorder) = connected(&server);
        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_playback(stream, None).unwrap();
        recorder.take();

        server.fail_connection(ServerErrorCode::CONNECTION_TERMINATED);
        assert_eq!(
            recorder.take(),
            vec![
                ServerEvent::ContextState(ContextState::Failed),
                ServerEvent::StreamState {
                    stream,
                    state: StreamState::Failed
                },
            ]
        );
        assert_eq!(conn.last_error(), ServerErrorCode::CONNECTION_TERMINATED);
        assert!(server.sink_inputs().is_empty());
    }

    #[test]
    fn test_held_plays_complete_on_request() {
        let server = LoopbackServer::new();
        server.preload_sample("bell", spec(), Bytes::new());
        server.hold_plays(true);
        let (mut conn, recorder) = connected(&server);

        let op = conn
            .play_sample("bell", None, Volume::NORM, &ServerPropList::new())
            .unwrap();
        assert!(recorder.take().is_empty());
        assert_eq!(server.held_plays(), 1);

        server.complete_plays();
        assert_eq!(
            recorder.take(),
            vec![ServerEvent::OperationComplete {
                operation: op,
                outcome: OperationOutcome::SinkInput(SinkInputId(0)),
            }]
        );
        assert_eq!(server.held_plays(), 0);
    }

    #[test]
    fn test_omitted_sink_input_reports_success() {
        let server = LoopbackServer::new();
        server.preload_sample("bell", spec(), Bytes::new());
        server.omit_sink_inputs(true);
        let (mut conn, recorder) = connected(&server);

        let op = conn
            .play_sample("bell", None, Volume::NORM, &ServerPropList::new())
            .unwrap();
        assert_eq!(
            recorder.take(),
            vec![ServerEvent::OperationComplete {
                operation: op,
                outcome: OperationOutcome::Success,
            }]
        );
        assert!(server.sink_inputs().is_empty());
    }

    #[test]
    fn test_failing_kills_run_out() {
        let server = LoopbackServer::new();
        server.preload_sample("bell", spec(), Bytes::new());
        server.fail_next_kills(1, ServerErrorCode::ACCESS);
        let (mut conn, _recorder) = connected(&server);
        conn.play_sample("bell", None, Volume::NORM, &ServerPropList::new())
            .unwrap();

        assert_eq!(
            conn.kill_sink_input(SinkInputId(0)),
            Err(ServerErrorCode::ACCESS)
        );
        assert!(conn.kill_sink_input(SinkInputId(0)).is_ok());
        assert_eq!(server.killed_sink_inputs(), vec![SinkInputId(0)]);
    }

    #[test]
    fn test_failed_upload_stream() {
        let server = LoopbackServer::new();
        server.fail_uploads(Some(ServerErrorCode::ACCESS));
        let (mut conn, recorder) = connected(&server);

        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_upload(stream, 4).unwrap();

        assert_eq!(
            recorder.take().last(),
            Some(&ServerEvent::StreamState {
                stream,
                state: StreamState::Failed
            })
        );
        assert_eq!(conn.last_error(), ServerErrorCode::ACCESS);
        assert_eq!(conn.stream_state(stream), StreamState::Failed);
    }

    #[test]
    fn test_held_write_requests_are_released() {
        let server = LoopbackServer::new();
        server.hold_write_requests(true);
        let (mut conn, recorder) = connected(&server);

        let stream = conn
            .create_stream("bell", &spec(), &ServerPropList::new())
            .unwrap();
        conn.connect_upload(stream, 4).unwrap();
        assert!(!recorder
            .take()
            .iter()
            .any(|event| matches!(event, ServerEvent::StreamWriteRequest { .. })));
        assert_eq!(server.held_write_requests(), 1);

        server.release_write_requests();
        assert_eq!(
            recorder.take(),
            vec![ServerEvent::StreamWriteRequest { stream, bytes: 4 }]
        );
    }
}
