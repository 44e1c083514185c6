//! The engine task.
//!
//! One task owns every piece of mutable client state: operations, the waiting
//! queue, the routing snapshot, the connection pool and the configuration
//! manager. Everything else (socket tasks, the HTTP stream, timers) posts
//! events into one of four channels and never touches that state.
//!
//! ```text
//!   Client ──Request──────────┐
//!   sockets ──TransportEvent──┤
//!   timers ──InternalEvent────┼──► Engine::run ──► ServerConnection::send
//!   HTTP stream ──StreamEvent─┘
//! ```
//!
//! # Operation lifecycle
//!
//! An operation is routed when a snapshot exists and its owner connection is
//! authenticated; otherwise it waits in FIFO order. Wrong-owner, busy and
//! internal-error responses put it back on the waiting list. Every other
//! outcome, including the timeout, completes it exactly once.

use super::multi::{MultiAggregate, MultiResults};
use super::operation::{Command, OpId, OpRequest, OpResult};
use super::value::Format;
use crate::control::{
    BucketConfig, ClusterConfig, ConfigAction, ConfigManager, ConfigStreamer, StreamEvent,
    StreamEventKind,
};
use crate::core::error::{classify_status, ClientError, ClientResult, ErrorKind, StatusAction};
use crate::net::{
    CloseReason, ConnId, ConnectionError, ConnectionOutput, ConnectionState, Connector, Endpoint,
    ResponseError, SendMode, ServerConnection, TransportEvent, Waiter,
};
use crate::protocol::{FeedEvent, Opcode, Packet, ResponseBody};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Receiving side of a change feed.
pub type FeedSender = mpsc::UnboundedSender<ClientResult<FeedEvent>>;

/// Where a key maps under the current topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub partition: u16,
    /// Index into the server list, `None` while the slot is unassigned.
    pub server_index: Option<usize>,
    pub server: Option<String>,
}

pub(crate) enum Request {
    Execute {
        request: OpRequest,
        reply: oneshot::Sender<ClientResult<OpResult>>,
    },
    Multi {
        requests: Vec<OpRequest>,
        reply: oneshot::Sender<ClientResult<MultiResults>>,
    },
    OpenFeed {
        key: String,
        name: String,
        events: FeedSender,
    },
    MappingInfo {
        key: String,
        reply: oneshot::Sender<Option<MappingInfo>>,
    },
    Shutdown,
}

/// Timer firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalEvent {
    OpTimeout(OpId),
    ConfigRetry(u64),
    ConfigInvalidated(u64),
    RetryWaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Unassigned,
    Dispatched { conn: ConnId, seq: u32 },
}

enum Completion {
    Single(oneshot::Sender<ClientResult<OpResult>>),
    Multi { aggregate: u64 },
    /// Waiting for the feed channel to open.
    FeedOpen { name: String, events: FeedSender },
    /// Streaming events.
    Feed { name: String, events: FeedSender },
}

struct Operation {
    key: String,
    command: Command,
    quiet: bool,
    format: Format,
    partition: u16,
    replica: usize,
    state: DispatchState,
    timer: Option<AbortHandle>,
    completion: Completion,
}

/// In-band topology fetch in progress.
struct ConfigFetch {
    conn: ConnId,
    host: String,
    sent: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct EngineSettings {
    pub bucket: String,
    pub password: String,
    pub tls: bool,
    pub operation_timeout: Duration,
    pub reschedule_delay: Duration,
}

/// Event receivers consumed by [`Engine::run`].
pub(crate) struct Inbox {
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub internal: mpsc::UnboundedReceiver<InternalEvent>,
    pub stream: mpsc::UnboundedReceiver<StreamEvent>,
}

pub(crate) struct Engine {
    settings: EngineSettings,
    connector: Box<dyn Connector>,
    manager: ConfigManager,
    streamer: Option<ConfigStreamer>,
    cluster: Option<ClusterConfig>,

    ops: HashMap<OpId, Operation>,
    waiting: VecDeque<OpId>,
    aggregates: HashMap<u64, MultiAggregate>,

    connections: HashMap<ConnId, ServerConnection>,
    by_name: HashMap<String, ConnId>,
    server_lookup: Vec<Option<ConnId>>,
    config_fetch: Option<ConfigFetch>,

    retry_pass_armed: bool,
    next_op: u64,
    next_conn: u64,
    next_aggregate: u64,

    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    _stream_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Engine {
    /// Build an engine. `http_client` enables the streaming configuration
    /// transport.
    pub fn new(
        settings: EngineSettings,
        connector: Box<dyn Connector>,
        manager: ConfigManager,
        http_client: Option<reqwest::Client>,
    ) -> (Self, Inbox) {
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (stream_tx, stream) = mpsc::unbounded_channel();

        let streamer = http_client.map(|client| {
            ConfigStreamer::new(
                client,
                settings.bucket.clone(),
                settings.password.clone(),
                settings.tls,
                stream_tx.clone(),
            )
        });

        let engine = Self {
            settings,
            connector,
            manager,
            streamer,
            cluster: None,
            ops: HashMap::new(),
            waiting: VecDeque::new(),
            aggregates: HashMap::new(),
            connections: HashMap::new(),
            by_name: HashMap::new(),
            server_lookup: Vec::new(),
            config_fetch: None,
            retry_pass_armed: false,
            next_op: 1,
            next_conn: 1,
            next_aggregate: 1,
            transport_tx,
            internal_tx,
            _stream_tx: stream_tx,
        };
        let inbox = Inbox {
            transport,
            internal,
            stream,
        };
        (engine, inbox)
    }

    /// Event loop. Ends on [`Request::Shutdown`] or when every client handle
    /// is dropped.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>, mut inbox: Inbox) {
        self.start();
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(event) = inbox.transport.recv() => self.handle_transport(event),
                Some(event) = inbox.internal.recv() => self.handle_internal(event),
                Some(event) = inbox.stream.recv() => self.handle_stream(event),
            }
        }
        self.shutdown();
    }

    fn start(&mut self) {
        let actions = self.manager.start();
        self.execute(actions);
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Execute { request, reply } => self.submit(request, Completion::Single(reply)),
            Request::Multi { requests, reply } => {
                if requests.is_empty() {
                    let _ = reply.send(Ok(MultiResults::new()));
                    return;
                }
                let aggregate = self.next_aggregate;
                self.next_aggregate += 1;
                self.aggregates
                    .insert(aggregate, MultiAggregate::new(requests.len(), reply));
                for request in requests {
                    self.submit(request, Completion::Multi { aggregate });
                }
            }
            Request::OpenFeed { key, name, events } => {
                let request = OpRequest {
                    key,
                    command: Command::FeedOpen { name: name.clone() },
                    quiet: false,
                    format: Format::Raw,
                    timeout: None,
                };
                self.submit(request, Completion::FeedOpen { name, events });
            }
            Request::MappingInfo { key, reply } => {
                let _ = reply.send(self.mapping_info(&key));
            }
            Request::Shutdown => {}
        }
    }

    fn submit(&mut self, request: OpRequest, completion: Completion) {
        let id = OpId(self.next_op);
        self.next_op += 1;

        let timeout = request.timeout.unwrap_or(self.settings.operation_timeout);
        let timer = self.schedule(timeout, InternalEvent::OpTimeout(id));
        self.ops.insert(
            id,
            Operation {
                key: request.key,
                command: request.command,
                quiet: request.quiet,
                format: request.format,
                partition: 0,
                replica: 0,
                state: DispatchState::Unassigned,
                timer: Some(timer),
                completion,
            },
        );
        self.try_dispatch(id);
    }

    fn mapping_info(&self, key: &str) -> Option<MappingInfo> {
        let cluster = self.cluster.as_ref()?;
        let partition = cluster.partition_for(key.as_bytes());
        let server_index = cluster.owner(partition, 0);
        Some(MappingInfo {
            partition,
            server_index,
            server: server_index
                .and_then(|index| cluster.server(index))
                .map(str::to_string),
        })
    }

    // ---- routing ---------------------------------------------------------

    /// Resolve the owner connection for an operation, opening it if needed.
    fn route(&mut self, id: OpId) -> Option<ConnId> {
        let cluster = self.cluster.as_ref()?;
        let op = self.ops.get_mut(&id)?;
        let partition = cluster.partition_for(op.key.as_bytes());
        op.partition = partition;
        let index = cluster.owner(partition, op.replica)?;
        if let Some(Some(conn)) = self.server_lookup.get(index) {
            return Some(*conn);
        }
        let address = cluster.server(index)?.to_string();
        let conn = self.get_or_connect(&address)?;
        if let Some(slot) = self.server_lookup.get_mut(index) {
            *slot = Some(conn);
        }
        Some(conn)
    }

    fn try_dispatch(&mut self, id: OpId) {
        if !self.ops.contains_key(&id) {
            return;
        }
        let Some(conn_id) = self.route(id) else {
            self.waiting.push_back(id);
            return;
        };
        match self.connections.get(&conn_id).map(ServerConnection::state) {
            Some(ConnectionState::Ready) => {}
            Some(ConnectionState::AuthFailed) => {
                self.complete(id, Err(ErrorKind::BucketNotFound));
                return;
            }
            Some(ConnectionState::Connecting | ConnectionState::Authenticating) | None => {
                self.waiting.push_back(id);
                return;
            }
        }
        let (Some(conn), Some(op)) = (self.connections.get_mut(&conn_id), self.ops.get_mut(&id))
        else {
            return;
        };

        let packet = op.command.packet(&op.key, op.partition, op.quiet);
        let mode = SendMode {
            persistent: op.command.is_persistent(),
            quiet: op.quiet,
        };
        match conn.send(packet, Some(Waiter::Operation(id)), mode) {
            Ok(seq) => {
                op.state = DispatchState::Dispatched { conn: conn_id, seq };
                tracing::trace!(op = %id, conn = %conn_id, seq, partition = op.partition, "dispatched");
                if op.quiet {
                    let flush = Packet::request(Opcode::Noop, 0);
                    if let Err(e) = conn.send(flush, Some(Waiter::Flush), SendMode::default()) {
                        tracing::debug!(conn = %conn_id, error = %e, "failed to flush quiet request");
                    }
                }
            }
            Err(ConnectionError::Closed) => self.waiting.push_back(id),
            Err(ConnectionError::Encode(e)) => {
                tracing::warn!(op = %id, error = %e, "request could not be encoded");
                self.complete(id, Err(ErrorKind::InvalidArguments));
            }
        }
    }

    /// Re-attempt every waiting operation in arrival order.
    fn drain_waiting(&mut self) {
        let pending: Vec<OpId> = self.waiting.drain(..).collect();
        for id in pending {
            self.try_dispatch(id);
        }
    }

    fn reschedule(&mut self, id: OpId, invalidate: bool, status: u16) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        tracing::debug!(
            op = %id,
            key = %op.key,
            partition = op.partition,
            status = format_args!("0x{:04x}", status),
            "rescheduling operation"
        );
        op.state = DispatchState::Unassigned;
        let (partition, replica) = (op.partition, op.replica);
        if matches!(op.completion, Completion::Feed { .. }) {
            self.restart_feed(id);
        }

        if invalidate {
            if let Some(cluster) = self.cluster.as_mut() {
                cluster.invalidate(partition, replica);
            }
            let actions = self.manager.mark_invalid();
            self.execute(actions);
        } else {
            self.arm_retry_pass();
        }
        self.waiting.push_back(id);
    }

    fn arm_retry_pass(&mut self) {
        if self.retry_pass_armed {
            return;
        }
        self.retry_pass_armed = true;
        self.schedule(self.settings.reschedule_delay, InternalEvent::RetryWaiting);
    }

    // ---- completion ------------------------------------------------------

    fn complete(&mut self, id: OpId, outcome: Result<ResponseBody, ErrorKind>) {
        let Some(op) = self.ops.remove(&id) else {
            return;
        };
        if let Some(timer) = op.timer {
            timer.abort();
        }
        // A stream registration outlives single responses and must be dropped here.
        if let (Completion::Feed { .. }, DispatchState::Dispatched { conn, seq }) =
            (&op.completion, op.state)
        {
            if let Some(conn) = self.connections.get_mut(&conn) {
                conn.cancel(seq);
            }
        }
        let result = match outcome {
            Ok(body) => Ok(OpResult::from_body(&op.key, body, op.format)),
            Err(kind) => Err(ClientError::for_key(kind, op.key.clone())),
        };

        match op.completion {
            Completion::Single(reply) => {
                let _ = reply.send(result);
            }
            Completion::Multi { aggregate } => {
                let done = match self.aggregates.get_mut(&aggregate) {
                    Some(multi) => multi.record(op.key, result),
                    None => false,
                };
                if done {
                    if let Some(multi) = self.aggregates.remove(&aggregate) {
                        multi.finish();
                    }
                }
            }
            Completion::FeedOpen { events, .. } | Completion::Feed { events, .. } => {
                if let Err(e) = result {
                    let _ = events.send(Err(e));
                }
            }
        }
    }

    fn operation_response(&mut self, id: OpId, result: Result<ResponseBody, ResponseError>) {
        let Some(op) = self.ops.get(&id) else {
            tracing::debug!(op = %id, "dropping response for completed operation");
            return;
        };
        let opening_feed = matches!(op.completion, Completion::FeedOpen { .. });

        match result {
            Ok(ResponseBody::Feed(event)) => self.feed_event(id, event),
            Ok(_) if opening_feed => self.feed_opened(id),
            Ok(body) => self.complete(id, Ok(body)),
            Err(ResponseError::Status(status)) => match classify_status(status) {
                StatusAction::Reschedule { invalidate } => self.reschedule(id, invalidate, status),
                StatusAction::Fail(kind) => self.complete(id, Err(kind)),
            },
            Err(ResponseError::Network) => self.complete(id, Err(ErrorKind::NetworkError)),
            Err(ResponseError::Malformed(e)) => {
                tracing::warn!(op = %id, error = %e, "malformed response");
                self.complete(id, Err(ErrorKind::ProtocolError));
            }
        }
    }

    fn op_timed_out(&mut self, id: OpId) {
        let Some(op) = self.ops.get_mut(&id) else {
            return;
        };
        op.timer = None;
        tracing::debug!(op = %id, key = %op.key, "operation timed out");
        match op.state {
            DispatchState::Dispatched { conn, seq } => {
                if let Some(conn) = self.connections.get_mut(&conn) {
                    conn.cancel(seq);
                }
            }
            DispatchState::Unassigned => self.waiting.retain(|waiting| *waiting != id),
        }
        self.complete(id, Err(ErrorKind::Timeout));
    }

    // ---- change feed -----------------------------------------------------

    /// The feed channel is open: request the stream on the same partition.
    fn feed_opened(&mut self, id: OpId) {
        let Some(op) = self.ops.remove(&id) else {
            return;
        };
        if let Some(timer) = &op.timer {
            timer.abort();
        }
        let Completion::FeedOpen { name, events } = op.completion else {
            return;
        };
        tracing::info!(op = %id, key = %op.key, name = %name, "change feed opened");
        let stream = Operation {
            command: Command::FeedStream { start_seqno: 0 },
            state: DispatchState::Unassigned,
            timer: None,
            completion: Completion::Feed { name, events },
            ..op
        };
        self.ops.insert(id, stream);
        self.try_dispatch(id);
    }

    fn feed_event(&mut self, id: OpId, event: FeedEvent) {
        let Some(op) = self.ops.get(&id) else {
            return;
        };
        let Completion::Feed { events, .. } = &op.completion else {
            return;
        };
        let end = event.is_end();
        let delivered = events.send(Ok(event)).is_ok();
        if !delivered {
            tracing::debug!(op = %id, "change feed receiver dropped");
        }
        if end || !delivered {
            self.close_feed(id);
        }
    }

    fn close_feed(&mut self, id: OpId) {
        let Some(op) = self.ops.remove(&id) else {
            return;
        };
        if let DispatchState::Dispatched { conn, seq } = op.state {
            if let Some(conn) = self.connections.get_mut(&conn) {
                conn.cancel(seq);
            }
        }
    }

    /// A stream moved partitions: it has to reopen its channel on the new owner.
    fn restart_feed(&mut self, id: OpId) {
        let timer = self.schedule(self.settings.operation_timeout, InternalEvent::OpTimeout(id));
        let Some(op) = self.ops.remove(&id) else {
            timer.abort();
            return;
        };
        let op = match op.completion {
            Completion::Feed { name, events } => Operation {
                command: Command::FeedOpen { name: name.clone() },
                timer: Some(timer),
                completion: Completion::FeedOpen { name, events },
                ..op
            },
            completion => {
                timer.abort();
                Operation { completion, ..op }
            }
        };
        self.ops.insert(id, op);
    }

    // ---- connections -----------------------------------------------------

    fn get_or_connect(&mut self, address: &str) -> Option<ConnId> {
        if let Some(id) = self.by_name.get(address) {
            return Some(*id);
        }
        let Some(endpoint) = Endpoint::parse(address, self.settings.tls) else {
            tracing::warn!(address = %address, "ignoring invalid server address");
            return None;
        };
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        tracing::info!(conn = %id, endpoint = %endpoint, "opening data connection");
        let writer = self
            .connector
            .connect(id, &endpoint, self.transport_tx.clone());
        self.connections
            .insert(id, ServerConnection::new(id, endpoint, writer));
        self.by_name.insert(address.to_string(), id);
        Some(id)
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected(id) => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return;
                };
                tracing::debug!(conn = %id, endpoint = %conn.endpoint(), "connected, authenticating");
                if let Err(e) = conn.authenticate(&self.settings.bucket, &self.settings.password) {
                    tracing::warn!(conn = %id, error = %e, "failed to send authentication");
                }
            }
            TransportEvent::Frame(id, packet) => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return;
                };
                for output in conn.handle_packet(packet) {
                    self.handle_output(id, output);
                }
            }
            TransportEvent::Closed(id, reason) => self.connection_closed(id, reason),
        }
    }

    fn handle_output(&mut self, conn_id: ConnId, output: ConnectionOutput) {
        match output {
            ConnectionOutput::Deliver { waiter, result } => match waiter {
                Waiter::Operation(id) => self.operation_response(id, result),
                Waiter::Auth => self.auth_completed(conn_id, result.is_ok()),
                Waiter::ConfigFetch => self.config_fetched(conn_id, result),
                Waiter::Flush => {}
            },
            ConnectionOutput::NotMyVbucket { config } => {
                let host = self
                    .connections
                    .get(&conn_id)
                    .map(|conn| conn.endpoint().name());
                if let Some(config) = self.manager.inject_new_config(&config, host.as_deref()) {
                    self.apply_config(config);
                }
            }
        }
    }

    fn auth_completed(&mut self, conn_id: ConnId, ok: bool) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        conn.auth_completed(ok);
        if ok {
            tracing::info!(conn = %conn_id, endpoint = %conn.endpoint(), "authenticated");
        } else {
            tracing::warn!(
                conn = %conn_id,
                endpoint = %conn.endpoint(),
                bucket = %self.settings.bucket,
                "authentication failed"
            );
        }

        if matches!(&self.config_fetch, Some(fetch) if fetch.conn == conn_id && !fetch.sent) {
            if ok {
                self.send_config_fetch();
            } else {
                self.config_source_failed();
            }
        }
        self.drain_waiting();
    }

    fn connection_closed(&mut self, id: ConnId, reason: CloseReason) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let outputs = conn.close();
        let auth_failed = conn.state() == ConnectionState::AuthFailed;
        if auth_failed {
            tracing::debug!(conn = %id, "transport closed after authentication failure");
        } else {
            tracing::warn!(conn = %id, endpoint = %conn.endpoint(), reason = %reason, "data connection closed");
            self.connections.remove(&id);
            self.by_name.retain(|_, conn| *conn != id);
            for slot in &mut self.server_lookup {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
        }

        for output in outputs {
            self.handle_output(id, output);
        }
        if matches!(&self.config_fetch, Some(fetch) if fetch.conn == id) {
            self.config_source_failed();
        }
        if !auth_failed && self.cluster.is_some() {
            let actions = self.manager.mark_invalid();
            self.execute(actions);
        }
    }

    /// Close pooled connections that left the server list and have nothing in flight.
    fn retire_connections(&mut self, servers: &[String]) {
        let fetch_conn = self.config_fetch.as_ref().map(|fetch| fetch.conn);
        let stale: Vec<(String, ConnId)> = self
            .by_name
            .iter()
            .filter(|(name, id)| {
                !servers.contains(*name)
                    && Some(**id) != fetch_conn
                    && self
                        .connections
                        .get(*id)
                        .map_or(true, |conn| conn.pending() == 0)
            })
            .map(|(name, id)| (name.clone(), *id))
            .collect();

        for (name, id) in stale {
            self.by_name.remove(&name);
            if let Some(mut conn) = self.connections.remove(&id) {
                tracing::info!(conn = %id, endpoint = %name, "closing connection to departed server");
                conn.close();
            }
        }
    }

    // ---- configuration ---------------------------------------------------

    fn apply_config(&mut self, config: BucketConfig) {
        let cluster = match ClusterConfig::from_bucket(&config, self.settings.tls) {
            Ok(cluster) => cluster,
            Err(e) => {
                tracing::warn!(rev = ?config.rev, error = %e, "rejected cluster configuration");
                return;
            }
        };
        let current_rev = self.cluster.as_ref().and_then(ClusterConfig::rev);
        if let (Some(current), Some(rev)) = (current_rev, cluster.rev()) {
            if rev < current {
                tracing::debug!(rev, current, "ignoring older cluster configuration");
                return;
            }
        }

        tracing::info!(
            rev = ?cluster.rev(),
            servers = cluster.servers().len(),
            partitions = cluster.partition_count(),
            "applying cluster configuration"
        );
        let lookup = cluster
            .servers()
            .iter()
            .map(|address| self.get_or_connect(address))
            .collect();
        self.retire_connections(cluster.servers());
        self.server_lookup = lookup;
        self.cluster = Some(cluster);
        self.manager.config_applied(&config);
        self.drain_waiting();
    }

    fn execute(&mut self, actions: Vec<ConfigAction>) {
        for action in actions {
            match action {
                ConfigAction::OpenStream { host } => match self.streamer.as_mut() {
                    Some(streamer) => {
                        streamer.open(&host);
                    }
                    None => tracing::warn!(host = %host, "no HTTP client for configuration stream"),
                },
                ConfigAction::CloseStream => {
                    if let Some(streamer) = self.streamer.as_mut() {
                        streamer.close();
                    }
                }
                ConfigAction::FetchInBand { host } => self.fetch_in_band(host),
                ConfigAction::ScheduleRetry { generation, delay } => {
                    self.schedule(delay, InternalEvent::ConfigRetry(generation));
                }
                ConfigAction::ArmInvalidTimer { generation, delay } => {
                    self.schedule(delay, InternalEvent::ConfigInvalidated(generation));
                }
            }
        }
    }

    fn fetch_in_band(&mut self, host: String) {
        let Some(conn) = self.get_or_connect(&host) else {
            let actions = self.manager.source_failed(&host);
            self.execute(actions);
            return;
        };
        self.config_fetch = Some(ConfigFetch {
            conn,
            host,
            sent: false,
        });
        match self.connections.get(&conn).map(ServerConnection::state) {
            Some(ConnectionState::Ready) => self.send_config_fetch(),
            Some(ConnectionState::Connecting | ConnectionState::Authenticating) => {}
            Some(ConnectionState::AuthFailed) | None => self.config_source_failed(),
        }
    }

    fn send_config_fetch(&mut self) {
        let Some(fetch) = self.config_fetch.as_mut() else {
            return;
        };
        let sent = match self.connections.get_mut(&fetch.conn) {
            Some(conn) => conn
                .send(
                    Packet::request(Opcode::GetClusterConfig, 0),
                    Some(Waiter::ConfigFetch),
                    SendMode::default(),
                )
                .is_ok(),
            None => false,
        };
        if sent {
            fetch.sent = true;
        } else {
            self.config_source_failed();
        }
    }

    fn config_source_failed(&mut self) {
        let Some(fetch) = self.config_fetch.take() else {
            return;
        };
        let actions = self.manager.source_failed(&fetch.host);
        self.execute(actions);
    }

    fn config_fetched(&mut self, conn_id: ConnId, result: Result<ResponseBody, ResponseError>) {
        if !matches!(&self.config_fetch, Some(fetch) if fetch.conn == conn_id) {
            return;
        }
        let Some(fetch) = self.config_fetch.take() else {
            return;
        };
        let config = match result {
            Ok(ResponseBody::Config(text)) => self.manager.new_config(&text, Some(&fetch.host)),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(host = %fetch.host, error = ?e, "in-band configuration fetch failed");
                None
            }
        };
        let actions = match config {
            Some(config) => {
                self.apply_config(config);
                self.manager.fetch_succeeded(&fetch.host)
            }
            None => self.manager.source_failed(&fetch.host),
        };
        self.execute(actions);
    }

    fn handle_stream(&mut self, event: StreamEvent) {
        let current = self
            .streamer
            .as_ref()
            .is_some_and(|streamer| streamer.is_current(event.stream_id));
        if !current {
            tracing::debug!(stream_id = event.stream_id, "dropping event from superseded stream");
            return;
        }
        match event.kind {
            StreamEventKind::Document(text) => {
                if let Some(config) = self.manager.new_config(&text, Some(&event.host)) {
                    self.apply_config(config);
                }
            }
            StreamEventKind::Ended { reason } => {
                tracing::info!(host = %event.host, reason = %reason, "configuration stream ended");
                if let Some(streamer) = self.streamer.as_mut() {
                    streamer.close();
                }
                let actions = self.manager.source_failed(&event.host);
                self.execute(actions);
            }
        }
    }

    // ---- timers ----------------------------------------------------------

    fn schedule(&self, delay: Duration, event: InternalEvent) -> AbortHandle {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(event);
        })
        .abort_handle()
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::OpTimeout(id) => self.op_timed_out(id),
            InternalEvent::ConfigRetry(generation) => {
                let actions = self.manager.retry_fired(generation);
                self.execute(actions);
            }
            InternalEvent::ConfigInvalidated(generation) => {
                let actions = self.manager.invalid_timer_fired(generation);
                self.execute(actions);
            }
            InternalEvent::RetryWaiting => {
                self.retry_pass_armed = false;
                self.drain_waiting();
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(pending = self.ops.len(), "engine shutting down");
        let ids: Vec<OpId> = self.ops.keys().copied().collect();
        for id in ids {
            self.complete(id, Err(ErrorKind::NetworkError));
        }
        if let Some(streamer) = self.streamer.as_mut() {
            streamer.close();
        }
        for (_, mut conn) in self.connections.drain() {
            conn.close();
        }
    }
}
