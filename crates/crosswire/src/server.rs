//! See [`Server`].

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::{
    ack::RecvDecision,
    config::Config,
    connection::{
        Connection, ConnectionState, Retry, NOTIFY_LAST_RECV_BIT, NOTIFY_RECV_BITS_BIT,
        NOTIFY_SEQ_BIT, RELIABLE_SEQ_BIT,
    },
    event::{HandlerAlreadyRegistered, ServerEvent, ServerHandler},
    header::{DisconnectReason, HeaderKind, RejectReason, SendMode},
    msg::{Message, MessagePool},
    notify::NotifyFate,
    peer::{DelayedEvent, EventQueue},
    seq::Seq,
    transport::{EndpointId, LinkDrop, ServerTransport, TransportEvent},
};

/// How many times a rejection datagram is sent; rejections are not acked, so
/// repetition is the only robustness they get.
const REJECT_REPEATS: usize = 3;

/// Server peer: accepts up to `max_client_count` clients over a
/// [`ServerTransport`], assigns each a compact numeric ID, and drives
/// handshakes, heartbeat probes and echoes, and per-client reliability from
/// its [`Server::update`] tick.
///
/// Single-threaded, like [`Client`]: all state is owned by the thread calling
/// `update`.
///
/// [`Client`]: crate::client::Client
pub struct Server<T: ServerTransport> {
    transport: T,
    config: Config,
    pool: MessagePool,
    queue: EventQueue,
    connections: AHashMap<EndpointId, Connection>,
    /// Assigned client ID to endpoint, for connected clients only.
    clients: AHashMap<u16, EndpointId>,
    /// IDs not currently assigned, handed out lowest-first and returned to
    /// the back on disconnect.
    available_ids: VecDeque<u16>,
    /// Endpoints that were rejected, kept so repeat `Connect`s get the same
    /// answer instead of a fresh handshake; reaped on timeout.
    rejected: AHashMap<EndpointId, (RejectReason, Instant)>,
    handlers: AHashMap<u64, ServerHandler>,
    relay_filter: AHashSet<u64>,
    events: Vec<ServerEvent>,
    running: bool,
}

impl<T: ServerTransport> Server<T> {
    /// Creates a server over `transport` with default configuration.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, Config::default())
    }

    /// Creates a server over `transport` with the given configuration.
    #[must_use]
    pub fn with_config(transport: T, config: Config) -> Self {
        let pool = MessagePool::new(config.max_payload_size, config.instances_per_peer);
        let relay_filter = config.relay_filter.iter().copied().collect();
        Self {
            transport,
            pool,
            queue: EventQueue::default(),
            connections: AHashMap::new(),
            clients: AHashMap::new(),
            available_ids: (1..=config.max_client_count).collect(),
            rejected: AHashMap::new(),
            handlers: AHashMap::new(),
            relay_filter,
            events: Vec::new(),
            running: false,
            config,
        }
    }

    /// Registers the handler for one user message ID.
    ///
    /// # Errors
    ///
    /// Errors if the ID already has a handler.
    pub fn register_handler(
        &mut self,
        message_id: u64,
        handler: impl FnMut(u16, &mut Message) + 'static,
    ) -> Result<(), HandlerAlreadyRegistered> {
        match self.handlers.entry(message_id) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(HandlerAlreadyRegistered { message_id })
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    /// Starts listening on `port` and begins ticking.
    ///
    /// # Errors
    ///
    /// Errors if the transport cannot start listening.
    pub fn start(&mut self, port: u16) -> Result<(), T::Error> {
        self.transport.start(port)?;
        self.running = true;
        self.queue.schedule(
            Instant::now() + self.config.heartbeat_interval,
            DelayedEvent::Heartbeat,
        );
        debug!(port, "server started");
        Ok(())
    }

    /// Stops the server: every connected client gets a best-effort
    /// `Disconnect(ServerStopped)`, then the transport shuts down.
    pub fn stop(&mut self) {
        let endpoints: Vec<EndpointId> = self.connections.keys().copied().collect();
        for endpoint in endpoints {
            self.drop_connection(endpoint, DisconnectReason::ServerStopped, true, false);
        }
        self.queue.clear();
        self.rejected.clear();
        self.transport.shutdown();
        self.running = false;
        debug!("server stopped");
    }

    /// Whether [`Server::start`] has run without a matching [`Server::stop`].
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    /// Number of fully connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// IDs of all fully connected clients, in no particular order.
    pub fn client_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.clients.keys().copied()
    }

    /// The connection behind a client ID, if that client is connected.
    #[must_use]
    pub fn connection(&self, client_id: u16) -> Option<&Connection> {
        let endpoint = self.clients.get(&client_id)?;
        self.connections.get(endpoint)
    }

    /// Draws a message with the header for `mode` installed from this peer's
    /// pool.
    #[must_use]
    pub fn message(&mut self, mode: SendMode) -> Message {
        self.pool.acquire_mode(mode)
    }

    /// As [`Server::message`], with the varuint message ID appended.
    #[must_use]
    pub fn message_with_id(&mut self, mode: SendMode, id: u64) -> Message {
        let mut msg = self.pool.acquire_mode(mode);
        let _ = msg.add_varuint(id);
        msg
    }

    /// Returns a message drawn from [`Server::message`] that was not sent.
    pub fn release(&mut self, msg: Message) {
        self.pool.release(msg);
    }

    /// Sends a user message to one client, consuming it back into the pool.
    ///
    /// Returns the assigned sequence ID for reliable and notify sends,
    /// [`None`] for unreliable sends or an unknown client.
    pub fn send(&mut self, mut msg: Message, to: u16) -> Option<Seq> {
        let now = Instant::now();
        let Some(&endpoint) = self.clients.get(&to) else {
            warn!(to, "send to unknown client, dropping");
            self.pool.release(msg);
            return None;
        };
        let seq = self.send_on_connection(&mut msg, endpoint, now);
        self.pool.release(msg);
        seq
    }

    /// Sends a user message to every connected client, consuming it back into
    /// the pool.
    ///
    /// Unreliable broadcasts serialize once; reliable and notify broadcasts
    /// go through each connection's send path so every client gets its own
    /// sequence ID.
    pub fn broadcast(&mut self, msg: Message) {
        self.broadcast_except(msg, 0);
    }

    /// As [`Server::broadcast`], skipping the client with ID `except`.
    pub fn broadcast_except(&mut self, mut msg: Message, except: u16) {
        let now = Instant::now();
        let targets: Vec<EndpointId> = self
            .clients
            .iter()
            .filter(|(&id, _)| id != except)
            .map(|(_, &endpoint)| endpoint)
            .collect();

        if msg.send_mode() == Some(SendMode::Unreliable) {
            let payload = msg.to_wire();
            for endpoint in targets {
                if let Some(conn) = self.connections.get_mut(&endpoint) {
                    conn.metrics_mut().unreliable_sent += 1;
                    conn.metrics_mut().bytes_sent += payload.len() as u64;
                    self.transport.send(endpoint, &payload);
                }
            }
        } else {
            for endpoint in targets {
                let _ = self.send_on_connection(&mut msg, endpoint, now);
            }
        }
        self.pool.release(msg);
    }

    /// Kicks a connected client, attaching optional application payload to
    /// the `Disconnect(Kicked)` datagram.
    pub fn kick(&mut self, client_id: u16, payload: &[u8]) {
        let Some(&endpoint) = self.clients.get(&client_id) else {
            warn!(client_id, "kick of unknown client, ignoring");
            return;
        };
        let mut msg = self.pool.acquire_kind(HeaderKind::Disconnect);
        let _ = msg.add_u8(DisconnectReason::Kicked as u8);
        let _ = msg.add_bytes_without_len(payload);
        let wire = msg.to_wire();
        self.transport.send(endpoint, &wire);
        self.pool.release(msg);
        self.drop_connection(endpoint, DisconnectReason::Kicked, false, true);
    }

    /// Accepts a connection that surfaced as
    /// [`ServerEvent::ConnectionRequest`], assigning it a client ID and
    /// continuing the handshake.
    pub fn accept(&mut self, endpoint: EndpointId) {
        if self
            .connections
            .get(&endpoint)
            .is_some_and(|conn| conn.state() == ConnectionState::Pending)
        {
            let now = Instant::now();
            self.assign_and_welcome(endpoint, now);
        } else {
            warn!(?endpoint, "accept of endpoint not awaiting a decision");
        }
    }

    /// Rejects a connection that surfaced as
    /// [`ServerEvent::ConnectionRequest`]. A non-empty `payload` is carried
    /// to the client under [`RejectReason::Custom`].
    pub fn reject(&mut self, endpoint: EndpointId, payload: &[u8]) {
        if self
            .connections
            .get(&endpoint)
            .is_some_and(|conn| conn.state() == ConnectionState::Pending)
        {
            let reason = if payload.is_empty() {
                RejectReason::Rejected
            } else {
                RejectReason::Custom
            };
            self.connections.remove(&endpoint);
            self.send_reject(endpoint, reason, payload);
            self.rejected.insert(endpoint, (reason, Instant::now()));
        } else {
            warn!(?endpoint, "reject of endpoint not awaiting a decision");
        }
    }

    /// Runs one scheduler tick: fires due delayed events, polls the
    /// transport, dispatches every inbound datagram, and returns the events
    /// that surfaced.
    pub fn update(&mut self) -> Vec<ServerEvent> {
        let now = Instant::now();

        let mut due = Vec::new();
        while let Some(event) = self.queue.pop_due(now) {
            due.push(event);
        }
        for event in due {
            match event {
                DelayedEvent::Heartbeat => self.heartbeat_tick(now),
                DelayedEvent::Resend {
                    endpoint,
                    seq,
                    enqueued_at,
                } => self.run_retry(endpoint, seq, Some(enqueued_at), now),
            }
        }

        for event in self.transport.poll() {
            match event {
                // a connection only exists once a Connect datagram arrives
                TransportEvent::Connected { .. } | TransportEvent::ConnectionFailed { .. } => {}
                TransportEvent::DataReceived { endpoint, payload } => {
                    self.handle_datagram(endpoint, &payload, now);
                }
                TransportEvent::Disconnected { endpoint, cause } => {
                    if self.connections.contains_key(&endpoint) {
                        let reason = match cause {
                            LinkDrop::Closed => DisconnectReason::Disconnected,
                            LinkDrop::Error => DisconnectReason::TransportError,
                        };
                        self.drop_connection(endpoint, reason, false, true);
                    }
                }
            }
        }

        std::mem::take(&mut self.events)
    }

    //
    // scheduler internals
    //

    fn heartbeat_tick(&mut self, now: Instant) {
        let timeout = self.config.timeout;
        let mut timed_out = Vec::new();
        let mut handshake_expired = Vec::new();
        let mut probe = Vec::new();
        for (&endpoint, conn) in &self.connections {
            match conn.state() {
                ConnectionState::Connected => {
                    if now.saturating_duration_since(conn.last_heard()) > timeout {
                        timed_out.push(endpoint);
                    } else {
                        probe.push(endpoint);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Pending => {
                    if now.saturating_duration_since(conn.state_since()) > timeout {
                        handshake_expired.push(endpoint);
                    }
                }
                ConnectionState::NotConnected => {}
            }
        }

        for endpoint in timed_out {
            debug!(?endpoint, "client went silent");
            self.drop_connection(endpoint, DisconnectReason::TimedOut, false, true);
        }
        for endpoint in handshake_expired {
            debug!(?endpoint, "handshake never completed");
            self.drop_connection(endpoint, DisconnectReason::NeverConnected, false, false);
        }
        // the server probes on its own schedule, symmetric to the client;
        // each side only ever feeds its estimator round trips it timed itself
        for endpoint in probe {
            if let Some(conn) = self.connections.get_mut(&endpoint) {
                let ping_id = conn.begin_ping(now);
                let rtt_ms = conn.rtt().latest_ms();
                self.send_heartbeat(endpoint, ping_id, rtt_ms, false);
            }
        }
        self.rejected
            .retain(|_, (_, at)| now.saturating_duration_since(*at) <= timeout);

        if self.running {
            self.queue
                .schedule(now + self.config.heartbeat_interval, DelayedEvent::Heartbeat);
        }
    }

    fn run_retry(&mut self, endpoint: EndpointId, seq: Seq, enqueued_at: Option<Instant>, now: Instant) {
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return;
        };
        let outcome = conn.retry_send(seq, enqueued_at, now, self.config.max_send_attempts);
        let retry_at = now + conn.retry_delay();
        match outcome {
            Retry::Resend(payload) => {
                self.transport.send(endpoint, &payload);
                self.queue.schedule(
                    retry_at,
                    DelayedEvent::Resend {
                        endpoint,
                        seq,
                        enqueued_at: now,
                    },
                );
            }
            Retry::Defer(due) => {
                self.queue.schedule(
                    due,
                    DelayedEvent::Resend {
                        endpoint,
                        seq,
                        enqueued_at: now,
                    },
                );
            }
            Retry::Undeliverable => {
                if self.config.disconnect_on_poor_connection {
                    self.drop_connection(endpoint, DisconnectReason::PoorConnection, true, true);
                }
            }
            Retry::Cleared => {}
        }
    }

    //
    // inbound dispatch
    //

    fn handle_datagram(&mut self, endpoint: EndpointId, payload: &[u8], now: Instant) {
        let Some(mut msg) = self.pool.acquire_payload(payload) else {
            warn!(?endpoint, len = payload.len(), "discarding unparseable datagram");
            return;
        };
        if let Some(conn) = self.connections.get_mut(&endpoint) {
            conn.note_heard(now);
            conn.note_recv_bytes(payload.len());
        }

        match msg.kind() {
            HeaderKind::Connect => self.on_connect(endpoint, &mut msg, now),
            HeaderKind::Welcome => self.on_welcome_echo(endpoint, &mut msg, now),
            HeaderKind::Heartbeat => self.on_heartbeat(endpoint, &mut msg, now),
            HeaderKind::Disconnect => {
                let reason = DisconnectReason::from_u8(msg.get_u8())
                    .unwrap_or(DisconnectReason::Disconnected);
                if self.connections.contains_key(&endpoint) {
                    self.drop_connection(endpoint, reason, false, true);
                }
            }
            HeaderKind::Ack | HeaderKind::AckExtra => {
                let last = Seq(msg.get_u16());
                let bits = msg.get_u16();
                let extra = (msg.kind() == HeaderKind::AckExtra).then(|| Seq(msg.get_u16()));
                if let Some(conn) = self.connections.get_mut(&endpoint) {
                    let lost = conn.handle_ack(last, bits, extra);
                    for seq in lost {
                        self.run_retry(endpoint, seq, None, now);
                    }
                }
            }
            HeaderKind::Unreliable | HeaderKind::Reliable | HeaderKind::Notify => {
                self.on_user(endpoint, &mut msg, now);
            }
            HeaderKind::Reject | HeaderKind::ClientConnected | HeaderKind::ClientDisconnected => {
                warn!(?endpoint, kind = %msg.kind(), "unexpected datagram kind, discarding");
            }
        }
        self.pool.release(msg);
    }

    fn on_connect(&mut self, endpoint: EndpointId, msg: &mut Message, now: Instant) {
        if let Some(conn) = self.connections.get(&endpoint) {
            let (state, id) = (conn.state(), conn.id());
            match state {
                ConnectionState::Connecting if id != 0 => {
                    // our Welcome was lost; the client is still knocking
                    self.send_welcome(endpoint, id);
                }
                ConnectionState::Connecting => self.send_connect_ack(endpoint),
                ConnectionState::Pending => {
                    self.send_reject(endpoint, RejectReason::Pending, &[]);
                }
                ConnectionState::Connected => {
                    if self.config.reject_already_connected {
                        // never with a payload, to avoid leaking state about
                        // existing clients
                        self.send_reject(endpoint, RejectReason::AlreadyConnected, &[]);
                    }
                }
                ConnectionState::NotConnected => {}
            }
            return;
        }

        if let Some(&(reason, _)) = self.rejected.get(&endpoint) {
            self.send_reject(endpoint, reason, &[]);
            return;
        }

        if self.connections.len() >= usize::from(self.config.max_client_count) {
            debug!(?endpoint, "server full, rejecting");
            self.send_reject(endpoint, RejectReason::ServerFull, &[]);
            self.rejected
                .insert(endpoint, (RejectReason::ServerFull, now));
            return;
        }

        let payload_len = msg.unread_bits() as usize / 8;
        let payload = msg.get_bytes_amount(payload_len);
        debug!(?endpoint, payload_len, "connection opened");
        self.connections.insert(endpoint, Connection::new(endpoint, now));
        self.send_connect_ack(endpoint);

        if self.config.manual_accept {
            if let Some(conn) = self.connections.get_mut(&endpoint) {
                conn.set_state(ConnectionState::Pending, now);
            }
            self.send_reject(endpoint, RejectReason::Pending, &[]);
            self.events
                .push(ServerEvent::ConnectionRequest { endpoint, payload });
        } else {
            self.assign_and_welcome(endpoint, now);
        }
    }

    fn assign_and_welcome(&mut self, endpoint: EndpointId, now: Instant) {
        let Some(id) = self.available_ids.pop_front() else {
            debug!(?endpoint, "no client ids left, rejecting");
            self.connections.remove(&endpoint);
            self.send_reject(endpoint, RejectReason::ServerFull, &[]);
            self.rejected
                .insert(endpoint, (RejectReason::ServerFull, now));
            return;
        };
        if let Some(conn) = self.connections.get_mut(&endpoint) {
            conn.set_id(id);
            conn.set_state(ConnectionState::Connecting, now);
        }
        self.send_welcome(endpoint, id);
    }

    fn on_welcome_echo(&mut self, endpoint: EndpointId, msg: &mut Message, now: Instant) {
        let echoed = msg.get_u16();
        let payload_len = msg.unread_bits() as usize / 8;
        let payload = msg.get_bytes_amount(payload_len);
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return;
        };
        if conn.state() == ConnectionState::Connected {
            return;
        }
        let id = conn.id();
        if id == 0 || echoed != id {
            warn!(?endpoint, echoed, id, "welcome echo mismatch, ignoring");
            return;
        }

        conn.set_state(ConnectionState::Connected, now);
        self.clients.insert(id, endpoint);
        debug!(?endpoint, id, "client connected");
        self.events.push(ServerEvent::ClientConnected {
            client_id: id,
            payload,
        });
        self.announce(HeaderKind::ClientConnected, id);
    }

    fn on_heartbeat(&mut self, endpoint: EndpointId, msg: &mut Message, now: Instant) {
        let ping_id = msg.get_u8();
        // informational only; we trust no RTT we did not measure
        let _remote_rtt = msg.get_u16();
        let is_echo = msg.get_bool();
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return;
        };
        match conn.state() {
            ConnectionState::Connected => {
                if is_echo {
                    conn.complete_ping(ping_id, now);
                } else {
                    let rtt_ms = conn.rtt().latest_ms();
                    self.send_heartbeat(endpoint, ping_id, rtt_ms, true);
                }
            }
            ConnectionState::Connecting if conn.id() != 0 => {
                // the client thinks it is connected, so our Welcome arrived
                // but its echo got lost
                let id = conn.id();
                self.send_welcome(endpoint, id);
            }
            _ => {}
        }
    }

    fn on_user(&mut self, endpoint: EndpointId, msg: &mut Message, now: Instant) {
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            trace!(?endpoint, "user message from unknown endpoint, discarding");
            return;
        };
        if conn.state() != ConnectionState::Connected {
            trace!(?endpoint, "user message before handshake completed, discarding");
            return;
        }
        let client_id = conn.id();

        match msg.kind() {
            HeaderKind::Unreliable => {
                conn.metrics_mut().unreliable_recv += 1;
                msg.set_read_bit(SendMode::Unreliable.header_bits());
                self.dispatch(client_id, msg, now);
            }
            HeaderKind::Reliable => {
                let seq = Seq(msg.peek_bits(16, RELIABLE_SEQ_BIT) as u16);
                let decision = conn.receive_reliable(seq);
                let ack = conn.build_ack(seq, self.config.max_payload_size);
                // the ack always goes out, and before the handler runs
                self.transport.send(endpoint, &ack);
                if decision == RecvDecision::Handle {
                    msg.set_read_bit(SendMode::Reliable.header_bits());
                    self.dispatch(client_id, msg, now);
                }
            }
            HeaderKind::Notify => {
                let remote_last = Seq(msg.peek_bits(16, NOTIFY_LAST_RECV_BIT) as u16);
                let remote_bits = msg.peek_bits(8, NOTIFY_RECV_BITS_BIT) as u8;
                let seq = Seq(msg.peek_bits(16, NOTIFY_SEQ_BIT) as u16);

                for (resolved_seq, fate) in conn.handle_notify_ack(remote_last, remote_bits) {
                    self.events.push(match fate {
                        NotifyFate::Delivered => ServerEvent::NotifyDelivered {
                            client_id,
                            seq: resolved_seq,
                        },
                        NotifyFate::Lost => ServerEvent::NotifyLost {
                            client_id,
                            seq: resolved_seq,
                        },
                    });
                }
                if conn.receive_notify(seq) {
                    msg.set_read_bit(SendMode::Notify.header_bits());
                    self.dispatch(client_id, msg, now);
                }
            }
            // on_user is only called for user kinds
            _ => {}
        }
    }

    fn dispatch(&mut self, from: u16, msg: &mut Message, now: Instant) {
        let id = msg.get_varuint();
        if self.relay_filter.contains(&id) {
            self.relay(from, id, msg, now);
        } else if let Some(handler) = self.handlers.get_mut(&id) {
            handler(from, msg);
        } else {
            warn!(id, from, "no handler for message id, discarding");
        }
    }

    /// Forwards a relay-filtered message to every other client, preserving
    /// its mode, ID, and payload bits.
    fn relay(&mut self, from: u16, id: u64, msg: &Message, now: Instant) {
        let Some(mode) = msg.send_mode() else {
            return;
        };
        let body_start = msg.read_bit();
        let body_bits = msg.write_bit() - body_start;
        trace!(from, id, body_bits, "relaying");

        let targets: Vec<EndpointId> = self
            .clients
            .iter()
            .filter(|(&client_id, _)| client_id != from)
            .map(|(_, &endpoint)| endpoint)
            .collect();
        for endpoint in targets {
            let mut forward = self.pool.acquire_mode(mode);
            let _ = forward.add_varuint(id);
            let _ = forward.add_message(msg, body_bits, body_start);
            let _ = self.send_on_connection(&mut forward, endpoint, now);
            self.pool.release(forward);
        }
    }

    //
    // outbound helpers
    //

    fn send_on_connection(
        &mut self,
        msg: &mut Message,
        endpoint: EndpointId,
        now: Instant,
    ) -> Option<Seq> {
        let is_reliable = msg.send_mode() == Some(SendMode::Reliable);
        let Some(conn) = self.connections.get_mut(&endpoint) else {
            return None;
        };
        let prepared = conn.prepare_send(msg, now);
        let retry_at = now + conn.retry_delay();
        self.transport.send(endpoint, &prepared.payload);
        if is_reliable {
            if let Some(seq) = prepared.seq {
                self.queue.schedule(
                    retry_at,
                    DelayedEvent::Resend {
                        endpoint,
                        seq,
                        enqueued_at: now,
                    },
                );
            }
        }
        prepared.seq
    }

    fn send_connect_ack(&mut self, endpoint: EndpointId) {
        let msg = self.pool.acquire_kind(HeaderKind::Connect);
        self.transport.send(endpoint, &msg.to_wire());
        self.pool.release(msg);
    }

    fn send_welcome(&mut self, endpoint: EndpointId, id: u16) {
        let mut msg = self.pool.acquire_kind(HeaderKind::Welcome);
        let _ = msg.add_u16(id);
        self.transport.send(endpoint, &msg.to_wire());
        self.pool.release(msg);
    }

    /// Sends one heartbeat datagram: ping ID, our latest measured RTT, and
    /// the flag separating fresh probes from echoes.
    fn send_heartbeat(&mut self, endpoint: EndpointId, ping_id: u8, rtt_ms: u16, echo: bool) {
        let mut msg = self.pool.acquire_kind(HeaderKind::Heartbeat);
        let _ = msg.add_u8(ping_id);
        let _ = msg.add_u16(rtt_ms);
        let _ = msg.add_bool(echo);
        self.transport.send(endpoint, &msg.to_wire());
        self.pool.release(msg);
    }

    fn send_reject(&mut self, endpoint: EndpointId, reason: RejectReason, payload: &[u8]) {
        let mut msg = self.pool.acquire_kind(HeaderKind::Reject);
        let _ = msg.add_u8(reason as u8);
        if reason == RejectReason::Custom {
            let _ = msg.add_bytes_without_len(payload);
        }
        let wire = msg.to_wire();
        let repeats = if reason == RejectReason::Pending {
            1
        } else {
            REJECT_REPEATS
        };
        for _ in 0..repeats {
            self.transport.send(endpoint, &wire);
        }
        self.pool.release(msg);
    }

    /// Announces a client joining or leaving to every *other* connected
    /// client.
    fn announce(&mut self, kind: HeaderKind, about: u16) {
        let mut msg = self.pool.acquire_kind(kind);
        let _ = msg.add_u16(about);
        let wire = msg.to_wire();
        for (&client_id, &endpoint) in &self.clients {
            if client_id != about {
                self.transport.send(endpoint, &wire);
            }
        }
        self.pool.release(msg);
    }

    /// Removes a connection: clears its retransmission state, returns its ID
    /// to the pool, optionally tells the remote and the other clients, and
    /// emits the lifecycle event if the client had finished connecting.
    fn drop_connection(
        &mut self,
        endpoint: EndpointId,
        reason: DisconnectReason,
        notify_remote: bool,
        announce: bool,
    ) -> Option<u16> {
        let mut conn = self.connections.remove(&endpoint)?;
        conn.clear_pending();
        let id = conn.id();

        if notify_remote {
            let mut msg = self.pool.acquire_kind(HeaderKind::Disconnect);
            let _ = msg.add_u8(reason as u8);
            self.transport.send(endpoint, &msg.to_wire());
            self.pool.release(msg);
        }

        let was_connected = id != 0 && self.clients.remove(&id).is_some();
        if id != 0 {
            self.available_ids.push_back(id);
        }
        if was_connected {
            debug!(?endpoint, id, %reason, "client disconnected");
            self.events.push(ServerEvent::ClientDisconnected {
                client_id: id,
                reason,
            });
            if announce {
                self.announce(HeaderKind::ClientDisconnected, id);
            }
        }
        self.transport.close(endpoint);
        (id != 0).then_some(id)
    }
}
