//! See [`Config`].

use web_time::Duration;

use crate::msg::DEFAULT_MAX_PAYLOAD;

/// Construction-time configuration for a [`Server`] or [`Client`].
///
/// All values are fixed once the peer exists - in particular
/// [`Config::max_payload_size`] decides the capacity of every message buffer
/// the peer's pool hands out, so changing it mid-flight would corrupt the
/// wire format.
///
/// [`Server`]: crate::server::Server
/// [`Client`]: crate::client::Client
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum bytes of payload per datagram, including the header.
    pub max_payload_size: usize,
    /// Message buffers pre-allocated in the peer's pool.
    pub instances_per_peer: usize,
    /// Time without hearing from the remote before a connected peer is
    /// considered gone.
    pub timeout: Duration,
    /// Interval between heartbeat ticks.
    pub heartbeat_interval: Duration,
    /// `Connect` datagrams a client sends before giving up.
    pub max_connection_attempts: u32,
    /// Send attempts per reliable message before it is undeliverable.
    pub max_send_attempts: u32,
    /// Server capacity; must be at most `u16::MAX - 1` since client ID 0 is
    /// reserved for "unassigned".
    pub max_client_count: u16,
    /// Message IDs the server forwards to all other clients instead of
    /// dispatching locally.
    pub relay_filter: Vec<u64>,
    /// Whether a `Connect` from an already-connected endpoint gets an
    /// explicit `Reject(AlreadyConnected)`, or is silently ignored to avoid
    /// leaking which endpoints hold connections.
    pub reject_already_connected: bool,
    /// Whether exhausting [`Config::max_send_attempts`] closes the connection
    /// with reason `PoorConnection`, or only logs.
    pub disconnect_on_poor_connection: bool,
    /// Whether inbound connections wait for an explicit
    /// [`Server::accept`]/[`Server::reject`] instead of being accepted
    /// automatically.
    ///
    /// [`Server::accept`]: crate::server::Server::accept
    /// [`Server::reject`]: crate::server::Server::reject
    pub manual_accept: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            instances_per_peer: 4,
            timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(1000),
            max_connection_attempts: 5,
            max_send_attempts: 15,
            max_client_count: 32,
            relay_filter: Vec::new(),
            reject_already_connected: true,
            disconnect_on_poor_connection: true,
            manual_accept: false,
        }
    }
}
