//! Wire-level header definitions.
//!
//! Every datagram starts with a 4-bit [`HeaderKind`] in the low nibble of the
//! first byte. The kind decides the fixed fields that follow it, and nothing
//! else in the payload is self-describing - see the per-kind layout table in
//! the crate docs. The numeric assignments below are a wire compatibility
//! concern and must never be reordered.

use std::fmt;

/// Number of bits occupied by the [`HeaderKind`] itself.
pub const KIND_BITS: u32 = 4;

/// Kind of a datagram, encoded in the low 4 bits of its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderKind {
    /// User message with no delivery guarantees.
    Unreliable = 0,
    /// Acknowledges the latest received reliable sequence ID.
    Ack = 1,
    /// [`HeaderKind::Ack`] plus an explicit sequence ID, used when the acked
    /// ID is not the latest received one.
    AckExtra = 2,
    /// Handshake opener, client to server; also the server's handshake ack.
    Connect = 3,
    /// Server refuses or defers a connection attempt.
    Reject = 4,
    /// Keep-alive and RTT probe.
    Heartbeat = 5,
    /// Either side tears down the connection.
    Disconnect = 6,
    /// Server assigns a client ID; client echoes it to finish the handshake.
    Welcome = 7,
    /// Server informs clients that another client joined.
    ClientConnected = 8,
    /// Server informs clients that another client left.
    ClientDisconnected = 9,
    /// User message retransmitted until acknowledged.
    Reliable = 10,
    /// User message with ordering and delivery-fate reporting, but no
    /// retransmission.
    Notify = 11,
}

impl HeaderKind {
    /// Decodes a kind from the low 4 bits of a datagram's first byte.
    ///
    /// Returns [`None`] for values outside the closed set, which callers must
    /// treat as "log and discard".
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::Unreliable,
            1 => Self::Ack,
            2 => Self::AckExtra,
            3 => Self::Connect,
            4 => Self::Reject,
            5 => Self::Heartbeat,
            6 => Self::Disconnect,
            7 => Self::Welcome,
            8 => Self::ClientConnected,
            9 => Self::ClientDisconnected,
            10 => Self::Reliable,
            11 => Self::Notify,
            _ => return None,
        })
    }

    /// Total header budget in bits for a datagram of this kind, including the
    /// 4 kind bits.
    ///
    /// User payload bits start at this offset for the three user-facing kinds;
    /// protocol kinds lay out their fixed fields directly after the kind bits.
    #[must_use]
    pub const fn header_bits(self) -> u32 {
        match self {
            // 4 + seq (16)
            Self::Reliable => KIND_BITS + 16,
            // 4 + last received notify seq (16) + received bitfield (8)
            // + seq (16)
            Self::Notify => KIND_BITS + 16 + 8 + 16,
            _ => KIND_BITS,
        }
    }

    /// Send mode this kind corresponds to, if it is a user-message kind.
    #[must_use]
    pub const fn send_mode(self) -> Option<SendMode> {
        Some(match self {
            Self::Unreliable => SendMode::Unreliable,
            Self::Reliable => SendMode::Reliable,
            Self::Notify => SendMode::Notify,
            _ => return None,
        })
    }
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Delivery guarantees of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendMode {
    /// Fire and forget - may be lost, duplicated, or reordered.
    Unreliable,
    /// Retransmitted until acknowledged; delivered exactly once, in no
    /// particular order.
    Reliable,
    /// Never retransmitted, delivered strictly in order, and the sender is
    /// told the fate of each message.
    Notify,
}

impl SendMode {
    /// Header kind a user message of this mode is sent under.
    #[must_use]
    pub const fn header_kind(self) -> HeaderKind {
        match self {
            Self::Unreliable => HeaderKind::Unreliable,
            Self::Reliable => HeaderKind::Reliable,
            Self::Notify => HeaderKind::Notify,
        }
    }

    /// Header budget in bits for this mode.
    #[must_use]
    pub const fn header_bits(self) -> u32 {
        self.header_kind().header_bits()
    }
}

/// Why a server refused a connection attempt.
///
/// Sent as an 8-bit field in [`HeaderKind::Reject`] datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    /// No response from the server at all; attempts were exhausted.
    NoConnection = 0,
    /// This endpoint already has a live connection.
    AlreadyConnected = 1,
    /// The server has deferred the decision to the application; keep waiting.
    Pending = 2,
    /// The server is at `max_client_count`.
    ServerFull = 3,
    /// The application's accept gate said no.
    Rejected = 4,
    /// The application's accept gate said no and attached a payload.
    Custom = 5,
}

impl RejectReason {
    /// Decodes from the 8-bit wire field.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::NoConnection,
            1 => Self::AlreadyConnected,
            2 => Self::Pending,
            3 => Self::ServerFull,
            4 => Self::Rejected,
            5 => Self::Custom,
            _ => return None,
        })
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a connection ended.
///
/// Sent as an 8-bit field in [`HeaderKind::Disconnect`] datagrams, and carried
/// on every locally-raised disconnect event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// The handshake never completed.
    NeverConnected = 0,
    /// The server rejected the connection attempt.
    ConnectionRejected = 1,
    /// The underlying transport failed.
    TransportError = 2,
    /// No heartbeat within the timeout window.
    TimedOut = 3,
    /// The server kicked this client.
    Kicked = 4,
    /// The server shut down.
    ServerStopped = 5,
    /// The peer disconnected deliberately.
    Disconnected = 6,
    /// A reliable message exceeded its send attempts.
    PoorConnection = 7,
}

impl DisconnectReason {
    /// Decodes from the 8-bit wire field.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::NeverConnected,
            1 => Self::ConnectionRejected,
            2 => Self::TransportError,
            3 => Self::TimedOut,
            4 => Self::Kicked,
            5 => Self::ServerStopped,
            6 => Self::Disconnected,
            7 => Self::PoorConnection,
            _ => return None,
        })
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
