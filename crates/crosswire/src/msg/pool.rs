//! See [`MessagePool`].

use crate::header::{HeaderKind, SendMode};

use super::Message;

/// Recycles [`Message`] buffers so the steady-state send/receive path does
/// not allocate.
///
/// Each peer owns one pool, created with its configured maximum payload size;
/// every message drawn from it therefore has the same capacity. Releasing a
/// message moves it back by value, so a buffer can never end up in the pool
/// twice - the type system enforces the release-once rule.
#[derive(Debug)]
pub struct MessagePool {
    capacity: usize,
    free: Vec<Message>,
}

impl MessagePool {
    /// Creates a pool whose messages hold `capacity` bytes of payload,
    /// pre-filled with `instances` buffers.
    #[must_use]
    pub fn new(capacity: usize, instances: usize) -> Self {
        Self {
            capacity,
            free: (0..instances).map(|_| Message::create(capacity)).collect(),
        }
    }

    /// Payload capacity in bytes of every message in this pool.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently sitting in the pool.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Takes a blank message with no header installed.
    #[must_use]
    pub fn acquire(&mut self) -> Message {
        self.free
            .pop()
            .unwrap_or_else(|| Message::create(self.capacity))
    }

    /// Takes a message with the header for `mode` installed.
    #[must_use]
    pub fn acquire_mode(&mut self, mode: SendMode) -> Message {
        self.acquire_kind(mode.header_kind())
    }

    /// Takes a message carrying a protocol datagram of the given kind.
    #[must_use]
    pub fn acquire_kind(&mut self, kind: HeaderKind) -> Message {
        let mut msg = self.acquire();
        msg.init_kind(kind);
        msg
    }

    /// Takes a message loaded from an inbound datagram, or [`None`] (with the
    /// buffer staying pooled) if the payload is not a valid datagram.
    pub(crate) fn acquire_payload(&mut self, payload: &[u8]) -> Option<Message> {
        let mut msg = self.acquire();
        if msg.fill_from(payload) {
            Some(msg)
        } else {
            self.release(msg);
            None
        }
    }

    /// Returns a message's buffer to the pool.
    ///
    /// The message is consumed, so releasing the same instance twice is a
    /// compile error rather than a runtime hazard.
    pub fn release(&mut self, mut msg: Message) {
        if msg.max_bits() as usize != self.capacity * 8 {
            // foreign buffer; dropping it is fine
            return;
        }
        msg.reset();
        self.free.push(msg);
    }
}
