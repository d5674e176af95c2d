#![doc = include_str!("../README.md")]

mod client;
mod server;

pub use {client::ChannelClient, server::ChannelServer};

/// What to do with one outgoing datagram, as decided by a link's condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    /// Deliver normally.
    #[default]
    Pass,
    /// Silently drop.
    Drop,
    /// Deliver twice.
    Duplicate,
}

/// Per-datagram conditioning hook, called with each outgoing payload.
///
/// Lets tests inject loss and duplication into an otherwise perfect channel;
/// an unconditioned link passes everything.
pub type Condition = Box<dyn FnMut(&[u8]) -> Verdict>;

/// Errors from [`ChannelClient`] transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The link was already closed; make a fresh one to reconnect.
    #[error("link closed")]
    Closed,
    /// A connection attempt is already running or established.
    #[error("already active")]
    AlreadyActive,
}

pub(crate) fn copies_for(condition: &mut Option<Condition>, payload: &[u8]) -> usize {
    match condition.as_mut().map_or(Verdict::Pass, |f| f(payload)) {
        Verdict::Pass => 1,
        Verdict::Drop => 0,
        Verdict::Duplicate => 2,
    }
}
