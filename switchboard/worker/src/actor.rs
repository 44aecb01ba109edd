//! Boundary to the actor layer
//!
//! The dispatcher never interprets messages. It hands every decoded envelope
//! and every lifecycle change to one [`Actor`], which may route replies
//! through the `&mut Dispatcher` it is given.

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use crate::channel::ChannelStatus;
use crate::codec::Envelope;
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::handoff::{CacheReply, LinkId};

/// Which kind of channel a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRef {
    Socket(RawFd),
    Cache(LinkId),
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Socket(fd) => write!(f, "channel {}", fd),
            ChannelRef::Cache(link) => write!(f, "cache link {}", link),
        }
    }
}

/// Notification emitted exactly once per discarded channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosed {
    pub channel: ChannelRef,
    pub identity: Option<String>,
    /// Status the channel was in when discarded (`Timeout`, `Error` or `Closed`)
    pub status: ChannelStatus,
    pub remote_addr: String,
    pub reason: String,
}

impl ChannelClosed {
    /// The failure behind this discard, `None` when it was a requested close.
    pub fn error(&self) -> Option<DispatchError> {
        match self.status {
            ChannelStatus::Timeout => Some(DispatchError::Timeout { channel: self.channel }),
            ChannelStatus::Error => Some(DispatchError::Socket(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                self.reason.clone(),
            ))),
            _ => None,
        }
    }
}

pub trait Actor {
    /// A decoded message arrived on `fd`.
    fn on_message(&mut self, dispatcher: &mut Dispatcher, fd: RawFd, envelope: Envelope);

    /// An outbound connect completed, or an inbound channel was adopted.
    fn on_channel_established(&mut self, _dispatcher: &mut Dispatcher, _fd: RawFd) {}

    /// A channel left the registry. Pending requests correlated with it can
    /// be dropped.
    fn on_channel_closed(&mut self, _dispatcher: &mut Dispatcher, _closed: &ChannelClosed) {}

    /// The cache service answered a command issued under `identity`.
    fn on_cache_reply(&mut self, _dispatcher: &mut Dispatcher, _identity: &str, _reply: CacheReply) {}
}
