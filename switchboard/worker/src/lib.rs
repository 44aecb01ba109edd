//! Switchboard worker dispatch core
//!
//! Single-threaded connection dispatch for one worker process of a
//! multi-process network server: a mio reactor, channels with pluggable
//! codecs, identity-based routing, a connection flood guard and fd handoff
//! between sibling processes.

pub mod actor;
pub mod channel;
pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod fd_transfer;
pub mod flood;
pub mod handoff;
pub mod identity;
pub mod reactor;
pub mod registry;
pub mod structured_logging;
pub mod types;

pub use actor::{Actor, ChannelClosed, ChannelRef};
pub use channel::ChannelStatus;
pub use codec::{CodecKind, CodecStatus, Envelope};
pub use config::{DispatcherConfig, WorkerConfig};
pub use dispatcher::{DispatchStats, Disconnect, Dispatcher, ListenMode, SendOptions};
pub use error::{DispatchError, Result};
pub use identity::Identity;
