//! Error taxonomy of the dispatch core
//!
//! Socket and protocol failures stay local to one channel: the dispatcher
//! discards the channel and reports it to the actor layer. The variants here
//! are what public entry points hand back to their caller.

use std::os::fd::RawFd;
use thiserror::Error;

use crate::actor::ChannelRef;

/// Errors surfaced by dispatcher entry points
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("failed to resolve {host}:{port}: {reason}")]
    Resolution {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("protocol error on channel {fd}: {reason}")]
    Protocol { fd: RawFd, reason: String },

    #[error("{channel} timed out")]
    Timeout { channel: ChannelRef },

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("invalid identity {identity:?}: {reason}")]
    Config { identity: String, reason: String },

    #[error("channel {0} is not registered")]
    UnknownChannel(RawFd),

    #[error("no identity registered under node type {0:?}")]
    NoRoute(String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
