//! Channel registry
//!
//! Three indices over the live channels of one worker:
//!
//! * fd → channel, the single owner of every [`Channel`]
//! * identity → ordered set of fds connected to that peer
//! * node type → ordered set of identities, with a round-robin cursor
//!
//! Secondary indices only ever hold fds or identity strings. A stale fd in a
//! named set is dropped on lookup instead of being dereferenced.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;

use tracing::debug;

use crate::channel::Channel;
use crate::error::{DispatchError, Result};

#[derive(Debug, Default)]
struct NodeGroup {
    identities: Vec<String>,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct Registry {
    channels: HashMap<RawFd, Channel>,
    named: HashMap<String, VecDeque<RawFd>>,
    node_types: HashMap<String, NodeGroup>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a channel. A second channel on the same fd is refused.
    pub fn insert(&mut self, channel: Channel) -> Result<()> {
        let fd = channel.fd();
        if self.channels.contains_key(&fd) {
            return Err(DispatchError::Capacity(format!("fd {} is already registered", fd)));
        }
        self.channels.insert(fd, channel);
        Ok(())
    }

    /// Drop the channel from every index and hand it back.
    pub fn remove(&mut self, fd: RawFd) -> Option<Channel> {
        let channel = self.channels.remove(&fd)?;
        self.named.retain(|_, fds| {
            fds.retain(|&f| f != fd);
            !fds.is_empty()
        });
        Some(channel)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Channel> {
        self.channels.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Channel> {
        self.channels.get_mut(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.channels.keys().copied().collect()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Record `fd` as a connection to `identity`, newest last.
    pub fn add_named(&mut self, identity: &str, fd: RawFd) {
        let fds = self.named.entry(identity.to_string()).or_default();
        if !fds.contains(&fd) {
            fds.push_back(fd);
        }
    }

    /// Forget `fd` under `identity`. Returns whether it was present.
    pub fn remove_named(&mut self, identity: &str, fd: RawFd) -> bool {
        let Some(fds) = self.named.get_mut(identity) else {
            return false;
        };
        let before = fds.len();
        fds.retain(|&f| f != fd);
        let removed = fds.len() != before;
        if fds.is_empty() {
            self.named.remove(identity);
        }
        removed
    }

    /// Oldest live fd for `identity`.
    pub fn first_named(&mut self, identity: &str) -> Option<RawFd> {
        let fds = self.named.get_mut(identity)?;
        while let Some(&fd) = fds.front() {
            if self.channels.contains_key(&fd) {
                return Some(fd);
            }
            debug!(fd, identity, "dropping stale fd from named set");
            fds.pop_front();
        }
        self.named.remove(identity);
        None
    }

    /// Remove and return the oldest live fd for `identity` (pooled use).
    pub fn take_named(&mut self, identity: &str) -> Option<RawFd> {
        let fd = self.first_named(identity)?;
        self.remove_named(identity, fd);
        Some(fd)
    }

    /// Drop the whole identity entry. Channels stay open.
    pub fn clear_named(&mut self, identity: &str) -> Vec<RawFd> {
        self.named
            .remove(identity)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn named_fds(&self, identity: &str) -> Vec<RawFd> {
        self.named
            .get(identity)
            .map(|fds| fds.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn named_count(&self, identity: &str) -> usize {
        self.named.get(identity).map_or(0, VecDeque::len)
    }

    /// Add `identity` to a node type. Order of insertion is routing order.
    pub fn add_node_identity(&mut self, node_type: &str, identity: &str) -> bool {
        let group = self.node_types.entry(node_type.to_string()).or_default();
        if group.identities.iter().any(|i| i == identity) {
            return false;
        }
        group.identities.push(identity.to_string());
        true
    }

    pub fn del_node_identity(&mut self, node_type: &str, identity: &str) -> bool {
        let Some(group) = self.node_types.get_mut(node_type) else {
            return false;
        };
        let before = group.identities.len();
        group.identities.retain(|i| i != identity);
        let removed = group.identities.len() != before;
        if group.identities.is_empty() {
            self.node_types.remove(node_type);
        }
        removed
    }

    pub fn is_node_type(&self, node_type: &str) -> bool {
        self.node_types.contains_key(node_type)
    }

    pub fn node_identities(&self, node_type: &str) -> Vec<String> {
        self.node_types
            .get(node_type)
            .map(|group| group.identities.clone())
            .unwrap_or_default()
    }

    /// Next identity of `node_type` in rotation.
    pub fn next_round_robin(&mut self, node_type: &str) -> Option<String> {
        let group = self.node_types.get_mut(node_type)?;
        if group.identities.is_empty() {
            return None;
        }
        let index = group.cursor % group.identities.len();
        group.cursor = group.cursor.wrapping_add(1);
        Some(group.identities[index].clone())
    }

    /// Identity of `node_type` selected by `factor`. Stable while membership is.
    pub fn oriented(&self, node_type: &str, factor: u64) -> Option<String> {
        let group = self.node_types.get(node_type)?;
        if group.identities.is_empty() {
            return None;
        }
        let index = (factor % group.identities.len() as u64) as usize;
        Some(group.identities[index].clone())
    }
}
