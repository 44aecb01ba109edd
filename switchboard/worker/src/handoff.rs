//! Cache-service handoff channels
//!
//! A handoff channel is a link to an external key/value cache service that
//! is driven by the cache client's own callbacks rather than by socket
//! readiness. The client reports connect, disconnect and command results as
//! [`CacheEvent`]s through a [`CacheNotifier`], which also wakes the reactor
//! so the dispatcher can fold them into the ordinary channel lifecycle.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Instant;

use mio::Waker;
use tracing::{debug, warn};

use crate::channel::ChannelStatus;

/// Dispatcher-assigned id of one cache link
pub type LinkId = u64;

/// One command for the cache service, as its argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheCommand {
    pub args: Vec<Vec<u8>>,
}

impl CacheCommand {
    pub fn new<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        Self {
            args: args.into_iter().map(|a| a.as_ref().to_vec()).collect(),
        }
    }
}

/// A cache-service reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheReply {
    Nil,
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<CacheReply>),
}

/// Events produced by the cache client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Connected { link: LinkId },
    /// Connect failure or loss of an established link
    Disconnected { link: LinkId, reason: String },
    Reply { link: LinkId, reply: CacheReply },
}

/// Sending half handed to the cache client
#[derive(Clone)]
pub struct CacheNotifier {
    tx: Sender<CacheEvent>,
    waker: Arc<Waker>,
}

impl CacheNotifier {
    pub fn new(tx: Sender<CacheEvent>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Queue `event` for the reactor thread. Returns false once the
    /// dispatcher is gone.
    pub fn notify(&self, event: CacheEvent) -> bool {
        if self.tx.send(event).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake reactor: {}", e);
        }
        true
    }
}

/// The external asynchronous cache client.
///
/// Every call returns immediately; outcomes arrive later as [`CacheEvent`]s.
pub trait CacheClient {
    /// Called once when the client is installed on a dispatcher.
    fn attach(&mut self, notifier: CacheNotifier);

    fn connect(&mut self, link: LinkId, host: &str, port: u16) -> io::Result<()>;

    fn command(&mut self, link: LinkId, command: &CacheCommand) -> io::Result<()>;

    fn disconnect(&mut self, link: LinkId);
}

#[derive(Debug)]
pub struct HandoffChannel {
    link: LinkId,
    identity: String,
    status: ChannelStatus,
    pipeline: bool,
    last_active: Instant,
    /// Commands issued before the link came up, in order
    queued: Vec<CacheCommand>,
}

impl HandoffChannel {
    pub fn new(link: LinkId, identity: impl Into<String>, pipeline: bool) -> Self {
        Self {
            link,
            identity: identity.into(),
            status: ChannelStatus::TryConnect,
            pipeline,
            last_active: Instant::now(),
            queued: Vec::new(),
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn is_pipeline(&self) -> bool {
        self.pipeline
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn set_status(&mut self, next: ChannelStatus) -> bool {
        if next <= self.status {
            return false;
        }
        self.status = next;
        true
    }

    pub fn queue(&mut self, command: CacheCommand) {
        self.queued.push(command);
    }

    pub fn take_queued(&mut self) -> Vec<CacheCommand> {
        std::mem::take(&mut self.queued)
    }
}

/// Owning index of cache links, mirroring the socket registry.
#[derive(Debug, Default)]
pub struct HandoffSet {
    links: HashMap<LinkId, HandoffChannel>,
    named: HashMap<String, VecDeque<LinkId>>,
    next_link: LinkId,
}

impl HandoffSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_link(&mut self) -> LinkId {
        self.next_link += 1;
        self.next_link
    }

    pub fn insert(&mut self, channel: HandoffChannel) {
        self.links.insert(channel.link(), channel);
    }

    pub fn remove(&mut self, link: LinkId) -> Option<HandoffChannel> {
        let channel = self.links.remove(&link)?;
        self.named.retain(|_, links| {
            links.retain(|&l| l != link);
            !links.is_empty()
        });
        Some(channel)
    }

    pub fn get(&self, link: LinkId) -> Option<&HandoffChannel> {
        self.links.get(&link)
    }

    pub fn get_mut(&mut self, link: LinkId) -> Option<&mut HandoffChannel> {
        self.links.get_mut(&link)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    pub fn add_named(&mut self, identity: &str, link: LinkId) {
        let links = self.named.entry(identity.to_string()).or_default();
        if !links.contains(&link) {
            links.push_back(link);
        }
    }

    pub fn first_named(&mut self, identity: &str) -> Option<LinkId> {
        let links = self.named.get_mut(identity)?;
        while let Some(&link) = links.front() {
            if self.links.contains_key(&link) {
                return Some(link);
            }
            debug!(link, identity, "dropping stale cache link from named set");
            links.pop_front();
        }
        self.named.remove(identity);
        None
    }

    pub fn take_named(&mut self, identity: &str) -> Option<LinkId> {
        let link = self.first_named(identity)?;
        if let Some(links) = self.named.get_mut(identity) {
            links.retain(|&l| l != link);
            if links.is_empty() {
                self.named.remove(identity);
            }
        }
        Some(link)
    }
}
