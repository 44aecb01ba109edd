//! The per-worker dispatcher
//!
//! One [`Dispatcher`] owns the reactor, the channel registry, the flood guard
//! and every listener of a worker process. It turns reactor events into
//! channel reads and writes, applies codec statuses to reactor interest, and
//! hands decoded messages and lifecycle changes to the installed [`Actor`].
//!
//! Actor callbacks receive `&mut Dispatcher`, so the actor is taken out of
//! the dispatcher for the duration of a callback. Notifications raised while
//! it is out (a discard triggered by a reply, say) are queued and delivered
//! once the current callback returns.

mod cache;
mod routing;

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream, UnixStream};
use nix::sys::socket::AddressFamily;
use serde::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use tracing::{debug, info, trace, warn};

pub use routing::SendOptions;

use cache::CacheState;

use crate::actor::{Actor, ChannelClosed, ChannelRef};
use crate::channel::{Channel, ChannelStatus, Origin, Transport};
use crate::codec::{Codec, CodecKind, CodecStatus, Envelope};
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::fd_transfer::{self, FdHandoff};
use crate::flood::{Admission, FloodGuard};
use crate::handoff::CacheReply;
use crate::identity::Identity;
use crate::reactor::{Reactor, ReactorEvent, TimerKey};
use crate::registry::Registry;
use crate::types::Report;

/// What a listener does with accepted connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    /// Serve accepted connections in this process
    Local,
    /// Hand accepted connections to worker processes over their control links
    Transfer,
}

/// Counters kept for housekeeping reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub accepted: u64,
    pub flood_rejected: u64,
    pub capacity_rejected: u64,
    pub connects: u64,
    pub discarded: u64,
    pub transferred: u64,
}

/// Outcome of a disconnect request. Both outcomes are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    Closed,
    /// The channel was already gone
    AlreadyClosed,
}

pub type PeriodicTask = Box<dyn FnMut(&mut Dispatcher)>;
pub type SignalHandler = Box<dyn FnMut(&mut Dispatcher, i32)>;

struct ListenerEntry {
    listener: TcpListener,
    codec: CodecKind,
    mode: ListenMode,
}

enum Notice {
    Message(RawFd, Envelope),
    Established(RawFd),
    Closed(ChannelClosed),
    CacheReply(String, CacheReply),
}

pub struct Dispatcher {
    config: DispatcherConfig,
    reactor: Reactor,
    registry: Registry,
    flood: FloodGuard,
    listeners: HashMap<RawFd, ListenerEntry>,

    /// Acceptor side: links to the workers connections are handed to
    worker_links: Vec<StdUnixStream>,
    link_cursor: usize,

    /// Worker side: link the acceptor hands connections over
    control: Option<StdUnixStream>,

    cache: CacheState,

    actor: Option<Box<dyn Actor>>,
    actor_busy: bool,
    notices: VecDeque<Notice>,

    tasks: HashMap<u64, Option<PeriodicTask>>,
    next_task: u64,
    housekeeping: Option<u64>,
    signal_handlers: HashMap<i32, Option<SignalHandler>>,

    stats: DispatchStats,
    report_seq: u32,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let reactor = Reactor::new(config.events_capacity)?;
        let flood = FloodGuard::new(config.flood_threshold, config.flood_window);
        Ok(Self {
            config,
            reactor,
            registry: Registry::new(),
            flood,
            listeners: HashMap::new(),
            worker_links: Vec::new(),
            link_cursor: 0,
            control: None,
            cache: CacheState::default(),
            actor: None,
            actor_busy: false,
            notices: VecDeque::new(),
            tasks: HashMap::new(),
            next_task: 0,
            housekeeping: None,
            signal_handlers: HashMap::new(),
            stats: DispatchStats::default(),
            report_seq: 0,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn flood_guard(&self) -> &FloodGuard {
        &self.flood
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn set_actor(&mut self, actor: Box<dyn Actor>) {
        self.actor = Some(actor);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register the base signal handlers and the housekeeping task.
    ///
    /// Handlers already installed through [`Dispatcher::on_signal`] are kept.
    pub fn init(&mut self) -> Result<()> {
        for signum in [SIGTERM, SIGINT] {
            if !self.signal_handlers.contains_key(&signum) {
                self.on_signal(signum, |dispatcher, signum| {
                    info!(signum, "stopping on signal");
                    dispatcher.stop();
                })?;
            }
        }
        if !self.signal_handlers.contains_key(&SIGHUP) {
            self.on_signal(SIGHUP, |dispatcher, _| {
                info!(
                    connections = dispatcher.connection_count(),
                    clients = dispatcher.client_count(),
                    "SIGHUP received"
                );
            })?;
        }

        if self.housekeeping.is_none() {
            let interval = self.config.housekeeping_interval;
            self.housekeeping = Some(self.every(interval, |dispatcher| dispatcher.housekeeping()));
        }
        Ok(())
    }

    /// Run the loop until [`Dispatcher::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        self.reactor.start();
        info!(listeners = self.listeners.len(), "dispatcher running");
        while self.reactor.is_running() {
            self.run_once(None)?;
        }
        info!("dispatcher stopped");
        Ok(())
    }

    /// Wait once (at most `max_wait`) and handle everything that fired.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<usize> {
        let events = self.reactor.poll(max_wait)?;
        let count = events.len();
        for event in events {
            self.handle_event(event);
        }
        Ok(count)
    }

    pub fn stop(&mut self) {
        self.reactor.stop();
    }

    /// Run `task` every `interval` on the reactor thread. Returns its id.
    pub fn every<F>(&mut self, interval: Duration, task: F) -> u64
    where
        F: FnMut(&mut Dispatcher) + 'static,
    {
        self.next_task += 1;
        let id = self.next_task;
        self.tasks.insert(id, Some(Box::new(task)));
        self.reactor.add_periodic(TimerKey::Periodic(id), interval);
        id
    }

    pub fn cancel_periodic(&mut self, id: u64) -> bool {
        self.reactor.cancel_timer(&TimerKey::Periodic(id));
        if self.housekeeping == Some(id) {
            self.housekeeping = None;
        }
        self.tasks.remove(&id).is_some()
    }

    /// Route `signum` to `handler`, replacing any handler already installed.
    pub fn on_signal<F>(&mut self, signum: i32, handler: F) -> Result<()>
    where
        F: FnMut(&mut Dispatcher, i32) + 'static,
    {
        self.reactor.add_signal(signum)?;
        self.signal_handlers.insert(signum, Some(Box::new(handler)));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Listeners and adoption
    // ------------------------------------------------------------------

    /// Bind a non-blocking listener. Returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr, codec: CodecKind, mode: ListenMode) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let fd = listener.as_raw_fd();
        self.reactor.add_read(fd)?;
        self.listeners.insert(fd, ListenerEntry { listener, codec, mode });
        info!(%local, ?codec, ?mode, "listening");
        Ok(local)
    }

    /// Acceptor side: add a worker to hand `Transfer` connections to.
    ///
    /// A link whose worker falls behind is skipped, never waited on.
    pub fn add_worker_link(&mut self, link: StdUnixStream) -> Result<()> {
        link.set_nonblocking(true)?;
        debug!(link = link.as_raw_fd(), "worker link added");
        self.worker_links.push(link);
        Ok(())
    }

    /// Worker side: start receiving connections from the acceptor.
    pub fn attach_control(&mut self, control: StdUnixStream) -> Result<()> {
        control.set_nonblocking(true)?;
        self.reactor.add_read(control.as_raw_fd())?;
        debug!(control = control.as_raw_fd(), "control link attached");
        self.control = Some(control);
        Ok(())
    }

    /// Serve an already connected TCP stream as an inbound channel.
    pub fn adopt_tcp(&mut self, stream: StdTcpStream, codec: CodecKind) -> Result<RawFd> {
        self.check_capacity()?;
        stream.set_nonblocking(true)?;
        let remote = stream
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        self.adopt(Transport::Tcp(TcpStream::from_std(stream)), codec.build(), remote)
    }

    /// Serve an already connected Unix stream as an inbound channel.
    pub fn adopt_unix(&mut self, stream: StdUnixStream, codec: CodecKind) -> Result<RawFd> {
        self.check_capacity()?;
        stream.set_nonblocking(true)?;
        self.adopt(Transport::Unix(UnixStream::from_std(stream)), codec.build(), "unix".to_string())
    }

    fn adopt(&mut self, transport: Transport, codec: Box<dyn Codec>, remote_addr: String) -> Result<RawFd> {
        let fd = transport.as_raw_fd();
        self.registry.insert(Channel::inbound(transport, codec, remote_addr))?;
        if let Err(e) = self.reactor.add_read(fd) {
            self.registry.remove(fd);
            return Err(e.into());
        }
        self.arm_idle_timer(fd);
        self.stats.accepted += 1;
        debug!(fd, "channel adopted");
        self.notify(Notice::Established(fd));
        Ok(fd)
    }

    fn check_capacity(&mut self) -> Result<()> {
        let live = self.registry.len() + self.cache.links.len();
        if live >= self.config.max_connections {
            self.stats.capacity_rejected += 1;
            return Err(DispatchError::Capacity(format!(
                "{} live channels, limit {}",
                live, self.config.max_connections
            )));
        }
        Ok(())
    }

    fn arm_idle_timer(&mut self, fd: RawFd) {
        if let Some(idle) = self.config.idle_timeout {
            self.reactor.add_timer(TimerKey::Channel(fd), idle);
        }
    }

    // ------------------------------------------------------------------
    // Channel operations
    // ------------------------------------------------------------------

    /// Send on an existing channel and apply the resulting codec status.
    pub fn send_to(&mut self, fd: RawFd, envelope: &Envelope) -> Result<()> {
        let channel = self
            .registry
            .get_mut(fd)
            .ok_or(DispatchError::UnknownChannel(fd))?;
        let status = channel.send(envelope);
        self.apply_send_status(fd, status)
    }

    fn apply_send_status(&mut self, fd: RawFd, status: CodecStatus) -> Result<()> {
        match status {
            CodecStatus::Ok | CodecStatus::Incomplete => Ok(()),
            CodecStatus::Pause | CodecStatus::WantWrite => {
                self.reactor.add_write(fd)?;
                Ok(())
            }
            CodecStatus::WantRead => {
                self.reactor.cancel_write(fd)?;
                Ok(())
            }
            CodecStatus::Eof => {
                self.discard(fd, ChannelStatus::Closed, "closed after final write");
                Ok(())
            }
            CodecStatus::Error => {
                self.discard(fd, ChannelStatus::Error, "send failed");
                Err(DispatchError::Protocol {
                    fd,
                    reason: "send failed".to_string(),
                })
            }
        }
    }

    /// Close a channel on request. Closing an unknown or already discarded
    /// channel succeeds as a no-op.
    pub fn disconnect(&mut self, fd: RawFd) -> Disconnect {
        if self.discard(fd, ChannelStatus::Closed, "disconnect requested") {
            Disconnect::Closed
        } else {
            Disconnect::AlreadyClosed
        }
    }

    /// Remove a channel from every index, release its fd and tell the actor.
    fn discard(&mut self, fd: RawFd, status: ChannelStatus, reason: &str) -> bool {
        let Some(mut channel) = self.registry.remove(fd) else {
            trace!(fd, "discard of unknown channel ignored");
            return false;
        };
        channel.set_status(status);
        let reported = channel.status();
        channel.set_status(ChannelStatus::Closed);

        if let Err(e) = self.reactor.remove(fd) {
            warn!(fd, "failed to deregister channel: {}", e);
        }
        self.reactor.cancel_timer(&TimerKey::Channel(fd));

        let closed = ChannelClosed {
            channel: ChannelRef::Socket(fd),
            identity: channel.identity().map(str::to_string),
            status: reported,
            remote_addr: channel.remote_addr().to_string(),
            reason: reason.to_string(),
        };
        drop(channel);

        self.stats.discarded += 1;
        debug!(fd, identity = ?closed.identity, status = ?reported, reason, "channel discarded");
        self.notify(Notice::Closed(closed));
        true
    }

    /// Replace a channel's codec. Identity and registry membership are kept.
    pub fn switch_codec(&mut self, fd: RawFd, kind: CodecKind) -> Result<()> {
        let channel = self
            .registry
            .get_mut(fd)
            .ok_or(DispatchError::UnknownChannel(fd))?;
        channel.switch_codec(kind.build());
        Ok(())
    }

    /// Attach opaque actor-layer data to a channel.
    pub fn set_client_data(&mut self, fd: RawFd, data: impl Into<String>) -> Result<()> {
        let channel = self
            .registry
            .get_mut(fd)
            .ok_or(DispatchError::UnknownChannel(fd))?;
        channel.set_client_data(data);
        Ok(())
    }

    pub fn client_data(&self, fd: RawFd) -> Option<&str> {
        self.registry.get(fd).and_then(Channel::client_data)
    }

    /// Name an inbound channel and make it reachable by identity sends.
    pub fn set_channel_identity(&mut self, fd: RawFd, identity: &str) -> Result<()> {
        let parsed: Identity = identity.parse()?;
        let channel = self
            .registry
            .get_mut(fd)
            .ok_or(DispatchError::UnknownChannel(fd))?;
        channel.set_identity(identity);
        channel.set_remote_worker_index(parsed.worker_index);
        self.registry.add_named(identity, fd);
        Ok(())
    }

    /// Return a pooled channel to its identity's set.
    pub fn add_named_channel(&mut self, identity: &str, fd: RawFd) -> Result<()> {
        if !self.registry.contains(fd) {
            return Err(DispatchError::UnknownChannel(fd));
        }
        self.registry.add_named(identity, fd);
        Ok(())
    }

    /// Forget every channel indexed under `identity` without closing any.
    pub fn discard_named_channel(&mut self, identity: &str) -> usize {
        self.registry.clear_named(identity).len()
    }

    /// Close every channel indexed under `identity`.
    pub fn disconnect_identity(&mut self, identity: &str) -> usize {
        self.registry
            .named_fds(identity)
            .into_iter()
            .filter(|&fd| self.disconnect(fd) == Disconnect::Closed)
            .count()
    }

    pub fn add_node_identity(&mut self, node_type: &str, identity: &str) -> Result<bool> {
        identity.parse::<Identity>()?;
        Ok(self.registry.add_node_identity(node_type, identity))
    }

    pub fn del_node_identity(&mut self, node_type: &str, identity: &str) -> bool {
        self.registry.del_node_identity(node_type, identity)
    }

    pub fn is_node_type(&self, node_type: &str) -> bool {
        self.registry.is_node_type(node_type)
    }

    pub fn node_identities(&self, node_type: &str) -> Vec<String> {
        self.registry.node_identities(node_type)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn client_count(&self) -> usize {
        self.registry
            .channels()
            .filter(|channel| channel.origin() == Origin::Inbound)
            .count()
    }

    /// Snapshot of the counters as a report.
    pub fn stats_report(&self) -> Report {
        Report::new()
            .record("connections", vec![self.connection_count() as u64])
            .record("clients", vec![self.client_count() as u64])
            .record("cache_links", vec![self.cache.links.len() as u64])
            .record("accepted", vec![self.stats.accepted])
            .record("flood_rejected", vec![self.stats.flood_rejected])
            .record("capacity_rejected", vec![self.stats.capacity_rejected])
            .record("connects", vec![self.stats.connects])
            .record("discarded", vec![self.stats.discarded])
            .record("transferred", vec![self.stats.transferred])
    }

    fn housekeeping(&mut self) {
        debug!(
            connections = self.connection_count(),
            clients = self.client_count(),
            cache_links = self.cache.links.len(),
            flood_tracked = self.flood.tracked(),
            "housekeeping"
        );
        let has_sink = self
            .config
            .report_node_type
            .as_deref()
            .is_some_and(|node_type| self.registry.is_node_type(node_type));
        if has_sink {
            let report = self.stats_report();
            self.send_report(&report);
        }
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::Io { fd, readable, writable } => {
                if self.listeners.contains_key(&fd) {
                    self.accept_pending(fd);
                } else if self.control.as_ref().map(AsRawFd::as_raw_fd) == Some(fd) {
                    self.receive_handoffs();
                } else {
                    if readable && self.registry.contains(fd) {
                        self.handle_readable(fd);
                    }
                    if writable && self.registry.contains(fd) {
                        self.handle_writable(fd);
                    }
                }
            }
            ReactorEvent::Timer(key) => self.handle_timer(key),
            ReactorEvent::Signal(signum) => self.handle_signal(signum),
            ReactorEvent::Wake => self.drain_cache_events(),
        }
    }

    fn accept_pending(&mut self, listener_fd: RawFd) {
        loop {
            let Some(entry) = self.listeners.get(&listener_fd) else {
                return;
            };
            let (codec, mode) = (entry.codec, entry.mode);
            match entry.listener.accept() {
                Ok((stream, addr)) => self.on_accepted(stream, addr, codec, mode),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(listener = listener_fd, "accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr, codec: CodecKind, mode: ListenMode) {
        let source = addr.ip().to_string();
        let admission = self.flood.admit(&source, Instant::now());
        if self.flood.is_enabled() {
            self.reactor
                .refresh_timer(TimerKey::Flood(source.clone()), self.flood.window());
        }
        if admission == Admission::Rejected {
            self.stats.flood_rejected += 1;
            debug!(addr = %source, "connection rejected by flood guard");
            return;
        }

        match mode {
            ListenMode::Local => self.serve_accepted(stream, addr, codec),
            ListenMode::Transfer => self.transfer(stream, addr, codec),
        }
    }

    fn serve_accepted(&mut self, stream: TcpStream, addr: SocketAddr, codec: CodecKind) {
        if let Err(e) = self.check_capacity() {
            warn!(%addr, "refusing connection: {}", e);
            return;
        }
        if let Err(e) = self.adopt(Transport::Tcp(stream), codec.build(), addr.ip().to_string()) {
            warn!(%addr, "failed to adopt connection: {}", e);
        }
    }

    fn transfer(&mut self, stream: TcpStream, addr: SocketAddr, codec: CodecKind) {
        let family = if addr.is_ipv4() {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };

        let links = self.worker_links.len();
        for _ in 0..links {
            let index = self.link_cursor % links;
            self.link_cursor = self.link_cursor.wrapping_add(1);
            match fd_transfer::send_fd(&self.worker_links[index], stream.as_raw_fd(), family, codec) {
                Ok(()) => {
                    self.stats.transferred += 1;
                    debug!(%addr, link = index, "connection handed to worker");
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    debug!(link = index, "worker link full, trying the next one");
                }
                Err(e) => warn!(link = index, "fd handoff failed: {}", e),
            }
        }

        warn!(%addr, "no worker link took the connection, serving locally");
        self.serve_accepted(stream, addr, codec);
    }

    fn receive_handoffs(&mut self) {
        loop {
            let Some(control) = &self.control else {
                return;
            };
            match fd_transfer::recv_fd(control) {
                Ok(Some(handoff)) => {
                    if let Err(e) = self.adopt_handoff(handoff) {
                        warn!("failed to adopt handed-off connection: {}", e);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("control link failed: {}", e);
                    if let Some(control) = self.control.take() {
                        if let Err(e) = self.reactor.remove(control.as_raw_fd()) {
                            debug!("failed to deregister control link: {}", e);
                        }
                    }
                    return;
                }
            }
        }
    }

    fn adopt_handoff(&mut self, handoff: FdHandoff) -> Result<RawFd> {
        self.check_capacity()?;
        let codec = handoff.codec.build();
        match handoff.family {
            AddressFamily::Unix => {
                let stream = StdUnixStream::from(handoff.fd);
                stream.set_nonblocking(true)?;
                self.adopt(Transport::Unix(UnixStream::from_std(stream)), codec, "unix".to_string())
            }
            _ => {
                let stream = StdTcpStream::from(handoff.fd);
                stream.set_nonblocking(true)?;
                let remote = stream
                    .peer_addr()
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                self.adopt(Transport::Tcp(TcpStream::from_std(stream)), codec, remote)
            }
        }
    }

    fn handle_readable(&mut self, fd: RawFd) {
        let Some(channel) = self.registry.get_mut(fd) else {
            return;
        };
        let was_awaiting_read = channel.is_awaiting_read();
        let received = channel.recv();
        let resume_writes = was_awaiting_read && !channel.is_awaiting_read() && channel.has_pending_output();

        for envelope in received.envelopes {
            self.notify(Notice::Message(fd, envelope));
        }
        if !self.registry.contains(fd) {
            return;
        }

        if resume_writes {
            if let Err(e) = self.reactor.add_write(fd) {
                warn!(fd, "failed to resume writes: {}", e);
            }
        }

        match received.status {
            CodecStatus::Ok | CodecStatus::Incomplete => {}
            CodecStatus::Pause | CodecStatus::WantWrite => {
                if let Err(e) = self.reactor.add_write(fd) {
                    warn!(fd, "failed to register write interest: {}", e);
                }
            }
            CodecStatus::WantRead => {
                if let Err(e) = self.reactor.cancel_write(fd) {
                    warn!(fd, "failed to cancel write interest: {}", e);
                }
            }
            CodecStatus::Eof => {
                let pending = self.registry.get(fd).is_some_and(Channel::has_pending_output);
                if pending {
                    if let Some(channel) = self.registry.get_mut(fd) {
                        channel.mark_close_after_flush();
                    }
                    if let Err(e) = self.reactor.add_write(fd) {
                        warn!(fd, "failed to register write interest: {}", e);
                    }
                } else {
                    self.discard(fd, ChannelStatus::Closed, "protocol finished");
                }
            }
            CodecStatus::Error => {
                let reason = received.error.unwrap_or_else(|| "read failed".to_string());
                self.discard(fd, ChannelStatus::Error, &reason);
            }
        }
    }

    fn handle_writable(&mut self, fd: RawFd) {
        let Some(channel) = self.registry.get_mut(fd) else {
            return;
        };

        if channel.status() == ChannelStatus::TryConnect {
            match channel.finish_connect() {
                Ok(true) => {
                    channel.set_status(ChannelStatus::Established);
                    info!(fd, identity = ?channel.identity(), "connected");
                    self.reactor.cancel_timer(&TimerKey::Channel(fd));
                    self.arm_idle_timer(fd);
                    self.notify(Notice::Established(fd));
                }
                Ok(false) => return,
                Err(e) => {
                    let reason = format!("connect failed: {}", e);
                    self.discard(fd, ChannelStatus::Error, &reason);
                    return;
                }
            }
        }

        let Some(channel) = self.registry.get_mut(fd) else {
            return;
        };
        if channel.is_awaiting_read() {
            if let Err(e) = self.reactor.cancel_write(fd) {
                warn!(fd, "failed to cancel write interest: {}", e);
            }
            return;
        }

        match channel.flush() {
            CodecStatus::Ok => {
                if let Err(e) = self.reactor.cancel_write(fd) {
                    warn!(fd, "failed to cancel write interest: {}", e);
                }
            }
            CodecStatus::Eof => {
                self.discard(fd, ChannelStatus::Closed, "closed after flush");
            }
            CodecStatus::Error => {
                self.discard(fd, ChannelStatus::Error, "write failed");
            }
            _ => {}
        }
    }

    fn handle_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Channel(fd) => self.handle_channel_timer(fd),
            TimerKey::Handoff(link) => self.handle_cache_timer(link),
            TimerKey::Periodic(id) => self.run_periodic(id),
            TimerKey::Flood(addr) => {
                if let Some(left) = self.flood.expire(&addr, Instant::now()) {
                    self.reactor.add_timer(TimerKey::Flood(addr), left);
                }
            }
        }
    }

    fn handle_channel_timer(&mut self, fd: RawFd) {
        let Some(channel) = self.registry.get(fd) else {
            return;
        };
        match channel.status() {
            ChannelStatus::Init | ChannelStatus::TryConnect => {
                warn!(fd, identity = ?channel.identity(), "connect timed out");
                self.discard(fd, ChannelStatus::Timeout, "connect timed out");
            }
            ChannelStatus::Established => {
                let Some(idle) = self.config.idle_timeout else {
                    return;
                };
                let quiet = channel.last_active().elapsed();
                if quiet >= idle {
                    debug!(fd, "idle timeout");
                    self.discard(fd, ChannelStatus::Timeout, "idle timeout");
                } else {
                    self.reactor.add_timer(TimerKey::Channel(fd), idle - quiet);
                }
            }
            _ => {}
        }
    }

    fn run_periodic(&mut self, id: u64) {
        let Some(mut task) = self.tasks.get_mut(&id).and_then(Option::take) else {
            return;
        };
        task(self);
        if let Some(slot) = self.tasks.get_mut(&id) {
            if slot.is_none() {
                *slot = Some(task);
            }
        }
    }

    fn handle_signal(&mut self, signum: i32) {
        let Some(mut handler) = self.signal_handlers.get_mut(&signum).and_then(Option::take) else {
            debug!(signum, "signal without handler");
            return;
        };
        handler(self, signum);
        if let Some(slot) = self.signal_handlers.get_mut(&signum) {
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    // ------------------------------------------------------------------
    // Actor notifications
    // ------------------------------------------------------------------

    fn notify(&mut self, notice: Notice) {
        self.notices.push_back(notice);
        self.deliver_notices();
    }

    fn deliver_notices(&mut self) {
        if self.actor_busy {
            return;
        }
        let Some(mut actor) = self.actor.take() else {
            self.notices.clear();
            return;
        };

        self.actor_busy = true;
        while let Some(notice) = self.notices.pop_front() {
            match notice {
                Notice::Message(fd, envelope) => actor.on_message(self, fd, envelope),
                Notice::Established(fd) => actor.on_channel_established(self, fd),
                Notice::Closed(closed) => actor.on_channel_closed(self, &closed),
                Notice::CacheReply(identity, reply) => actor.on_cache_reply(self, &identity, reply),
            }
        }
        self.actor_busy = false;

        if self.actor.is_none() {
            self.actor = Some(actor);
        }
    }
}
