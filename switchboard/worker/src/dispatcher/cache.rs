//! Cache-service links on the dispatcher
//!
//! Connect failures and disconnects reported by the client discard the link
//! like any socket channel. Nothing reconnects in the background: the next
//! command issued for an identity opens a fresh link.

use std::sync::mpsc::{self, Receiver, TryRecvError};

use tracing::{debug, info, warn};

use super::{Disconnect, Dispatcher, Notice};
use crate::actor::{ChannelClosed, ChannelRef};
use crate::channel::ChannelStatus;
use crate::error::{DispatchError, Result};
use crate::handoff::{CacheClient, CacheCommand, CacheEvent, CacheNotifier, HandoffChannel, HandoffSet, LinkId};
use crate::identity::Identity;
use crate::reactor::TimerKey;

#[derive(Default)]
pub(super) struct CacheState {
    client: Option<Box<dyn CacheClient>>,
    events: Option<Receiver<CacheEvent>>,
    pub(super) links: HandoffSet,
}

impl Dispatcher {
    /// Install the cache client. Its events wake the reactor.
    pub fn set_cache_client(&mut self, mut client: Box<dyn CacheClient>) -> Result<()> {
        let waker = self.reactor.waker()?;
        let (tx, rx) = mpsc::channel();
        client.attach(CacheNotifier::new(tx, waker));
        self.cache.client = Some(client);
        self.cache.events = Some(rx);
        Ok(())
    }

    pub fn cache_link_count(&self) -> usize {
        self.cache.links.len()
    }

    pub fn cache_link_status(&self, link: LinkId) -> Option<ChannelStatus> {
        self.cache.links.get(link).map(HandoffChannel::status)
    }

    /// Issue `command` to the cache service at `identity`.
    ///
    /// Pipelined links are reused; pooled links are consumed. With no usable
    /// link a new one is connected and the command waits for it.
    pub fn send_cache_command(&mut self, identity: &str, command: CacheCommand, pipeline: bool) -> Result<LinkId> {
        let parsed: Identity = identity.parse()?;
        if self.cache.client.is_none() {
            return Err(DispatchError::NoRoute(identity.to_string()));
        }

        let existing = if pipeline {
            self.cache.links.first_named(identity)
        } else {
            self.cache.links.take_named(identity)
        };
        if let Some(link) = existing {
            self.issue_cache_command(link, command)?;
            return Ok(link);
        }

        self.check_capacity()?;
        let link = self.cache.links.next_link();
        if let Some(client) = self.cache.client.as_mut() {
            client.connect(link, &parsed.host, parsed.port)?;
        }

        let mut channel = HandoffChannel::new(link, identity, pipeline);
        channel.queue(command);
        self.cache.links.insert(channel);
        if pipeline {
            self.cache.links.add_named(identity, link);
        }
        self.reactor
            .add_timer(TimerKey::Handoff(link), self.config.connect_timeout);
        self.stats.connects += 1;
        info!(link, identity, "connecting cache link");
        Ok(link)
    }

    /// Return a pooled cache link to its identity.
    pub fn add_named_cache_link(&mut self, identity: &str, link: LinkId) -> Result<()> {
        if self.cache.links.get(link).is_none() {
            return Err(DispatchError::NoRoute(identity.to_string()));
        }
        self.cache.links.add_named(identity, link);
        Ok(())
    }

    /// Close a cache link on request. An unknown link is a no-op.
    pub fn disconnect_cache_link(&mut self, link: LinkId) -> Disconnect {
        if self.cache.links.get(link).is_none() {
            return Disconnect::AlreadyClosed;
        }
        if let Some(client) = self.cache.client.as_mut() {
            client.disconnect(link);
        }
        self.discard_cache_link(link, ChannelStatus::Closed, "disconnect requested");
        Disconnect::Closed
    }

    fn issue_cache_command(&mut self, link: LinkId, command: CacheCommand) -> Result<()> {
        let Some(channel) = self.cache.links.get_mut(link) else {
            return Err(DispatchError::NoRoute(format!("cache link {}", link)));
        };
        if channel.status() == ChannelStatus::TryConnect {
            channel.queue(command);
            return Ok(());
        }
        channel.touch();

        let Some(client) = self.cache.client.as_mut() else {
            return Err(DispatchError::NoRoute(format!("cache link {}", link)));
        };
        if let Err(e) = client.command(link, &command) {
            let reason = format!("command failed: {}", e);
            client.disconnect(link);
            self.discard_cache_link(link, ChannelStatus::Error, &reason);
            return Err(e.into());
        }
        Ok(())
    }

    fn discard_cache_link(&mut self, link: LinkId, status: ChannelStatus, reason: &str) -> bool {
        let Some(mut channel) = self.cache.links.remove(link) else {
            return false;
        };
        channel.set_status(status);
        let reported = channel.status();
        self.reactor.cancel_timer(&TimerKey::Handoff(link));
        self.stats.discarded += 1;
        debug!(link, identity = channel.identity(), reason, "cache link discarded");

        self.notify(Notice::Closed(ChannelClosed {
            channel: ChannelRef::Cache(link),
            identity: Some(channel.identity().to_string()),
            status: reported,
            remote_addr: channel.identity().to_string(),
            reason: reason.to_string(),
        }));
        true
    }

    pub(super) fn handle_cache_timer(&mut self, link: LinkId) {
        let connecting = self
            .cache
            .links
            .get(link)
            .is_some_and(|channel| channel.status() == ChannelStatus::TryConnect);
        if !connecting {
            return;
        }
        warn!(link, "cache connect timed out");
        if let Some(client) = self.cache.client.as_mut() {
            client.disconnect(link);
        }
        self.discard_cache_link(link, ChannelStatus::Timeout, "connect timed out");
    }

    /// Fold pending client events into the link lifecycle.
    pub(super) fn drain_cache_events(&mut self) {
        loop {
            let Some(events) = &self.cache.events else {
                return;
            };
            let event = match events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    debug!("cache client dropped its notifier");
                    self.cache.events = None;
                    return;
                }
            };

            match event {
                CacheEvent::Connected { link } => self.on_cache_connected(link),
                CacheEvent::Disconnected { link, reason } => {
                    self.discard_cache_link(link, ChannelStatus::Error, &reason);
                }
                CacheEvent::Reply { link, reply } => {
                    let Some(channel) = self.cache.links.get_mut(link) else {
                        debug!(link, "reply for a discarded cache link");
                        continue;
                    };
                    channel.touch();
                    let identity = channel.identity().to_string();
                    self.notify(Notice::CacheReply(identity, reply));
                }
            }
        }
    }

    fn on_cache_connected(&mut self, link: LinkId) {
        let Some(channel) = self.cache.links.get_mut(link) else {
            return;
        };
        if !channel.set_status(ChannelStatus::Established) {
            return;
        }
        channel.touch();
        let queued = channel.take_queued();
        self.reactor.cancel_timer(&TimerKey::Handoff(link));
        info!(link, queued = queued.len(), "cache link established");

        for command in queued {
            if self.issue_cache_command(link, command).is_err() {
                break;
            }
        }
    }
}
