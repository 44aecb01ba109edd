//! Cache-service links driven by a scripted client

mod common;

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{drive, quiet_config, recorded};
use switchboard_worker::handoff::{CacheClient, CacheCommand, CacheEvent, CacheNotifier, CacheReply, LinkId};
use switchboard_worker::{ChannelRef, ChannelStatus, Disconnect, DispatchError, DispatcherConfig};

const CACHE: &str = "127.0.0.1:6379";

#[derive(Default)]
struct CacheLog {
    notifier: Option<CacheNotifier>,
    connects: Vec<(LinkId, String, u16)>,
    commands: Vec<(LinkId, CacheCommand)>,
    disconnects: Vec<LinkId>,
}

/// Answers every command with `+OK`; connects at once when `auto_connect`.
struct FakeCache {
    log: Rc<RefCell<CacheLog>>,
    auto_connect: bool,
}

impl FakeCache {
    fn install(auto_connect: bool) -> (Box<dyn CacheClient>, Rc<RefCell<CacheLog>>) {
        let log = Rc::new(RefCell::new(CacheLog::default()));
        let client = FakeCache {
            log: log.clone(),
            auto_connect,
        };
        (Box::new(client), log)
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(notifier) = &self.log.borrow().notifier {
            notifier.notify(event);
        }
    }
}

impl CacheClient for FakeCache {
    fn attach(&mut self, notifier: CacheNotifier) {
        self.log.borrow_mut().notifier = Some(notifier);
    }

    fn connect(&mut self, link: LinkId, host: &str, port: u16) -> io::Result<()> {
        self.log.borrow_mut().connects.push((link, host.to_string(), port));
        if self.auto_connect {
            self.emit(CacheEvent::Connected { link });
        }
        Ok(())
    }

    fn command(&mut self, link: LinkId, command: &CacheCommand) -> io::Result<()> {
        self.log.borrow_mut().commands.push((link, command.clone()));
        self.emit(CacheEvent::Reply {
            link,
            reply: CacheReply::Status("OK".to_string()),
        });
        Ok(())
    }

    fn disconnect(&mut self, link: LinkId) {
        self.log.borrow_mut().disconnects.push(link);
    }
}

fn set(key: &str) -> CacheCommand {
    CacheCommand::new(["SET", key, "1"])
}

#[test]
fn test_command_waits_for_connect_then_replies() {
    let (mut dispatcher, seen) = recorded(quiet_config());
    let (client, log) = FakeCache::install(true);
    dispatcher.set_cache_client(client).unwrap();

    let link = dispatcher.send_cache_command(CACHE, set("a"), true).unwrap();
    assert_eq!(dispatcher.cache_link_status(link), Some(ChannelStatus::TryConnect));
    assert_eq!(log.borrow().connects, vec![(link, "127.0.0.1".to_string(), 6379)]);
    assert!(log.borrow().commands.is_empty());

    assert!(drive(&mut dispatcher, |_| seen.borrow().cache_replies.len() == 1));
    assert_eq!(dispatcher.cache_link_status(link), Some(ChannelStatus::Established));
    assert_eq!(log.borrow().commands, vec![(link, set("a"))]);
    assert_eq!(
        seen.borrow().cache_replies[0],
        (CACHE.to_string(), CacheReply::Status("OK".to_string()))
    );

    // pipelined: the established link carries the next command directly
    let again = dispatcher.send_cache_command(CACHE, set("b"), true).unwrap();
    assert_eq!(again, link);
    assert_eq!(log.borrow().connects.len(), 1);
    assert_eq!(log.borrow().commands.len(), 2);
    assert!(drive(&mut dispatcher, |_| seen.borrow().cache_replies.len() == 2));
}

#[test]
fn test_pooled_link_is_consumed_until_returned() {
    let (mut dispatcher, _seen) = recorded(quiet_config());
    let (client, log) = FakeCache::install(true);
    dispatcher.set_cache_client(client).unwrap();

    let first = dispatcher.send_cache_command(CACHE, set("a"), false).unwrap();
    assert!(drive(&mut dispatcher, |d| {
        d.cache_link_status(first) == Some(ChannelStatus::Established)
    }));

    let second = dispatcher.send_cache_command(CACHE, set("b"), false).unwrap();
    assert_ne!(first, second);
    assert_eq!(log.borrow().connects.len(), 2);

    dispatcher.add_named_cache_link(CACHE, first).unwrap();
    let third = dispatcher.send_cache_command(CACHE, set("c"), false).unwrap();
    assert_eq!(third, first);
    assert_eq!(log.borrow().connects.len(), 2);
    assert_eq!(dispatcher.cache_link_count(), 2);
}

#[test]
fn test_connect_timeout_discards_without_retry() {
    let config = DispatcherConfig {
        connect_timeout: Duration::from_millis(50),
        ..quiet_config()
    };
    let (mut dispatcher, seen) = recorded(config);
    let (client, log) = FakeCache::install(false);
    dispatcher.set_cache_client(client).unwrap();

    let link = dispatcher.send_cache_command(CACHE, set("a"), true).unwrap();
    assert!(drive(&mut dispatcher, |_| !seen.borrow().closed.is_empty()));

    {
        let seen = seen.borrow();
        let closed = &seen.closed[0];
        assert_eq!(closed.channel, ChannelRef::Cache(link));
        assert_eq!(closed.status, ChannelStatus::Timeout);
        assert_eq!(closed.identity.as_deref(), Some(CACHE));
        assert!(matches!(closed.error(), Some(DispatchError::Timeout { .. })));
    }
    assert_eq!(log.borrow().disconnects, vec![link]);
    assert_eq!(dispatcher.cache_link_count(), 0);
    assert!(log.borrow().commands.is_empty());

    let settle = Instant::now() + Duration::from_millis(150);
    drive(&mut dispatcher, |_| Instant::now() >= settle);
    assert_eq!(log.borrow().connects.len(), 1);
    assert_eq!(seen.borrow().closed.len(), 1);
}

#[test]
fn test_lost_link_is_discarded_as_error() {
    let (mut dispatcher, seen) = recorded(quiet_config());
    let (client, log) = FakeCache::install(true);
    dispatcher.set_cache_client(client).unwrap();

    let link = dispatcher.send_cache_command(CACHE, set("a"), true).unwrap();
    assert!(drive(&mut dispatcher, |d| {
        d.cache_link_status(link) == Some(ChannelStatus::Established)
    }));

    let notifier = log.borrow().notifier.clone().unwrap();
    notifier.notify(CacheEvent::Disconnected {
        link,
        reason: "connection reset".to_string(),
    });
    assert!(drive(&mut dispatcher, |_| !seen.borrow().closed.is_empty()));

    let seen = seen.borrow();
    assert_eq!(seen.closed[0].channel, ChannelRef::Cache(link));
    assert_eq!(seen.closed[0].status, ChannelStatus::Error);
    assert_eq!(seen.closed[0].reason, "connection reset");
    assert_eq!(dispatcher.cache_link_count(), 0);
}

#[test]
fn test_requested_disconnect_closes_link_once() {
    let (mut dispatcher, seen) = recorded(quiet_config());
    let (client, log) = FakeCache::install(true);
    dispatcher.set_cache_client(client).unwrap();

    let link = dispatcher.send_cache_command(CACHE, set("a"), true).unwrap();
    assert!(drive(&mut dispatcher, |d| {
        d.cache_link_status(link) == Some(ChannelStatus::Established)
    }));

    assert_eq!(dispatcher.disconnect_cache_link(link), Disconnect::Closed);
    assert_eq!(dispatcher.disconnect_cache_link(link), Disconnect::AlreadyClosed);
    assert_eq!(log.borrow().disconnects, vec![link]);
    assert_eq!(dispatcher.cache_link_status(link), None);
    assert_eq!(dispatcher.cache_link_count(), 0);

    let seen = seen.borrow();
    assert_eq!(seen.closed.len(), 1);
    assert_eq!(seen.closed[0].channel, ChannelRef::Cache(link));
    assert_eq!(seen.closed[0].status, ChannelStatus::Closed);
    assert!(seen.closed[0].error().is_none());
}

#[test]
fn test_commands_need_a_client() {
    let (mut dispatcher, _seen) = recorded(quiet_config());
    assert!(matches!(
        dispatcher.send_cache_command(CACHE, set("a"), true),
        Err(DispatchError::NoRoute(_))
    ));
    assert!(matches!(
        dispatcher.send_cache_command("not-an-identity", set("a"), true),
        Err(DispatchError::Config { .. })
    ));
}
