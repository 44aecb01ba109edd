//! Helpers shared by the dispatcher integration tests

#![allow(dead_code)]

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use switchboard_worker::handoff::CacheReply;
use switchboard_worker::{Actor, ChannelClosed, Dispatcher, DispatcherConfig, Envelope};

/// Everything an actor was told, in order
#[derive(Default)]
pub struct Seen {
    pub messages: Vec<(RawFd, Envelope)>,
    pub established: Vec<RawFd>,
    pub closed: Vec<ChannelClosed>,
    pub cache_replies: Vec<(String, CacheReply)>,
}

pub struct Recorder(pub Rc<RefCell<Seen>>);

impl Actor for Recorder {
    fn on_message(&mut self, _dispatcher: &mut Dispatcher, fd: RawFd, envelope: Envelope) {
        self.0.borrow_mut().messages.push((fd, envelope));
    }

    fn on_channel_established(&mut self, _dispatcher: &mut Dispatcher, fd: RawFd) {
        self.0.borrow_mut().established.push(fd);
    }

    fn on_channel_closed(&mut self, _dispatcher: &mut Dispatcher, closed: &ChannelClosed) {
        self.0.borrow_mut().closed.push(closed.clone());
    }

    fn on_cache_reply(&mut self, _dispatcher: &mut Dispatcher, identity: &str, reply: CacheReply) {
        self.0.borrow_mut().cache_replies.push((identity.to_string(), reply));
    }
}

/// Config without the report sink, so tests see only their own traffic
pub fn quiet_config() -> DispatcherConfig {
    DispatcherConfig {
        report_node_type: None,
        ..DispatcherConfig::default()
    }
}

pub fn recorded(config: DispatcherConfig) -> (Dispatcher, Rc<RefCell<Seen>>) {
    let _ = tracing_subscriber::fmt::try_init();
    let mut dispatcher = Dispatcher::new(config).expect("dispatcher");
    let seen = Rc::new(RefCell::new(Seen::default()));
    dispatcher.set_actor(Box::new(Recorder(seen.clone())));
    (dispatcher, seen)
}

/// Turn the loop until `done` holds, giving up after five seconds.
pub fn drive<F>(dispatcher: &mut Dispatcher, mut done: F) -> bool
where
    F: FnMut(&mut Dispatcher) -> bool,
{
    let give_up = Instant::now() + Duration::from_secs(5);
    loop {
        if done(dispatcher) {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        dispatcher
            .run_once(Some(Duration::from_millis(10)))
            .expect("reactor turn");
    }
}

/// `cmd`/`seq` of a received JSON line
pub fn head_of(line: &str) -> (i64, i64) {
    let value: serde_json::Value = serde_json::from_str(line).expect("json line");
    (
        value["cmd"].as_i64().expect("cmd"),
        value["seq"].as_i64().expect("seq"),
    )
}

pub fn message(seq: u32) -> Envelope {
    Envelope::message(100, seq, serde_json::json!({ "seq": seq }))
}
