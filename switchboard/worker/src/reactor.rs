//! Single-threaded event reactor
//!
//! Wraps a [`mio::Poll`] and turns OS readiness, expired timers, delivered
//! signals and cross-thread wakeups into a flat list of [`ReactorEvent`]s.
//! The dispatcher handles them one at a time, so no two handlers ever
//! overlap. The only blocking point is [`Reactor::poll`], bounded by the
//! nearest pending timer.
//!
//! Interest is tracked per file descriptor. Adding an interest that is
//! already registered is a no-op, which is what keeps repeated `WantWrite`
//! statuses from re-registering the same fd.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use signal_hook_mio::v1_0::Signals;
use tracing::{debug, trace};

// mio reserves usize::MAX
const SIGNAL_TOKEN: Token = Token(usize::MAX - 1);
const WAKE_TOKEN: Token = Token(usize::MAX - 2);

/// Smallest interval a periodic task may be scheduled with
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// What a timer is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Connect or idle timeout of a socket channel
    Channel(RawFd),
    /// Connect timeout of a cache-service link
    Handoff(u64),
    /// Recurring task registered through [`Reactor::add_periodic`]
    Periodic(u64),
    /// Expiry of a flood-guard entry for a source address
    Flood(String),
}

/// One unit of work for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent {
    Io {
        fd: RawFd,
        readable: bool,
        writable: bool,
    },
    Timer(TimerKey),
    Signal(i32),
    Wake,
}

pub struct Reactor {
    poll: Poll,
    events: Events,

    /// Interest currently registered with the poller, per fd
    interests: HashMap<RawFd, Interest>,

    /// Pending timers ordered by deadline, then by registration order
    timers: BTreeMap<(Instant, u64), TimerKey>,
    timer_index: HashMap<TimerKey, (Instant, u64)>,
    timer_seq: u64,

    /// Re-arm intervals of periodic timers
    periodic: HashMap<TimerKey, Duration>,

    signals: Option<Signals>,
    waker: Option<Arc<Waker>>,
    running: bool,

    /// Number of register/reregister/deregister calls issued to the poller
    interest_updates: u64,
}

impl Reactor {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            interests: HashMap::new(),
            timers: BTreeMap::new(),
            timer_index: HashMap::new(),
            timer_seq: 0,
            periodic: HashMap::new(),
            signals: None,
            waker: None,
            running: false,
            interest_updates: 0,
        })
    }

    // ------------------------------------------------------------------
    // I/O interest
    // ------------------------------------------------------------------

    /// Register read interest. Returns `false` if it was already registered.
    pub fn add_read(&mut self, fd: RawFd) -> io::Result<bool> {
        let next = match self.interests.get(&fd) {
            Some(current) if current.is_readable() => return Ok(false),
            Some(current) => current.add(Interest::READABLE),
            None => Interest::READABLE,
        };
        self.apply(fd, Some(next))?;
        Ok(true)
    }

    /// Register write interest. Returns `false` if it was already registered.
    pub fn add_write(&mut self, fd: RawFd) -> io::Result<bool> {
        let next = match self.interests.get(&fd) {
            Some(current) if current.is_writable() => return Ok(false),
            Some(current) => current.add(Interest::WRITABLE),
            None => Interest::WRITABLE,
        };
        self.apply(fd, Some(next))?;
        Ok(true)
    }

    /// Cancel read interest. Returns `false` if it was not registered.
    pub fn cancel_read(&mut self, fd: RawFd) -> io::Result<bool> {
        match self.interests.get(&fd) {
            Some(current) if current.is_readable() => {
                let next = current.remove(Interest::READABLE);
                self.apply(fd, next)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancel write interest. Returns `false` if it was not registered.
    pub fn cancel_write(&mut self, fd: RawFd) -> io::Result<bool> {
        match self.interests.get(&fd) {
            Some(current) if current.is_writable() => {
                let next = current.remove(Interest::WRITABLE);
                self.apply(fd, next)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop every interest registered for `fd`.
    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.interests.contains_key(&fd) {
            self.apply(fd, None)?;
        }
        Ok(())
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }

    pub fn interest_updates(&self) -> u64 {
        self.interest_updates
    }

    fn apply(&mut self, fd: RawFd, next: Option<Interest>) -> io::Result<()> {
        let registry = self.poll.registry();
        let token = Token(fd as usize);
        match (self.interests.get(&fd).copied(), next) {
            (None, Some(interest)) => {
                registry.register(&mut SourceFd(&fd), token, interest)?;
                self.interests.insert(fd, interest);
            }
            (Some(_), Some(interest)) => {
                registry.reregister(&mut SourceFd(&fd), token, interest)?;
                self.interests.insert(fd, interest);
            }
            (Some(_), None) => {
                self.interests.remove(&fd);
                registry.deregister(&mut SourceFd(&fd))?;
            }
            (None, None) => return Ok(()),
        }
        self.interest_updates += 1;
        trace!(fd, interest = ?next, "interest updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Arm a one-shot timer, replacing any timer already armed for `key`.
    pub fn add_timer(&mut self, key: TimerKey, after: Duration) {
        self.cancel_timer(&key);
        self.timer_seq += 1;
        let slot = (Instant::now() + after, self.timer_seq);
        self.timers.insert(slot, key.clone());
        self.timer_index.insert(key, slot);
    }

    /// Push the deadline of `key` out to `after` from now.
    pub fn refresh_timer(&mut self, key: TimerKey, after: Duration) {
        self.add_timer(key, after);
    }

    /// Cancel a pending timer. Returns `false` if none was armed.
    pub fn cancel_timer(&mut self, key: &TimerKey) -> bool {
        self.periodic.remove(key);
        match self.timer_index.remove(key) {
            Some(slot) => {
                self.timers.remove(&slot);
                true
            }
            None => false,
        }
    }

    pub fn timer_deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.timer_index.get(key).map(|(deadline, _)| *deadline)
    }

    /// Arm a timer that re-arms itself every `interval` after firing.
    pub fn add_periodic(&mut self, key: TimerKey, interval: Duration) {
        let interval = interval.max(MIN_PERIOD);
        self.add_timer(key.clone(), interval);
        self.periodic.insert(key, interval);
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.timers
            .first_key_value()
            .map(|((deadline, _), _)| deadline.saturating_duration_since(Instant::now()))
    }

    fn take_expired(&mut self, fired: &mut Vec<ReactorEvent>) {
        let now = Instant::now();
        while let Some((&(deadline, seq), _)) = self.timers.first_key_value() {
            if deadline > now {
                break;
            }
            let Some(key) = self.timers.remove(&(deadline, seq)) else {
                break;
            };
            self.timer_index.remove(&key);
            if let Some(interval) = self.periodic.get(&key).copied() {
                self.timer_seq += 1;
                let slot = (now + interval, self.timer_seq);
                self.timers.insert(slot, key.clone());
                self.timer_index.insert(key.clone(), slot);
            }
            fired.push(ReactorEvent::Timer(key));
        }
    }

    // ------------------------------------------------------------------
    // Signals and wakeups
    // ------------------------------------------------------------------

    /// Route delivery of `signum` through the event loop.
    pub fn add_signal(&mut self, signum: i32) -> io::Result<()> {
        if self.signals.is_none() {
            let mut signals = Signals::new(std::iter::empty::<i32>())?;
            self.poll
                .registry()
                .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
            self.signals = Some(signals);
        }
        if let Some(signals) = &self.signals {
            signals.add_signal(signum)?;
        }
        debug!(signum, "signal registered");
        Ok(())
    }

    /// Handle that lets another thread interrupt the wait.
    pub fn waker(&mut self) -> io::Result<Arc<Waker>> {
        if let Some(waker) = &self.waker {
            return Ok(waker.clone());
        }
        let waker = Arc::new(Waker::new(self.poll.registry(), WAKE_TOKEN)?);
        self.waker = Some(waker.clone());
        Ok(waker)
    }

    // ------------------------------------------------------------------
    // Loop control
    // ------------------------------------------------------------------

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Wait for readiness or the nearest timer, then report what happened.
    ///
    /// `max_wait` caps the wait further; `None` waits for the next event.
    pub fn poll(&mut self, max_wait: Option<Duration>) -> io::Result<Vec<ReactorEvent>> {
        let timeout = match (self.next_timeout(), max_wait) {
            (Some(timer), Some(cap)) => Some(timer.min(cap)),
            (timer, cap) => timer.or(cap),
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        let mut fired = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                SIGNAL_TOKEN => {
                    if let Some(signals) = self.signals.as_mut() {
                        fired.extend(signals.pending().map(ReactorEvent::Signal));
                    }
                }
                WAKE_TOKEN => fired.push(ReactorEvent::Wake),
                Token(fd) => fired.push(ReactorEvent::Io {
                    fd: fd as RawFd,
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed(),
                }),
            }
        }

        self.take_expired(&mut fired);
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn poll_until<F>(reactor: &mut Reactor, mut done: F) -> Vec<ReactorEvent>
    where
        F: FnMut(&[ReactorEvent]) -> bool,
    {
        let mut seen = Vec::new();
        let give_up = Instant::now() + Duration::from_secs(2);
        while !done(&seen) && Instant::now() < give_up {
            seen.extend(reactor.poll(Some(Duration::from_millis(50))).unwrap());
        }
        seen
    }

    #[test]
    fn test_interest_registration_is_idempotent() {
        let mut reactor = Reactor::new(16).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();

        assert!(reactor.add_read(fd).unwrap());
        assert!(reactor.add_write(fd).unwrap());
        let updates = reactor.interest_updates();

        assert!(!reactor.add_write(fd).unwrap());
        assert!(!reactor.add_read(fd).unwrap());
        assert_eq!(reactor.interest_updates(), updates);
        assert_eq!(
            reactor.interest(fd),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        assert!(reactor.cancel_write(fd).unwrap());
        assert!(!reactor.cancel_write(fd).unwrap());
        assert_eq!(reactor.interest(fd), Some(Interest::READABLE));

        reactor.remove(fd).unwrap();
        assert_eq!(reactor.interest(fd), None);
    }

    #[test]
    fn test_readiness_is_reported_per_fd() {
        let mut reactor = Reactor::new(16).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        reactor.add_read(fd).unwrap();
        reactor.add_timer(TimerKey::Periodic(0), Duration::from_secs(1));

        b.write_all(b"ping").unwrap();
        let events = poll_until(&mut reactor, |seen| !seen.is_empty());

        assert!(events.contains(&ReactorEvent::Io {
            fd,
            readable: true,
            writable: false,
        }));
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut reactor = Reactor::new(16).unwrap();
        reactor.add_timer(TimerKey::Channel(1), Duration::from_millis(30));
        reactor.add_timer(TimerKey::Channel(2), Duration::from_millis(5));

        let events = poll_until(&mut reactor, |seen| seen.len() >= 2);
        assert_eq!(
            events,
            vec![
                ReactorEvent::Timer(TimerKey::Channel(2)),
                ReactorEvent::Timer(TimerKey::Channel(1)),
            ]
        );
    }

    #[test]
    fn test_refresh_and_cancel() {
        let mut reactor = Reactor::new(16).unwrap();
        let key = TimerKey::Flood("10.0.0.1".to_string());
        reactor.add_timer(key.clone(), Duration::from_millis(5));
        let first = reactor.timer_deadline(&key).unwrap();

        reactor.refresh_timer(key.clone(), Duration::from_secs(5));
        assert!(reactor.timer_deadline(&key).unwrap() > first);

        assert!(reactor.cancel_timer(&key));
        assert!(!reactor.cancel_timer(&key));
        assert_eq!(reactor.timer_deadline(&key), None);
    }

    #[test]
    fn test_periodic_timer_rearms() {
        let mut reactor = Reactor::new(16).unwrap();
        let key = TimerKey::Periodic(7);
        reactor.add_periodic(key.clone(), Duration::from_millis(5));

        let events = poll_until(&mut reactor, |seen| seen.len() >= 2);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| *e == ReactorEvent::Timer(key.clone())));
        assert!(reactor.timer_deadline(&key).is_some());

        reactor.cancel_timer(&key);
        assert_eq!(reactor.timer_deadline(&key), None);
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut reactor = Reactor::new(16).unwrap();
        let waker = reactor.waker().unwrap();
        reactor.add_timer(TimerKey::Periodic(1), Duration::from_secs(5));

        std::thread::spawn(move || waker.wake().unwrap());
        let events = poll_until(&mut reactor, |seen| !seen.is_empty());
        assert_eq!(events, vec![ReactorEvent::Wake]);
    }
}
