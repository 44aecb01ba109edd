//! Accept-time admission: flood guard and connection cap

mod common;

use std::io::Read;
use std::net::TcpStream;
use std::time::Duration;

use common::{drive, quiet_config, recorded};
use switchboard_worker::{CodecKind, DispatcherConfig, ListenMode};

fn guarded(threshold: u32, window: Duration) -> DispatcherConfig {
    DispatcherConfig {
        flood_threshold: threshold,
        flood_window: window,
        ..quiet_config()
    }
}

#[test]
fn test_attempts_past_threshold_are_dropped() {
    let (mut dispatcher, seen) = recorded(guarded(2, Duration::from_secs(60)));
    let addr = dispatcher
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Local)
        .unwrap();

    let mut clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();

    assert!(drive(&mut dispatcher, |d| {
        d.stats().accepted + d.stats().flood_rejected == 3
    }));
    assert_eq!(dispatcher.stats().accepted, 2);
    assert_eq!(dispatcher.stats().flood_rejected, 1);
    assert_eq!(dispatcher.flood_guard().attempts("127.0.0.1"), 3);
    assert_eq!(dispatcher.connection_count(), 2);
    assert_eq!(seen.borrow().established.len(), 2);

    // the rejected connection was closed without a byte
    let rejected = clients.pop().unwrap();
    rejected.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut buf = [0u8; 1];
    assert_eq!((&rejected).read(&mut buf).unwrap(), 0);
}

#[test]
fn test_quiet_window_forgets_the_source() {
    let (mut dispatcher, _seen) = recorded(guarded(1, Duration::from_millis(50)));
    let addr = dispatcher
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Local)
        .unwrap();

    let _first = TcpStream::connect(addr).unwrap();
    assert!(drive(&mut dispatcher, |d| d.stats().accepted == 1));
    assert_eq!(dispatcher.flood_guard().tracked(), 1);

    assert!(drive(&mut dispatcher, |d| d.flood_guard().tracked() == 0));

    let _second = TcpStream::connect(addr).unwrap();
    assert!(drive(&mut dispatcher, |d| d.stats().accepted == 2));
    assert_eq!(dispatcher.stats().flood_rejected, 0);
}

#[test]
fn test_disabled_guard_admits_everything() {
    let (mut dispatcher, _seen) = recorded(guarded(0, Duration::from_secs(60)));
    let addr = dispatcher
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Local)
        .unwrap();

    let _clients: Vec<TcpStream> = (0..5).map(|_| TcpStream::connect(addr).unwrap()).collect();

    assert!(drive(&mut dispatcher, |d| d.stats().accepted == 5));
    assert_eq!(dispatcher.flood_guard().tracked(), 0);
}

#[test]
fn test_connection_cap_refuses_extra_clients() {
    let config = DispatcherConfig {
        max_connections: 1,
        ..quiet_config()
    };
    let (mut dispatcher, _seen) = recorded(config);
    let addr = dispatcher
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Local)
        .unwrap();

    let _first = TcpStream::connect(addr).unwrap();
    let _second = TcpStream::connect(addr).unwrap();

    assert!(drive(&mut dispatcher, |d| d.stats().capacity_rejected == 1));
    assert_eq!(dispatcher.stats().accepted, 1);
    assert_eq!(dispatcher.connection_count(), 1);
}
