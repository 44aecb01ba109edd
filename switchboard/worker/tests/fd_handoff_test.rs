//! Connections accepted by one dispatcher and served by another

mod common;

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::{head_of, quiet_config};
use nix::sys::socket::{setsockopt, sockopt};
use switchboard_worker::{Actor, CodecKind, Dispatcher, DispatcherConfig, Envelope, ListenMode};
use test_utils::eventually;

struct Echo;

impl Actor for Echo {
    fn on_message(&mut self, dispatcher: &mut Dispatcher, fd: RawFd, envelope: Envelope) {
        dispatcher.send_to(fd, &envelope).expect("echo");
    }
}

fn turn_both(acceptor: &mut Dispatcher, worker: &mut Dispatcher) {
    acceptor.run_once(Some(Duration::from_millis(5))).unwrap();
    worker.run_once(Some(Duration::from_millis(5))).unwrap();
}

#[test]
fn test_transferred_connection_is_served_by_the_worker() {
    let _ = tracing_subscriber::fmt::try_init();
    let (acceptor_side, worker_side) = UnixStream::pair().unwrap();

    let mut worker = Dispatcher::new(quiet_config()).unwrap();
    worker.set_actor(Box::new(Echo));
    worker.attach_control(worker_side).unwrap();

    let mut acceptor = Dispatcher::new(quiet_config()).unwrap();
    acceptor.add_worker_link(acceptor_side).unwrap();
    let addr = acceptor
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Transfer)
        .unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .write_all(b"{\"cmd\":7,\"seq\":42,\"body\":{\"data\":\"hello\"}}\n")
        .unwrap();

    let give_up = Instant::now() + Duration::from_secs(5);
    while worker.stats().accepted == 0 && Instant::now() < give_up {
        turn_both(&mut acceptor, &mut worker);
    }
    assert_eq!(acceptor.stats().transferred, 1);
    assert_eq!(acceptor.connection_count(), 0);
    assert_eq!(worker.connection_count(), 1);

    // the worker echoes; keep it turning while the client waits
    client.set_nonblocking(true).unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());
    let mut line = String::new();
    while Instant::now() < give_up {
        turn_both(&mut acceptor, &mut worker);
        match reader.read_line(&mut line) {
            Ok(_) if line.ends_with('\n') => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("client read failed: {}", e),
        }
    }
    assert_eq!(head_of(line.trim_end()), (7, 42));
}

#[test]
fn test_transfer_without_links_serves_locally() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut acceptor = Dispatcher::new(quiet_config()).unwrap();
    acceptor.set_actor(Box::new(Echo));
    let addr = acceptor
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Transfer)
        .unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    let give_up = Instant::now() + Duration::from_secs(5);
    while acceptor.stats().accepted == 0 && Instant::now() < give_up {
        acceptor.run_once(Some(Duration::from_millis(5))).unwrap();
    }

    assert_eq!(acceptor.stats().transferred, 0);
    assert_eq!(acceptor.connection_count(), 1);
}

#[test]
fn test_worker_thread_serves_handed_off_connections() {
    let _ = tracing_subscriber::fmt::try_init();
    let (acceptor_side, worker_side) = UnixStream::pair().unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let worker_done = done.clone();
    let worker = thread::spawn(move || {
        let mut worker = Dispatcher::new(quiet_config()).unwrap();
        worker.set_actor(Box::new(Echo));
        worker.attach_control(worker_side).unwrap();
        while !worker_done.load(Ordering::SeqCst) {
            worker.run_once(Some(Duration::from_millis(5))).unwrap();
        }
        worker.stats().accepted
    });

    let mut acceptor = Dispatcher::new(quiet_config()).unwrap();
    acceptor.add_worker_link(acceptor_side).unwrap();
    let addr = acceptor
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Transfer)
        .unwrap();

    let mut clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(eventually(Duration::from_secs(5), || {
        acceptor.run_once(Some(Duration::from_millis(5))).unwrap();
        acceptor.stats().transferred == 3
    }));

    for (seq, client) in clients.iter_mut().enumerate() {
        writeln!(client, "{{\"cmd\":9,\"seq\":{}}}", seq).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut line = String::new();
        BufReader::new(&*client).read_line(&mut line).unwrap();
        assert_eq!(head_of(line.trim_end()), (9, seq as i64));
    }

    done.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), 3);
}

#[test]
fn test_full_worker_link_falls_back_to_local_serving() {
    let _ = tracing_subscriber::fmt::try_init();
    let (acceptor_side, worker_side) = UnixStream::pair().unwrap();
    // the worker never reads, so a tiny send buffer fills after a few handoffs
    setsockopt(&acceptor_side, sockopt::SndBuf, &1).unwrap();

    let config = DispatcherConfig {
        flood_threshold: 1000,
        ..quiet_config()
    };
    let mut acceptor = Dispatcher::new(config).unwrap();
    acceptor.set_actor(Box::new(Echo));
    acceptor.add_worker_link(acceptor_side).unwrap();
    let addr = acceptor
        .listen("127.0.0.1:0".parse().unwrap(), CodecKind::Json, ListenMode::Transfer)
        .unwrap();

    const CLIENTS: u64 = 60;
    let _clients: Vec<TcpStream> = (0..CLIENTS).map(|_| TcpStream::connect(addr).unwrap()).collect();
    let started = Instant::now();
    assert!(eventually(Duration::from_secs(5), || {
        acceptor.run_once(Some(Duration::from_millis(5))).unwrap();
        let stats = acceptor.stats();
        stats.accepted + stats.transferred == CLIENTS
    }));

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(acceptor.stats().transferred > 0);
    assert!(acceptor.stats().accepted > 0);
    assert_eq!(acceptor.connection_count() as u64, acceptor.stats().accepted);
    drop(worker_side);
}
