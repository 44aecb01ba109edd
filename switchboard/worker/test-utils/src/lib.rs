use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

/// One accepted connection and everything read from it so far
struct PeerConnection {
    stream: TcpStream,
    buf: Vec<u8>,
    lines: Vec<String>,
    closed: bool,
}

/// Loopback peer for routing tests.
///
/// Never blocks, so a test can interleave it with dispatcher turns on a
/// single thread: call [`TestPeer::pump`] (or any accessor, which pumps)
/// between `run_once` calls.
pub struct TestPeer {
    listener: TcpListener,
    connections: Vec<PeerConnection>,
}

impl TestPeer {
    /// Bind to an ephemeral port on 127.0.0.1
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test peer");
        listener.set_nonblocking(true).expect("nonblocking test peer");
        Self {
            listener,
            connections: Vec::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("test peer address")
    }

    /// The peer's routing identity, `127.0.0.1:<port>`
    pub fn identity(&self) -> String {
        self.addr().to_string()
    }

    /// Accept pending connections and read whatever has arrived
    pub fn pump(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).expect("nonblocking connection");
                    self.connections.push(PeerConnection {
                        stream,
                        buf: Vec::new(),
                        lines: Vec::new(),
                        closed: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("test peer accept failed: {}", e),
            }
        }

        for connection in &mut self.connections {
            let mut chunk = [0u8; 4096];
            while !connection.closed {
                match connection.stream.read(&mut chunk) {
                    Ok(0) => connection.closed = true,
                    Ok(n) => connection.buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => connection.closed = true,
                }
            }
            while let Some(end) = connection.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = connection.buf.drain(..=end).collect();
                connection
                    .lines
                    .push(String::from_utf8_lossy(&line).trim_end().to_string());
            }
        }
    }

    /// Number of connections accepted so far
    pub fn accepted(&mut self) -> usize {
        self.pump();
        self.connections.len()
    }

    /// Lines received on every connection, in accept order
    pub fn lines(&mut self) -> Vec<String> {
        self.pump();
        self.connections
            .iter()
            .flat_map(|c| c.lines.iter().cloned())
            .collect()
    }

    /// Lines received on one connection
    pub fn lines_on(&mut self, connection: usize) -> Vec<String> {
        self.pump();
        self.connections
            .get(connection)
            .map(|c| c.lines.clone())
            .unwrap_or_default()
    }

    /// Whether the dispatcher closed connection `connection`
    pub fn is_closed(&mut self, connection: usize) -> bool {
        self.pump();
        self.connections.get(connection).is_some_and(|c| c.closed)
    }

    /// Write one newline-terminated line back on a connection
    pub fn send_line(&mut self, connection: usize, line: &str) {
        let stream = &mut self.connections[connection].stream;
        stream.set_nonblocking(false).expect("blocking write");
        stream.write_all(line.as_bytes()).expect("write line");
        stream.write_all(b"\n").expect("write newline");
        stream.set_nonblocking(true).expect("nonblocking connection");
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns the last result.
pub fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let give_up = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
