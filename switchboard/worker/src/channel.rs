//! Channels
//!
//! A [`Channel`] is one live connection: it owns the socket, its codec state,
//! the lifecycle status and the ordered outbound byte queue. Channels are
//! owned by the registry's fd index and dropped exactly once, by discard.
//! Dropping a channel closes its file descriptor.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

use mio::net::{TcpStream, UnixStream};
use tracing::{debug, trace, warn};

use crate::codec::{Codec, CodecKind, CodecStatus, Envelope};
use crate::constants::READ_CHUNK_SIZE;

/// Lifecycle of a channel. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelStatus {
    Init,
    TryConnect,
    Established,
    Timeout,
    Error,
    Closed,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Inbound,
    Outbound,
}

/// The socket underneath a channel
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            Transport::Unix(stream) => stream.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.write(buf),
            Transport::Unix(stream) => stream.write(buf),
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Tcp(stream) => stream.as_raw_fd(),
            Transport::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

/// What one readable event produced
#[derive(Debug)]
pub struct Received {
    /// Envelopes decoded in arrival order
    pub envelopes: Vec<Envelope>,
    /// Status the channel is left in after decoding
    pub status: CodecStatus,
    /// Reason attached to an `Error` status
    pub error: Option<String>,
}

pub struct Channel {
    fd: RawFd,
    transport: Transport,
    codec: Box<dyn Codec>,
    origin: Origin,
    with_tls: bool,
    pipeline: bool,
    status: ChannelStatus,
    identity: Option<String>,
    remote_addr: String,
    remote_worker_index: Option<u32>,
    client_data: Option<String>,
    last_active: Instant,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,

    /// Codec asked for a read before any further writes
    awaiting_read: bool,

    /// Codec reported `Eof`: close once the queue drains
    close_after_flush: bool,
}

impl Channel {
    /// A connection accepted from a peer (or handed over by the acceptor).
    pub fn inbound(transport: Transport, codec: Box<dyn Codec>, remote_addr: String) -> Self {
        let mut channel = Self::new(transport, codec, Origin::Inbound, remote_addr);
        channel.status = ChannelStatus::Established;
        channel
    }

    /// A connection this worker is opening. Starts in `Init`.
    pub fn outbound(stream: TcpStream, codec: Box<dyn Codec>, remote_addr: String) -> Self {
        Self::new(Transport::Tcp(stream), codec, Origin::Outbound, remote_addr)
    }

    fn new(transport: Transport, codec: Box<dyn Codec>, origin: Origin, remote_addr: String) -> Self {
        Self {
            fd: transport.as_raw_fd(),
            transport,
            codec,
            origin,
            with_tls: false,
            pipeline: false,
            status: ChannelStatus::Init,
            identity: None,
            remote_addr,
            remote_worker_index: None,
            client_data: None,
            last_active: Instant::now(),
            recv_buf: Vec::new(),
            send_buf: Vec::new(),
            awaiting_read: false,
            close_after_flush: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn remote_worker_index(&self) -> Option<u32> {
        self.remote_worker_index
    }

    pub fn client_data(&self) -> Option<&str> {
        self.client_data.as_deref()
    }

    pub fn is_pipeline(&self) -> bool {
        self.pipeline
    }

    pub fn with_tls(&self) -> bool {
        self.with_tls
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.codec.kind()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn has_pending_output(&self) -> bool {
        !self.send_buf.is_empty()
    }

    pub fn is_awaiting_read(&self) -> bool {
        self.awaiting_read
    }

    pub fn closes_after_flush(&self) -> bool {
        self.close_after_flush
    }

    pub fn set_identity(&mut self, identity: impl Into<String>) {
        self.identity = Some(identity.into());
    }

    pub fn set_pipeline(&mut self, pipeline: bool) {
        self.pipeline = pipeline;
    }

    pub fn set_with_tls(&mut self, with_tls: bool) {
        self.with_tls = with_tls;
    }

    pub fn set_remote_worker_index(&mut self, index: Option<u32>) {
        self.remote_worker_index = index;
    }

    pub fn set_client_data(&mut self, data: impl Into<String>) {
        self.client_data = Some(data.into());
    }

    pub fn mark_close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    /// Advance the lifecycle. Backward transitions are refused.
    pub fn set_status(&mut self, next: ChannelStatus) -> bool {
        if next <= self.status {
            debug!(fd = self.fd, from = ?self.status, to = ?next, "refusing status transition");
            return false;
        }
        trace!(fd = self.fd, from = ?self.status, to = ?next, "channel status");
        self.status = next;
        true
    }

    /// Replace the codec state wholesale (protocol upgrade).
    pub fn switch_codec(&mut self, codec: Box<dyn Codec>) {
        debug!(fd = self.fd, from = ?self.codec.kind(), to = ?codec.kind(), "switching codec");
        self.codec = codec;
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Encode `envelope` onto the outbound queue and push out what the
    /// socket will take right now.
    pub fn send(&mut self, envelope: &Envelope) -> CodecStatus {
        if self.status > ChannelStatus::Established {
            return CodecStatus::Error;
        }

        let status = self.codec.encode(envelope, &mut self.send_buf);
        match status {
            CodecStatus::Error => CodecStatus::Error,
            CodecStatus::WantRead => {
                self.awaiting_read = true;
                CodecStatus::WantRead
            }
            CodecStatus::Pause | CodecStatus::WantWrite => status,
            CodecStatus::Ok | CodecStatus::Eof | CodecStatus::Incomplete => {
                if status == CodecStatus::Eof {
                    self.close_after_flush = true;
                }
                if self.awaiting_read {
                    return CodecStatus::WantRead;
                }
                if self.status != ChannelStatus::Established {
                    // queued until the connect completes
                    return CodecStatus::WantWrite;
                }
                self.flush()
            }
        }
    }

    /// Write queued bytes until the queue drains or the socket pushes back.
    pub fn flush(&mut self) -> CodecStatus {
        while !self.send_buf.is_empty() {
            match self.transport.write(&self.send_buf) {
                Ok(0) => {
                    warn!(fd = self.fd, "socket accepted no bytes");
                    return CodecStatus::Error;
                }
                Ok(n) => {
                    self.send_buf.drain(..n);
                    self.touch();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return CodecStatus::WantWrite,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(fd = self.fd, "write failed: {}", e);
                    return CodecStatus::Error;
                }
            }
        }

        if self.close_after_flush {
            CodecStatus::Eof
        } else {
            CodecStatus::Ok
        }
    }

    /// Drain the socket and decode everything complete.
    pub fn recv(&mut self) -> Received {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut peer_closed = false;
        let mut got_bytes = false;

        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    got_bytes = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Received {
                        envelopes: Vec::new(),
                        status: CodecStatus::Error,
                        error: Some(format!("read failed: {}", e)),
                    };
                }
            }
        }

        if got_bytes {
            self.touch();
            self.awaiting_read = false;
        }

        let mut envelopes = Vec::new();
        let mut status = CodecStatus::Ok;
        let mut error = None;
        loop {
            let decoded = self.codec.decode(&mut self.recv_buf);
            envelopes.extend(decoded.envelope);
            match decoded.status {
                CodecStatus::Ok => continue,
                CodecStatus::Incomplete => break,
                CodecStatus::Error => {
                    status = CodecStatus::Error;
                    error = Some(format!("{:?} codec rejected input", self.codec.kind()));
                    break;
                }
                other => {
                    status = other;
                    break;
                }
            }
        }

        if peer_closed && status != CodecStatus::Error {
            status = CodecStatus::Error;
            error = Some("peer closed connection".to_string());
        }

        Received {
            envelopes,
            status,
            error,
        }
    }

    /// Check an outbound connect after the first writable event.
    ///
    /// `Ok(true)` once connected, `Ok(false)` while still in progress.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        let Transport::Tcp(stream) = &self.transport else {
            return Ok(true);
        };
        if let Some(e) = stream.take_error()? {
            return Err(e);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EINPROGRESS as i32) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("status", &self.status)
            .field("origin", &self.origin)
            .field("codec", &self.codec.kind())
            .field("identity", &self.identity)
            .field("remote_addr", &self.remote_addr)
            .field("pipeline", &self.pipeline)
            .field("queued", &self.send_buf.len())
            .finish()
    }
}
