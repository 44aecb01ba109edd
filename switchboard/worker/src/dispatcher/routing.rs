//! Send strategies
//!
//! Everything here is built on the registry and [`Dispatcher::send_to`]:
//! identity sends reuse (pipelined) or consume (pooled) an existing channel
//! and fall back to auto-connect; node-type sends pick an identity first.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use mio::net::TcpStream;
use tracing::{debug, info};

use super::Dispatcher;
use crate::channel::{Channel, ChannelStatus};
use crate::codec::{CodecKind, Envelope};
use crate::error::{DispatchError, Result};
use crate::identity::Identity;
use crate::reactor::TimerKey;
use crate::types::Report;

/// How a routed send may open a new channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub codec: CodecKind,
    pub with_tls: bool,
    /// Reuse one channel per identity for many in-flight messages
    pub pipeline: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            codec: CodecKind::Json,
            with_tls: false,
            pipeline: true,
        }
    }
}

impl SendOptions {
    /// Consume a channel per send instead of reusing it.
    pub fn pooled() -> Self {
        Self {
            pipeline: false,
            ..Self::default()
        }
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }
}

/// 64-bit FNV-1a, stable across processes and builds
fn fnv1a(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let resolution = |reason: String| DispatchError::Resolution {
        host: host.to_string(),
        port,
        reason,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|e| resolution(e.to_string()))?
        .next()
        .ok_or_else(|| resolution("no addresses".to_string()))
}

impl Dispatcher {
    /// Send to `identity`, reusing or consuming a registered channel, or
    /// connecting a new one.
    pub fn send_to_identity(&mut self, identity: &str, envelope: &Envelope, options: SendOptions) -> Result<()> {
        let parsed: Identity = identity.parse()?;

        let existing = if options.pipeline {
            self.registry.first_named(identity)
        } else {
            self.registry.take_named(identity)
        };
        if let Some(fd) = existing {
            return self.send_to(fd, envelope);
        }

        self.auto_send(&parsed, identity, envelope, options).map(|_| ())
    }

    pub fn send_to_host(&mut self, host: &str, port: u16, envelope: &Envelope, options: SendOptions) -> Result<()> {
        let identity = format!("{}:{}", host, port);
        self.send_to_identity(&identity, envelope, options)
    }

    /// Open a new channel to `identity` and send `envelope` on it.
    ///
    /// Resolution or socket failures leave no trace in the registry.
    pub fn auto_send(
        &mut self,
        identity: &Identity,
        key: &str,
        envelope: &Envelope,
        options: SendOptions,
    ) -> Result<RawFd> {
        self.check_capacity()?;

        let addr = resolve(&identity.host, identity.port)?;
        let stream = TcpStream::connect(addr)?;
        let fd = stream.as_raw_fd();

        let mut channel = Channel::outbound(stream, options.codec.build(), addr.ip().to_string());
        channel.set_status(ChannelStatus::TryConnect);
        channel.set_identity(key);
        channel.set_pipeline(options.pipeline);
        channel.set_with_tls(options.with_tls);
        channel.set_remote_worker_index(identity.worker_index);
        self.registry.insert(channel)?;

        let registered = self
            .reactor
            .add_read(fd)
            .and_then(|_| self.reactor.add_write(fd));
        if let Err(e) = registered {
            if let Err(cleanup) = self.reactor.remove(fd) {
                debug!(fd, "cleanup after failed registration: {}", cleanup);
            }
            self.registry.remove(fd);
            return Err(e.into());
        }

        self.reactor
            .add_timer(TimerKey::Channel(fd), self.config.connect_timeout);
        self.stats.connects += 1;
        if options.pipeline {
            self.registry.add_named(key, fd);
        }
        info!(fd, identity = key, %addr, "connecting");

        self.send_to(fd, envelope)?;
        Ok(fd)
    }

    /// Send to the next identity of `node_type` in rotation.
    pub fn send_round_robin(&mut self, node_type: &str, envelope: &Envelope, options: SendOptions) -> Result<()> {
        let identity = self
            .registry
            .next_round_robin(node_type)
            .ok_or_else(|| DispatchError::NoRoute(node_type.to_string()))?;
        self.send_to_identity(&identity, envelope, options)
    }

    /// Send to the member of `node_type` selected by `factor`.
    pub fn send_oriented(
        &mut self,
        node_type: &str,
        factor: u64,
        envelope: &Envelope,
        options: SendOptions,
    ) -> Result<()> {
        let identity = self
            .registry
            .oriented(node_type, factor)
            .ok_or_else(|| DispatchError::NoRoute(node_type.to_string()))?;
        self.send_to_identity(&identity, envelope, options)
    }

    /// Oriented send keyed by a string, hashed with FNV-1a.
    pub fn send_oriented_by_key(
        &mut self,
        node_type: &str,
        key: &str,
        envelope: &Envelope,
        options: SendOptions,
    ) -> Result<()> {
        self.send_oriented(node_type, fnv1a(key), envelope, options)
    }

    /// Send to every identity of `node_type`. Each member is attempted
    /// independently; the outcomes are returned in membership order.
    pub fn broadcast(
        &mut self,
        node_type: &str,
        envelope: &Envelope,
        options: SendOptions,
    ) -> Result<Vec<(String, Result<()>)>> {
        let identities = self.registry.node_identities(node_type);
        if identities.is_empty() {
            return Err(DispatchError::NoRoute(node_type.to_string()));
        }
        Ok(identities
            .into_iter()
            .map(|identity| {
                let outcome = self.send_to_identity(&identity, envelope, options);
                (identity, outcome)
            })
            .collect())
    }

    /// Fire-and-forget send to the reporting sink. Failures are only logged.
    pub fn send_report(&mut self, report: &Report) {
        let Some(node_type) = self.config.report_node_type.clone() else {
            return;
        };
        self.report_seq = self.report_seq.wrapping_add(1);
        let outcome = report
            .to_envelope(self.report_seq)
            .and_then(|envelope| self.send_round_robin(&node_type, &envelope, SendOptions::default()));
        if let Err(e) = outcome {
            debug!(node_type, "report dropped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a("a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a("foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_unresolvable_host_leaves_no_channel() {
        let mut dispatcher = Dispatcher::new(Default::default()).unwrap();
        let result = dispatcher.send_to_identity(
            "no-such-host.invalid:9001",
            &Envelope::message(1, 1, serde_json::Value::Null),
            SendOptions::default(),
        );
        assert!(matches!(result, Err(DispatchError::Resolution { .. })));
        assert_eq!(dispatcher.connection_count(), 0);
        assert_eq!(dispatcher.stats().connects, 0);
    }

    #[test]
    fn test_malformed_identity_is_rejected_before_connect() {
        let mut dispatcher = Dispatcher::new(Default::default()).unwrap();
        let result = dispatcher.send_to_identity(
            "10.0.0.1:9001.201",
            &Envelope::message(1, 1, serde_json::Value::Null),
            SendOptions::default(),
        );
        assert!(matches!(result, Err(DispatchError::Config { .. })));
        assert_eq!(dispatcher.stats().connects, 0);
    }

    #[test]
    fn test_empty_node_type_has_no_route() {
        let mut dispatcher = Dispatcher::new(Default::default()).unwrap();
        let envelope = Envelope::message(1, 1, serde_json::Value::Null);
        assert!(matches!(
            dispatcher.send_round_robin("LOGIC", &envelope, SendOptions::default()),
            Err(DispatchError::NoRoute(_))
        ));
        assert!(matches!(
            dispatcher.broadcast("LOGIC", &envelope, SendOptions::default()),
            Err(DispatchError::NoRoute(_))
        ));
    }
}
