//! Routing identities
//!
//! An identity names a logical destination as `host:port` or
//! `host:port.workerIndex`. Malformed identities are rejected before any
//! connection attempt is made.

use std::fmt;
use std::str::FromStr;

use crate::constants::MAX_WORKER_INDEX;
use crate::error::DispatchError;

/// A parsed `host:port[.workerIndex]` identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub host: String,
    pub port: u16,
    pub worker_index: Option<u32>,
}

impl Identity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            worker_index: None,
        }
    }

    pub fn with_worker(mut self, worker_index: u32) -> Self {
        self.worker_index = Some(worker_index);
        self
    }
}

/// `text` when it is a non-empty run of ASCII digits. Integer parsing alone
/// would also take a leading `+`.
fn digits(text: &str) -> Option<&str> {
    (!text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())).then_some(text)
}

impl FromStr for Identity {
    type Err = DispatchError;

    fn from_str(identity: &str) -> Result<Self, Self::Err> {
        let reject = |reason: &str| DispatchError::Config {
            identity: identity.to_string(),
            reason: reason.to_string(),
        };

        let (host, rest) = identity
            .rsplit_once(':')
            .ok_or_else(|| reject("missing port separator"))?;
        if host.is_empty() {
            return Err(reject("empty host"));
        }

        let (port, worker_index) = match rest.split_once('.') {
            Some((port, worker)) => (port, Some(worker)),
            None => (rest, None),
        };

        let port = match digits(port).and_then(|p| p.parse::<u16>().ok()) {
            None | Some(0) => return Err(reject("port must be a positive integer")),
            Some(port) => port,
        };

        let worker_index = match worker_index {
            None => None,
            Some(worker) => {
                let index = digits(worker)
                    .and_then(|w| w.parse::<u32>().ok())
                    .ok_or_else(|| reject("worker index must be an integer"))?;
                if index >= MAX_WORKER_INDEX {
                    return Err(reject("worker index must be smaller than 200"));
                }
                Some(index)
            }
        };

        Ok(Self {
            host: host.to_string(),
            port,
            worker_index,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.worker_index {
            Some(index) => write!(f, "{}:{}.{}", self.host, self.port, index),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}
