//! Worker configuration
//!
//! [`DispatcherConfig`] is what the dispatcher runs with. [`WorkerConfig`] is
//! the optional JSON file a worker is started with; every field may be
//! omitted and falls back to the defaults in [`crate::constants`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENTS_CAPACITY, DEFAULT_FLOOD_THRESHOLD, DEFAULT_FLOOD_WINDOW,
    DEFAULT_HOUSEKEEPING_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_REPORT_NODE_TYPE,
};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Time allowed for an outbound connect before the channel times out
    pub connect_timeout: Duration,

    /// Idle time after which an established channel is discarded; `None` disables
    pub idle_timeout: Option<Duration>,

    /// Accept attempts allowed per source address per window; 0 disables the guard
    pub flood_threshold: u32,
    pub flood_window: Duration,

    pub max_connections: usize,
    pub housekeeping_interval: Duration,

    /// Node type that receives best-effort reports; `None` disables reporting
    pub report_node_type: Option<String>,

    pub events_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            flood_threshold: DEFAULT_FLOOD_THRESHOLD,
            flood_window: DEFAULT_FLOOD_WINDOW,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
            report_node_type: Some(DEFAULT_REPORT_NODE_TYPE.to_string()),
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

/// On-disk worker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub listen: Option<SocketAddr>,
    pub codec: Option<CodecKind>,
    pub worker_index: Option<u32>,
    pub connect_timeout_ms: Option<u64>,

    /// Zero disables the idle timeout
    pub idle_timeout_secs: Option<u64>,

    pub flood_threshold: Option<u32>,
    pub flood_window_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub housekeeping_interval_secs: Option<u64>,

    /// Empty string disables reporting
    pub report_node_type: Option<String>,

    /// Node type → identities registered at startup
    pub nodes: BTreeMap<String, Vec<String>>,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            connect_timeout: self
                .connect_timeout_ms
                .map_or(defaults.connect_timeout, Duration::from_millis),
            idle_timeout: match self.idle_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.idle_timeout,
            },
            flood_threshold: self.flood_threshold.unwrap_or(defaults.flood_threshold),
            flood_window: self
                .flood_window_secs
                .map_or(defaults.flood_window, Duration::from_secs),
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            housekeeping_interval: self
                .housekeeping_interval_secs
                .map_or(defaults.housekeeping_interval, Duration::from_secs),
            report_node_type: match &self.report_node_type {
                Some(node_type) if node_type.is_empty() => None,
                Some(node_type) => Some(node_type.clone()),
                None => defaults.report_node_type,
            },
            events_capacity: defaults.events_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config, WorkerConfig::default());

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(dispatcher.idle_timeout, Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(dispatcher.report_node_type.as_deref(), Some(DEFAULT_REPORT_NODE_TYPE));
    }

    #[test]
    fn test_file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen": "127.0.0.1:9100",
                "codec": "one_shot",
                "idle_timeout_secs": 0,
                "flood_threshold": 5,
                "report_node_type": "",
                "nodes": {{ "LOGIC": ["10.0.0.1:9001", "10.0.0.2:9001.3"] }}
            }}"#
        )
        .unwrap();

        let config = WorkerConfig::load(file.path()).unwrap();
        assert_eq!(config.codec, Some(CodecKind::OneShot));
        assert_eq!(config.nodes["LOGIC"].len(), 2);

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.idle_timeout, None);
        assert_eq!(dispatcher.flood_threshold, 5);
        assert_eq!(dispatcher.report_node_type, None);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"listen_addr": "127.0.0.1:1"}}"#).unwrap();
        assert!(WorkerConfig::load(file.path()).is_err());
    }
}
