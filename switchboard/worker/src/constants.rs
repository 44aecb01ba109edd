//! Constants and default configuration values used throughout the worker

use std::time::Duration;

/// Time allowed for an outbound non-blocking connect to complete
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Idle time after which an established channel is timed out
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Rolling window of the inbound connection flood guard
pub const DEFAULT_FLOOD_WINDOW: Duration = Duration::from_secs(60);

/// Connection attempts allowed per source address within one flood window
pub const DEFAULT_FLOOD_THRESHOLD: u32 = 100;

/// Worker indices in identities must be strictly below this value
pub const MAX_WORKER_INDEX: u32 = 200;

/// Interval of the built-in housekeeping task
pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

/// Bytes pulled from a socket per read call
pub const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Readiness events fetched per reactor wait
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Address a worker listens on when none is configured
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9000";

/// Upper bound on live channels per worker
pub const DEFAULT_MAX_CONNECTIONS: usize = 10240;

/// Node type that receives best-effort reports
pub const DEFAULT_REPORT_NODE_TYPE: &str = "BEACON";

/// Command id carried by report messages
pub const CMD_NODE_REPORT: i32 = 1001;

/// Directory for temporary files (logs)
pub const TEMP_DIR: &str = "/tmp";

/// Default log file name for development mode
pub const DEV_LOG_FILENAME: &str = "switchboard-worker.log";

/// Development log file path
pub fn dev_log_path() -> String {
    format!("{}/{}", TEMP_DIR, DEV_LOG_FILENAME)
}
