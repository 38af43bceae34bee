//! Configuration types consumed by the transaction core.
//!
//! Parsing configuration files is not this crate's business: the embedding
//! proxy builds these structures itself (deserializing them from whatever
//! format it uses) and hands them to the core by reference.

use serde::{Deserialize, Serialize};
use time::Duration;

/// How the backend persistence cookie is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CookieMode {
    /// the cookie is set by the server; the proxy only reads it
    Passive,
    /// the server's cookie value is overwritten with the server id
    Rewrite,
    /// the proxy inserts its own cookie in responses
    Insert,
    /// the server id and a delimiter are prepended to the server's value
    Prefix,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieConfig {
    /// persistence cookie name; `None` disables cookie persistence
    pub name: Option<String>,
    pub mode: CookieMode,
    /// in insert mode, do not forward the cookie to the server
    pub indirect: bool,
    /// in insert mode, leave a server-emitted cookie with the same name
    /// untouched unless its value is empty
    pub preserve: bool,
    /// maximum idle time of a cookie in seconds, 0 to disable
    pub maxidle: i64,
    /// maximum life time of a cookie in seconds, 0 to disable
    pub maxlife: i64,
    /// allow persistence on a server marked down
    pub persist_on_down: bool,
    /// persistence was explicitly disabled for this transaction class
    pub ignore_persistence: bool,
    /// application session cookie whose value is captured for stickiness
    pub session_cookie: Option<String>,
}

impl Default for CookieConfig {
    fn default() -> CookieConfig {
        CookieConfig {
            name: None,
            mode: CookieMode::Passive,
            indirect: false,
            preserve: false,
            maxidle: 0,
            maxlife: 0,
            persist_on_down: false,
            ignore_persistence: false,
            session_cookie: None,
        }
    }
}

/// Cookie capture for logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// cookie name prefix to capture, `None` disables capture
    pub cookie_name: Option<String>,
    /// maximum captured length, name and value included
    pub cookie_len: usize,
}

/// The slice of the server model the core needs: enough to validate a
/// persistence cookie and pick a target. The full server state (weights,
/// health checks, queues) lives in the embedding proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRef {
    pub id: String,
    /// value carried by the persistence cookie for this server
    pub cookie: Option<String>,
    pub up: bool,
    pub maintenance: bool,
}

impl ServerRef {
    pub fn usable(&self) -> bool {
        self.up && !self.maintenance
    }
}

/// Frontend-side options consulted by the transaction state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// desired connection mode, before negotiation with the other side
    pub mode: super::protocol::http::ConnMode,
    /// accept bytes >= 0x80 in request targets
    pub accept_invalid_request: bool,
    /// emit `Proxy-Connection` instead of `Connection` for proxy requests
    pub proxy_connection_header: bool,
    /// the frontend is being drained; new transactions must close
    pub stopping: bool,
    pub capture: CaptureConfig,
}

impl Default for FrontendConfig {
    fn default() -> FrontendConfig {
        FrontendConfig {
            mode: super::protocol::http::ConnMode::KeepAlive,
            accept_invalid_request: false,
            proxy_connection_header: false,
            stopping: false,
            capture: CaptureConfig::default(),
        }
    }
}

/// Backend-side options consulted by the transaction state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub mode: super::protocol::http::ConnMode,
    pub cookie: CookieConfig,
    pub servers: Vec<ServerRef>,
}

impl Default for BackendConfig {
    fn default() -> BackendConfig {
        BackendConfig {
            mode: super::protocol::http::ConnMode::KeepAlive,
            cookie: CookieConfig::default(),
            servers: Vec::new(),
        }
    }
}

/// Inactivity limits. The embedding scheduler owns the clock; these only
/// parameterize the deadlines it arms on each channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// client inactivity on an established connection
    pub client: Duration,
    /// server inactivity while a response is expected
    pub server: Duration,
    /// complete request headers must arrive within this window
    pub http_request: Duration,
    /// keep-alive idle time before the next request
    pub http_keep_alive: Duration,
    /// how long a tarpitted connection is held before the 500
    pub tarpit: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> TimeoutConfig {
        TimeoutConfig {
            client: Duration::seconds(30),
            server: Duration::seconds(30),
            http_request: Duration::seconds(10),
            http_keep_alive: Duration::seconds(10),
            tarpit: Duration::seconds(10),
        }
    }
}

impl TimeoutConfig {
    /// Absolute tick for a deadline starting now, in milliseconds.
    pub fn deadline(now_ticks: u64, after: Duration) -> u64 {
        now_ticks.saturating_add(after.whole_milliseconds().max(0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// algorithm names offered, in preference order
    pub algorithms: Vec<String>,
    /// content-type whitelist; empty compresses everything
    pub types: Vec<String>,
    /// initial and maximum compression level
    pub level: u32,
    /// compressed-output rate ceiling in bytes per second, 0 to disable
    pub rate_limit: u64,
    /// strip Accept-Encoding from requests so the backend never compresses
    pub offload: bool,
    /// minimum idle CPU percentage below which compression is skipped
    pub min_idle: u32,
}

impl Default for CompressionConfig {
    fn default() -> CompressionConfig {
        CompressionConfig {
            algorithms: Vec::new(),
            types: Vec::new(),
            level: 1,
            rate_limit: 0,
            offload: false,
            min_idle: 0,
        }
    }
}
