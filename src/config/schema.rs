use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Automation driver settings
    #[serde(default)]
    pub driver: DriverConfig,

    /// Session token settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Push-channel heartbeat settings
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Workflow run-loop settings
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            driver: DriverConfig::default(),
            session: SessionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port for the local HTTP API + push channel
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen_port: 8745 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Base URL of the remote automation driver
    pub endpoint: String,

    /// How long ensure_ready may spend (re)acquiring the driver
    pub ready_timeout_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9515".to_string(),
            ready_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity window after which a session expires
    pub timeout_ms: u64,

    /// How often the background sweep runs
    pub sweep_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30 * 60_000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between pings on a push connection
    pub interval_ms: u64,

    /// Deadline for the pong; must be shorter than the interval
    pub pong_deadline_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            pong_deadline_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Delay between work items (skipped after the last one)
    pub inter_item_delay_ms: u64,

    /// Polling interval of the bounded wait while paused
    pub pause_poll_ms: u64,

    /// Timeout for one item's full operation sequence
    pub item_timeout_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            inter_item_delay_ms: 1_500,
            pause_poll_ms: 500,
            item_timeout_ms: 60_000,
        }
    }
}
