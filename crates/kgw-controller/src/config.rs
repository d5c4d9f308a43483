use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use kgw_client::GatewayConfig;

pub const DEFAULT_CULL_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullerConfig {
    /// Time between sweeps; the first sweep runs one interval after start.
    pub interval: Duration,
    /// Kernels idle for strictly longer than this are deleted.
    pub idle_threshold: Duration,
}

impl Default for CullerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CULL_INTERVAL,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Memory,
    Sqlite(PathBuf),
}

impl StoreConfig {
    /// `:memory:` selects the in-memory store; anything else is a SQLite path.
    pub fn from_arg(arg: &str) -> Self {
        if arg == ":memory:" {
            StoreConfig::Memory
        } else {
            StoreConfig::Sqlite(PathBuf::from(arg))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bind: SocketAddr,
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub culler: CullerConfig,
}
