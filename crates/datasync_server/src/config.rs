//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the ingestion server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Root directory for received files.
    pub store_dir: PathBuf,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a connection may go without sending a frame.
    pub read_timeout: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr,
            store_dir: store_dir.into(),
            max_connections: 256,
            read_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the per-frame read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 7070)), "datasync-store")
    }
}
