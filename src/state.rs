use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::connection::ConnectionGauge;
use crate::mapping::{MappingError, MappingTable};

/// Everything a request handler needs, constructed once at startup
#[derive(Debug)]
pub struct ServiceState {
    pub config: Arc<ProxyConfig>,
    pub mappings: MappingTable,
    pub connections: ConnectionGauge,
    request_count: AtomicU64,
    started_at: Instant,
}

impl ServiceState {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self {
            config,
            mappings: MappingTable::new(),
            connections: ConnectionGauge::new(),
            request_count: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Count one redirect request; returns the new total
    pub fn record_request(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.config.listen_addr
    }

    /// Load the mapping file and swap the table in
    pub async fn load_mappings(&self) -> Result<usize, MappingError> {
        self.mappings.reload_from(&self.config.config_file).await
    }

    /// Signal-triggered reload; failures leave the current table serving
    pub async fn reload_mappings(&self) {
        info!("Reloading mappings from config file...");
        match self.load_mappings().await {
            Ok(total) => info!("Mappings reloaded successfully ({} records)", total),
            Err(e) => warn!("Failed to reload mappings: {}", e),
        }
    }
}
