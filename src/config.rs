//! Server tunables (spec.md §4.F "Backpressure", §5 "Cancellation").
//! Defaults match the suggested values in the spec; everything is
//! overridable from a TOML file loaded by the CLI `server` subcommand.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

pub const USBIP_PORT: u16 = 3240;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum `transfer_buffer_length` the reader accepts before
    /// rejecting the frame as a protocol error.
    pub max_transfer_buffer_bytes: u32,
    /// Per-endpoint in-flight URB cap enforced by the submitter.
    pub max_in_flight_per_endpoint: u32,
    /// Total outstanding payload bytes across all endpoints of a
    /// session before the reader suspends.
    pub max_outstanding_payload_bytes: u64,
    /// Upper bound on how long cancellation may take to land before
    /// the device is released regardless.
    pub cancellation_deadline_ms: u64,
    /// Depth of the writer's completion queue (spec.md §4.F "single
    /// consumer of a bounded completion queue").
    pub completion_queue_depth: usize,
    /// Listen addresses; defaults to both stacks on the standard port.
    pub listen_addrs: Vec<std::net::SocketAddr>,
    /// Root directory for the persisted binding registry.
    pub registry_path: std::path::PathBuf,
    /// Optional pcapng capture sink path; `None` disables capture.
    pub capture_path: Option<std::path::PathBuf>,
    /// Capacity of the capture sink's non-blocking channel.
    pub capture_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_transfer_buffer_bytes: 16 * 1024 * 1024,
            max_in_flight_per_endpoint: 32,
            max_outstanding_payload_bytes: 64 * 1024 * 1024,
            cancellation_deadline_ms: 500,
            completion_queue_depth: 256,
            listen_addrs: vec![
                std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), USBIP_PORT),
                std::net::SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), USBIP_PORT),
            ],
            registry_path: crate::registry::default_registry_path(),
            capture_path: None,
            capture_queue_depth: 1024,
        }
    }
}

impl ServerConfig {
    pub fn cancellation_deadline(&self) -> Duration {
        Duration::from_millis(self.cancellation_deadline_ms)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub async fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_toml_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_suggested_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_transfer_buffer_bytes, 16 * 1024 * 1024);
        assert_eq!(cfg.max_in_flight_per_endpoint, 32);
        assert_eq!(cfg.max_outstanding_payload_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.cancellation_deadline(), Duration::from_millis(500));
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = ServerConfig::from_toml_str("max_in_flight_per_endpoint = 8\n").unwrap();
        assert_eq!(cfg.max_in_flight_per_endpoint, 8);
        assert_eq!(cfg.max_transfer_buffer_bytes, 16 * 1024 * 1024);
    }
}
