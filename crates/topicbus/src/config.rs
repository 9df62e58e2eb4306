//! Bus configuration.
//!
//! Every field has a default so peers agree on addresses without any setup.
//! `BusConfig::from_env()` overlays `TOPICBUS_*` environment variables, and
//! `TOPICBUS_CONFIG` may point at a JSON file used as the base.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_IPC_DIR: &str = "/tmp/topicbus";
pub const DEFAULT_NETWORK_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT_BASE: u16 = 40000;
pub const DEFAULT_PORT_SPAN: u16 = 20000;
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// How a subscriber treats a publisher that is not there yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Construction succeeds immediately; the connection is retried in the background.
    #[default]
    Lazy,
    /// Construction fails with `ConnectionUnavailable` unless a publisher
    /// accepts within `connect_timeout_ms`.
    Eager,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Directory holding IPC socket files.
    pub ipc_dir: PathBuf,
    /// Host used for network channels.
    pub network_host: String,
    /// First port of the network channel range.
    pub port_base: u16,
    /// Number of ports channel names are hashed into.
    pub port_span: u16,
    /// Frames queued per subscriber connection before new frames are dropped.
    pub send_hwm: usize,
    /// Frames buffered in a subscriber inbox before the connection is throttled.
    pub recv_hwm: usize,
    /// Dispatch loop poll interval; bounds `stop_loop` latency.
    pub poll_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub connect_mode: ConnectMode,
    /// Largest accepted frame body (topic header + topic + payload).
    pub max_frame_len: usize,
    /// Worker threads for a context created by `Context::new`.
    pub io_threads: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ipc_dir: PathBuf::from(DEFAULT_IPC_DIR),
            network_host: DEFAULT_NETWORK_HOST.to_string(),
            port_base: DEFAULT_PORT_BASE,
            port_span: DEFAULT_PORT_SPAN,
            send_hwm: 1000,
            recv_hwm: 1000,
            poll_interval_ms: 100,
            reconnect_interval_ms: 100,
            connect_timeout_ms: 1000,
            connect_mode: ConnectMode::Lazy,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            io_threads: 2,
        }
    }
}

impl BusConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {e}", path.display()),
            ))
        })
    }

    /// Defaults (or the file named by `TOPICBUS_CONFIG`) overlaid with `TOPICBUS_*` variables.
    pub fn from_env() -> Self {
        let base = match std::env::var("TOPICBUS_CONFIG") {
            Ok(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path, error = %e, "Failed to load config file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        base.overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("TOPICBUS_IPC_DIR") {
            self.ipc_dir = PathBuf::from(dir);
        }
        if let Some(host) = lookup("TOPICBUS_HOST") {
            self.network_host = host;
        }
        parse_into(&lookup, "TOPICBUS_PORT_BASE", &mut self.port_base);
        parse_into(&lookup, "TOPICBUS_PORT_SPAN", &mut self.port_span);
        parse_into(&lookup, "TOPICBUS_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        parse_into(&lookup, "TOPICBUS_SEND_HWM", &mut self.send_hwm);
        parse_into(&lookup, "TOPICBUS_RECV_HWM", &mut self.recv_hwm);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn send_capacity(&self) -> usize {
        self.send_hwm.max(1)
    }

    pub(crate) fn recv_capacity(&self) -> usize {
        self.recv_hwm.max(1)
    }

    pub fn with_ipc_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ipc_dir = dir.into();
        self
    }

    pub fn with_network(mut self, host: impl Into<String>, port_base: u16, port_span: u16) -> Self {
        self.network_host = host.into();
        self.port_base = port_base;
        self.port_span = port_span;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_connect_mode(mut self, mode: ConnectMode) -> Self {
        self.connect_mode = mode;
        self
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparsable config value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_serializes() {
        insta::assert_json_snapshot!(BusConfig::default(), @r#"
        {
          "ipc_dir": "/tmp/topicbus",
          "network_host": "127.0.0.1",
          "port_base": 40000,
          "port_span": 20000,
          "send_hwm": 1000,
          "recv_hwm": 1000,
          "poll_interval_ms": 100,
          "reconnect_interval_ms": 100,
          "connect_timeout_ms": 1000,
          "connect_mode": "lazy",
          "max_frame_len": 8388608,
          "io_threads": 2
        }
        "#);
    }

    #[test]
    fn overlay_applies_env_values() {
        let env: HashMap<&str, &str> = [
            ("TOPICBUS_IPC_DIR", "/run/bus"),
            ("TOPICBUS_PORT_BASE", "30000"),
            ("TOPICBUS_POLL_INTERVAL_MS", "25"),
        ]
        .into_iter()
        .collect();

        let config = BusConfig::default().overlay(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.ipc_dir, PathBuf::from("/run/bus"));
        assert_eq!(config.port_base, 30000);
        assert_eq!(config.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.network_host, DEFAULT_NETWORK_HOST);
    }

    #[test]
    fn overlay_ignores_garbage() {
        let config = BusConfig::default().overlay(|k| {
            (k == "TOPICBUS_SEND_HWM").then(|| "lots".to_string())
        });
        assert_eq!(config.send_hwm, 1000);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.json");
        std::fs::write(&path, r#"{"network_host": "10.0.0.5", "connect_mode": "eager"}"#).unwrap();

        let config = BusConfig::load(&path).unwrap();
        assert_eq!(config.network_host, "10.0.0.5");
        assert_eq!(config.connect_mode, ConnectMode::Eager);
        assert_eq!(config.port_span, DEFAULT_PORT_SPAN);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = BusConfig {
            poll_interval_ms: 0,
            send_hwm: 0,
            ..BusConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.send_capacity(), 1);
    }

    #[test]
    fn oversized_poll_interval_saturates() {
        let config = BusConfig::default().with_poll_interval(Duration::MAX);
        assert_eq!(config.poll_interval_ms, u64::MAX);

        let config = BusConfig::default().with_poll_interval(Duration::from_micros(2500));
        assert_eq!(config.poll_interval_ms, 2);
    }
}
