//! Runtime configuration for the manager and the RPC service.

use std::time::Duration;

/// Tunables for discovery cadence and channel establishment. Embeddable in a
/// larger serde configuration tree; every field has a default.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CastConfig {
    /// TCP/TLS dial timeout, also used as the socket write deadline and TCP
    /// keepalive interval.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Interval between discovery lookup kicks.
    #[serde(default = "default_lookup_interval_secs")]
    pub lookup_interval_secs: u64,
    /// DNS-SD service type reconciled into the device table.
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// When set, the RPC service opens a channel for every added device and
    /// closes it when the device expires.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            lookup_interval_secs: default_lookup_interval_secs(),
            service_type: default_service_type(),
            auto_connect: default_true(),
        }
    }
}

impl CastConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn lookup_interval(&self) -> Duration {
        Duration::from_secs(self.lookup_interval_secs)
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_lookup_interval_secs() -> u64 {
    60
}

fn default_service_type() -> String {
    "_googlecast._tcp".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::CastConfig;

    #[test]
    fn test_defaults() {
        let config = CastConfig::default();
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.lookup_interval_secs, 60);
        assert_eq!(config.service_type, "_googlecast._tcp");
        assert!(config.auto_connect);
    }

    #[test]
    fn test_empty_document_deserializes_to_defaults() {
        let config: CastConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, CastConfig::default());
    }
}
