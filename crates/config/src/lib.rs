//! Ambient config-loading surface for the surrounding process. The broker
//! core itself never parses config (§1 Out-of-scope); this crate exists so
//! `bin/broker-node` has somewhere to load node registrations, interval
//! overrides, and the MLNode client factory's base URL from, the way the
//! teacher's `strata-config` feeds `bin/strata-client`.

use std::collections::BTreeMap;

use serde::Deserialize;

use mlnet_primitives::HardwareSpec;

#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    pub inference_host: String,
    pub inference_port: u16,
    pub poc_host: String,
    pub poc_port: u16,
    pub max_concurrent: u32,
    #[serde(default)]
    pub hardware: Vec<HardwareSpec>,
    #[serde(default)]
    pub models: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "defaults::reconcile_secs")]
    pub reconcile_secs: u64,
    #[serde(default = "defaults::sync_secs")]
    pub sync_secs: u64,
    #[serde(default = "defaults::status_probe_secs")]
    pub status_probe_secs: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            reconcile_secs: defaults::reconcile_secs(),
            sync_secs: defaults::sync_secs(),
            status_probe_secs: defaults::status_probe_secs(),
        }
    }
}

mod defaults {
    pub fn reconcile_secs() -> u64 {
        30
    }
    pub fn sync_secs() -> u64 {
        60
    }
    pub fn status_probe_secs() -> u64 {
        60
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    /// Participant address used to tag chain submissions.
    pub participant: String,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl BrokerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            participant = "p1"

            [[nodes]]
            id = "n1"
            host = "10.0.0.1"
            inference_host = "10.0.0.1"
            inference_port = 8000
            poc_host = "10.0.0.1"
            poc_port = 8001
            max_concurrent = 4
        "#;
        let cfg = BrokerConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.nodes.len(), 1);
        assert_eq!(cfg.intervals.reconcile_secs, 30);
    }
}
