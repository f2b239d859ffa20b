use std::path::PathBuf;

use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::Value;

use crate::timeq::Cycle;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub trace: Option<PathBuf>,
    pub log_level: u64,
    pub timeout: Cycle,
    pub memory_latency: Cycle,
    /// Turnaround of the stand-in upstream caches.
    pub peer_latency: Cycle,
    pub stats_json: Option<PathBuf>,
}

pub trait Config: DeserializeOwned + Default {
    /// Reject values that deserialize fine but cannot be simulated.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        let config: Self = match section {
            Some(value) => value
                .clone()
                .try_into()
                .context("cannot deserialize config section")?,
            None => {
                warn!("config section not found, using defaults");
                Self::default()
            }
        };
        config.validate().context("invalid config section")?;
        Ok(config)
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            trace: None,
            log_level: 0,
            timeout: 1_000_000,
            memory_latency: 20,
            peer_latency: 2,
            stats_json: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_section_keeps_defaults() {
        let value: Value = toml::from_str("memory_latency = 3\ntrace = \"run.toml\"").unwrap();
        let config = SimConfig::from_section(Some(&value)).unwrap();
        assert_eq!(config.memory_latency, 3);
        assert_eq!(config.trace, Some(PathBuf::from("run.toml")));
        assert_eq!(config.timeout, SimConfig::default().timeout);
    }

    #[test]
    fn bad_section_is_an_error() {
        let value: Value = toml::from_str("timeout = \"soon\"").unwrap();
        assert!(SimConfig::from_section(Some(&value)).is_err());
    }
}
