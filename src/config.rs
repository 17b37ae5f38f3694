//! Daemon configuration, loaded from YAML.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::context::NodeRole;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub role: NodeRole,
    pub max_ue: usize,
    pub max_pdn_per_ue: usize,
    pub retry: RetrySettings,
    pub ue_pool: UePoolSettings,
    pub charging: ChargingSettings,
    pub usage: UsageSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            role: NodeRole::Saegw,
            max_ue: 1024,
            max_pdn_per_ue: 4,
            retry: RetrySettings::default(),
            ue_pool: UePoolSettings::default(),
            charging: ChargingSettings::default(),
            usage: UsageSettings::default(),
        }
    }
}

/// South-bound request retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_count: u32,
    pub interval_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_count: 3,
            interval_secs: 3,
        }
    }
}

/// UE address pool, terminal role only
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UePoolSettings {
    pub base: Ipv4Addr,
    pub size: u32,
}

impl Default for UePoolSettings {
    fn default() -> Self {
        Self {
            base: Ipv4Addr::new(10, 45, 0, 2),
            size: 0xffff,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChargingSettings {
    /// Destination key handed to the charging sink
    pub destination: String,
    pub max_record_len: usize,
}

impl Default for ChargingSettings {
    fn default() -> Self {
        Self {
            destination: "cdr0".to_string(),
            max_record_len: 2048,
        }
    }
}

/// Usage-reporting thresholds installed on each bearer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    pub volume_threshold: u64,
    pub time_threshold: u32,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            volume_threshold: 1_000_000_000,
            time_threshold: 3600,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: AppConfig =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.role, NodeRole::Saegw);
        assert_eq!(config.retry.max_count, 3);
        assert_eq!(config.charging.destination, "cdr0");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
role: sgwc
max_ue: 64
retry:
  max_count: 5
ue_pool:
  base: 10.46.0.2
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.role, NodeRole::Sgwc);
        assert_eq!(config.max_ue, 64);
        assert_eq!(config.retry.max_count, 5);
        // unset sections keep their defaults
        assert_eq!(config.retry.interval_secs, 3);
        assert_eq!(config.ue_pool.base, Ipv4Addr::new(10, 46, 0, 2));
        assert_eq!(config.max_pdn_per_ue, 4);
    }
}
