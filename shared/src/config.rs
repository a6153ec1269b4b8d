/// Cluster configuration module
/// Declares which backend services exist, which resources they expose, and
/// how commitments behave per resource. Loaded once at startup from YAML and
/// shared as an Arc across handlers and workers.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::duration::CommitmentDuration;
use crate::models::ResourceTopology;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Unreadable(String, String),
    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub availability_zones: Vec<String>,
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub mail: Option<MailConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub service_type: String,
    pub liquid: LiquidConfig,
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiquidConfig {
    pub endpoint: String,
    #[serde(default = "default_liquid_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_liquid_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_topology")]
    pub topology: ResourceTopology,
    #[serde(default)]
    pub has_capacity: bool,
    #[serde(default = "default_true")]
    pub has_quota: bool,
    #[serde(default)]
    pub handles_commitments: bool,
    #[serde(default)]
    pub commitment: Option<CommitmentConfig>,
    #[serde(default)]
    pub growth: Option<GrowthConfig>,
}

fn default_topology() -> ResourceTopology {
    ResourceTopology::Flat
}

fn default_true() -> bool {
    true
}

/// Commitment behavior for one resource. A resource without this section
/// does not accept commitments at all.
#[derive(Debug, Clone, Deserialize)]
pub struct CommitmentConfig {
    pub durations: Vec<CommitmentDuration>,
    #[serde(default)]
    pub min_confirm_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conversion: Option<ConversionConfig>,
}

/// Resources sharing a conversion identifier (and unit) are mutually
/// convertible at the ratio of their weights.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversionConfig {
    pub identifier: String,
    pub weight: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrowthConfig {
    pub multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    pub subject_template: String,
    pub body_template: String,
}

impl ClusterConfig {
    /// Load and validate the config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Unreadable(path.display().to_string(), e.to_string()))?;
        let config = Self::from_yaml(&raw)?;
        info!(
            services = config.services.len(),
            azs = config.availability_zones.len(),
            "Cluster configuration loaded from {}",
            path.display()
        );
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.availability_zones.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "availability_zones must not be empty".into(),
            ));
        }

        let mut seen_services = HashSet::new();
        for service in &self.services {
            if !seen_services.insert(service.service_type.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate service type: {}",
                    service.service_type
                )));
            }

            let mut seen_resources = HashSet::new();
            for resource in &service.resources {
                if !seen_resources.insert(resource.name.as_str()) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "duplicate resource {}/{}",
                        service.service_type, resource.name
                    )));
                }
                if let Some(commitment) = &resource.commitment {
                    if commitment.durations.is_empty() {
                        return Err(ConfigError::InvalidConfig(format!(
                            "resource {}/{} accepts commitments but has no durations",
                            service.service_type, resource.name
                        )));
                    }
                    if let Some(conversion) = &commitment.conversion {
                        if conversion.weight == 0 {
                            return Err(ConfigError::InvalidConfig(format!(
                                "conversion weight of {}/{} must be positive",
                                service.service_type, resource.name
                            )));
                        }
                    }
                }
                if let Some(growth) = &resource.growth {
                    if growth.multiplier < 1.0 || !growth.multiplier.is_finite() {
                        return Err(ConfigError::InvalidConfig(format!(
                            "growth multiplier of {}/{} must be >= 1.0",
                            service.service_type, resource.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn service(&self, service_type: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.service_type == service_type)
    }

    pub fn resource(&self, service_type: &str, name: &str) -> Option<&ResourceConfig> {
        self.service(service_type)?.resource(name)
    }
}

impl ServiceConfig {
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ResourceConfig {
    pub fn accepts_commitments(&self) -> bool {
        self.commitment.is_some()
    }

    pub fn conversion(&self) -> Option<&ConversionConfig> {
        self.commitment.as_ref()?.conversion.as_ref()
    }

    pub fn durations(&self) -> &[CommitmentDuration] {
        self.commitment
            .as_ref()
            .map(|c| c.durations.as_slice())
            .unwrap_or(&[])
    }

    pub fn min_confirm_date(&self) -> Option<DateTime<Utc>> {
        self.commitment.as_ref()?.min_confirm_date
    }

    pub fn growth_multiplier(&self) -> f64 {
        self.growth.as_ref().map(|g| g.multiplier).unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
availability_zones: [az-one, az-two]
services:
  - service_type: compute
    liquid:
      endpoint: http://liquid-compute:8080
    resources:
      - name: cores
        topology: az-aware
        has_capacity: true
        commitment:
          durations: ["1 hour", "2 hours", "10 hours"]
        growth:
          multiplier: 1.2
      - name: ram
        unit: MiB
        topology: az-aware
        has_capacity: true
  - service_type: storage
    liquid:
      endpoint: http://liquid-storage:8080
      timeout_secs: 10
    resources:
      - name: capacity
        unit: GiB
        has_capacity: true
        commitment:
          durations: ["1 year"]
          conversion:
            identifier: disk-space
            weight: 48
      - name: capacity-ssd
        unit: GiB
        has_capacity: true
        commitment:
          durations: ["1 year"]
          conversion:
            identifier: disk-space
            weight: 32
mail:
  subject_template: "Commitment confirmed in {{project}}"
  body_template: "Your commitment of {{amount}} {{unit}} {{resource}} is confirmed."
"#;

    #[test]
    fn test_sample_parses() {
        let config = ClusterConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.availability_zones, vec!["az-one", "az-two"]);
        assert_eq!(config.services.len(), 2);

        let cores = config.resource("compute", "cores").unwrap();
        assert!(cores.accepts_commitments());
        assert_eq!(cores.durations().len(), 3);
        assert_eq!(cores.growth_multiplier(), 1.2);
        assert_eq!(cores.topology, ResourceTopology::AzAware);

        let ram = config.resource("compute", "ram").unwrap();
        assert!(!ram.accepts_commitments());
        assert_eq!(ram.growth_multiplier(), 1.0);

        assert_eq!(config.service("storage").unwrap().liquid.timeout_secs, 10);
        assert_eq!(config.service("compute").unwrap().liquid.timeout_secs, 30);
    }

    #[test]
    fn test_conversion_config_round_trip() {
        let config = ClusterConfig::from_yaml(SAMPLE).unwrap();
        let hdd = config.resource("storage", "capacity").unwrap();
        let ssd = config.resource("storage", "capacity-ssd").unwrap();
        assert_eq!(hdd.conversion().unwrap().identifier, "disk-space");
        assert_eq!(hdd.conversion().unwrap().weight, 48);
        assert_eq!(ssd.conversion().unwrap().weight, 32);
        assert!(config.resource("compute", "cores").unwrap().conversion().is_none());
    }

    #[test]
    fn test_rejects_duplicate_service() {
        let raw = r#"
availability_zones: [az-one]
services:
  - service_type: compute
    liquid: { endpoint: "http://a" }
    resources: []
  - service_type: compute
    liquid: { endpoint: "http://b" }
    resources: []
"#;
        assert!(matches!(
            ClusterConfig::from_yaml(raw),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_empty_azs() {
        let raw = "availability_zones: []\nservices: []";
        assert!(ClusterConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn test_rejects_zero_weight_and_small_multiplier() {
        let raw = r#"
availability_zones: [az-one]
services:
  - service_type: storage
    liquid: { endpoint: "http://a" }
    resources:
      - name: capacity
        commitment:
          durations: ["1 year"]
          conversion: { identifier: disk, weight: 0 }
"#;
        assert!(ClusterConfig::from_yaml(raw).is_err());

        let raw = r#"
availability_zones: [az-one]
services:
  - service_type: compute
    liquid: { endpoint: "http://a" }
    resources:
      - name: cores
        growth: { multiplier: 0.5 }
"#;
        assert!(ClusterConfig::from_yaml(raw).is_err());
    }
}
