//! Configuration for directory nodes

use crate::directory::types::{ClusterId, HostId};
use crate::errors::ConfigError;
use crate::gsi::registrar::RegistrationStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Multi-cluster settings of a silo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiClusterOptions {
    /// Whether this cluster is part of a multi-cluster network at all.
    /// When false, global single instance registrations are owned immediately.
    pub has_multi_cluster_network: bool,

    /// Federation used before any configuration has been injected.
    pub default_multi_cluster: Vec<ClusterId>,

    /// Register grains without an explicit strategy as global single instance.
    pub use_global_single_instance_by_default: bool,

    /// Number of request rounds a registration makes before giving up as doubtful.
    pub global_single_instance_number_retries: u32,

    /// Period of the background reconciliation agent.
    #[serde(with = "duration_ms")]
    pub global_single_instance_retry_interval: Duration,

    /// Static gateways into each cluster.
    pub gateways: HashMap<ClusterId, Vec<HostId>>,
}

impl Default for MultiClusterOptions {
    fn default() -> Self {
        Self {
            has_multi_cluster_network: false,
            default_multi_cluster: Vec::new(),
            use_global_single_instance_by_default: true,
            global_single_instance_number_retries: 3,
            global_single_instance_retry_interval: Duration::from_secs(30),
            gateways: HashMap::new(),
        }
    }
}

/// Configuration for one directory silo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Name of the cluster this silo belongs to.
    pub cluster_id: ClusterId,

    /// Address other silos and clusters use to reach this silo.
    pub silo_address: HostId,

    /// Address the HTTP endpoint listens on (e.g., "0.0.0.0:11111").
    pub listen_address: String,

    /// Other silos of this cluster, used to place directory partitions.
    pub cluster_silos: Vec<HostId>,

    pub multi_cluster: MultiClusterOptions,

    /// Registration strategy per grain type, overriding the default.
    pub grain_strategies: HashMap<String, RegistrationStrategy>,

    /// Timeout of each remote request.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Delay before re-checking partition ownership on a forwarded request.
    #[serde(with = "duration_ms")]
    pub forward_retry_delay: Duration,

    /// Forwarding gives up after this many hops.
    pub max_forward_hops: u32,

    /// Minimum age of an activation before a nonexistent-activation removal is honoured.
    #[serde(with = "duration_ms")]
    pub lazy_deregistration_delay: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            cluster_id: ClusterId::new("default"),
            silo_address: HostId::new("127.0.0.1:11111"),
            listen_address: "127.0.0.1:11111".to_string(),
            cluster_silos: Vec::new(),
            multi_cluster: MultiClusterOptions::default(),
            grain_strategies: HashMap::new(),
            request_timeout: Duration::from_secs(5),
            forward_retry_delay: Duration::from_millis(200),
            max_forward_hops: 2,
            lazy_deregistration_delay: Duration::from_secs(1),
        }
    }
}

impl DirectoryConfig {
    /// Create a single-cluster configuration for `cluster_id`.
    pub fn new(cluster_id: impl Into<ClusterId>, silo_address: impl Into<String>) -> Self {
        let silo_address = silo_address.into();
        Self {
            cluster_id: cluster_id.into(),
            listen_address: silo_address.clone(),
            silo_address: HostId::new(silo_address),
            ..Default::default()
        }
    }

    /// Join a multi-cluster network whose initial federation is `clusters`.
    pub fn with_multi_cluster(mut self, clusters: Vec<ClusterId>) -> Self {
        self.multi_cluster.has_multi_cluster_network = true;
        self.multi_cluster.default_multi_cluster = clusters;
        self
    }

    /// Add a static gateway into `cluster`.
    pub fn with_gateway(mut self, cluster: ClusterId, gateway: HostId) -> Self {
        self.multi_cluster.gateways.entry(cluster).or_default().push(gateway);
        self
    }

    pub fn with_listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    pub fn with_cluster_silos(mut self, silos: Vec<HostId>) -> Self {
        self.cluster_silos = silos;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.multi_cluster.global_single_instance_number_retries = retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.multi_cluster.global_single_instance_retry_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_forward_retry_delay(mut self, delay: Duration) -> Self {
        self.forward_retry_delay = delay;
        self
    }

    pub fn with_lazy_deregistration_delay(mut self, delay: Duration) -> Self {
        self.lazy_deregistration_delay = delay;
        self
    }

    pub fn with_grain_strategy(
        mut self,
        grain_type: impl Into<String>,
        strategy: RegistrationStrategy,
    ) -> Self {
        self.grain_strategies.insert(grain_type.into(), strategy);
        self
    }

    /// Strategy used for grain types without an explicit entry.
    pub fn default_strategy(&self) -> RegistrationStrategy {
        if self.multi_cluster.use_global_single_instance_by_default {
            RegistrationStrategy::GlobalSingleInstance
        } else {
            RegistrationStrategy::ClusterLocal
        }
    }

    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_cluster_id(&self.cluster_id)?;
        if self.silo_address.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid("silo address must not be empty".into()));
        }
        if self.multi_cluster.global_single_instance_number_retries == 0 {
            return Err(ConfigError::Invalid(
                "global_single_instance_number_retries must be at least 1".into(),
            ));
        }
        for cluster in &self.multi_cluster.default_multi_cluster {
            validate_cluster_id(cluster)?;
        }
        Ok(())
    }
}

fn validate_cluster_id(cluster: &ClusterId) -> Result<(), ConfigError> {
    if cluster.as_str().trim().is_empty() {
        return Err(ConfigError::Invalid("cluster id must not be empty".into()));
    }
    if cluster.as_str().contains(',') {
        return Err(ConfigError::Invalid(format!(
            "cluster id '{}' must not contain a comma",
            cluster
        )));
    }
    Ok(())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DirectoryConfig::default();
        assert_eq!(config.multi_cluster.global_single_instance_number_retries, 3);
        assert_eq!(
            config.multi_cluster.global_single_instance_retry_interval,
            Duration::from_secs(30)
        );
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_forward_hops, 2);
        assert!(!config.multi_cluster.has_multi_cluster_network);
        assert_eq!(config.default_strategy(), RegistrationStrategy::GlobalSingleInstance);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DirectoryConfig::new("A", "a:1")
            .with_multi_cluster(vec!["A".into(), "B".into()])
            .with_gateway("B".into(), HostId::new("b:1"))
            .with_retries(5);

        assert!(config.multi_cluster.has_multi_cluster_network);
        assert_eq!(config.multi_cluster.default_multi_cluster.len(), 2);
        assert_eq!(config.multi_cluster.gateways[&ClusterId::new("B")], vec![HostId::new("b:1")]);
        assert_eq!(config.multi_cluster.global_single_instance_number_retries, 5);
        assert_eq!(config.listen_address, "a:1");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(DirectoryConfig::new("", "a:1").validate().is_err());
        assert!(DirectoryConfig::new("a,b", "a:1").validate().is_err());
        assert!(DirectoryConfig::new("A", "a:1").with_retries(0).validate().is_err());
        assert!(DirectoryConfig::new("A", "a:1")
            .with_multi_cluster(vec![" ".into()])
            .validate()
            .is_err());
    }

    #[test]
    fn test_parse_json_with_millisecond_durations() {
        let json = r#"{
            "cluster_id": "us-east",
            "silo_address": "10.0.0.1:11111",
            "request_timeout": 1500,
            "multi_cluster": {
                "has_multi_cluster_network": true,
                "default_multi_cluster": ["us-east", "eu-west"],
                "global_single_instance_retry_interval": 10000,
                "gateways": { "eu-west": ["10.1.0.1:11111"] }
            },
            "grain_strategies": { "Session": "ClusterLocal" }
        }"#;
        let config: DirectoryConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.cluster_id, ClusterId::new("us-east"));
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.multi_cluster.global_single_instance_retry_interval,
            Duration::from_secs(10)
        );
        assert_eq!(config.multi_cluster.global_single_instance_number_retries, 3);
        assert_eq!(config.grain_strategies["Session"], RegistrationStrategy::ClusterLocal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let err = DirectoryConfig::from_file("/nonexistent/geodirectory.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
