use std::path::Path;

use serde::Deserialize;

use crate::Result;

/// Runtime settings for a service cache instance.
///
/// The cache takes its own copy at construction time so that two caches in
/// one process can run with different settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of the cluster this instance runs in. Federated updates carrying
    /// this cluster name are ignored.
    pub cluster_name: String,

    /// Prefer IPv4 frontends when a service carries both families.
    pub enable_ipv4: bool,

    /// Track the node's zone label and filter backends by zone hints.
    pub enable_service_topology: bool,

    /// Capacity of the service event channel. Producers block once full.
    pub service_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "default".into(),
            enable_ipv4: true,
            enable_service_topology: false,
            service_cache_size: 128,
        }
    }
}

impl Config {
    pub async fn try_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = tokio::fs::read_to_string(path).await?;
        let config = serde_yaml::from_str(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cluster_name, "default");
        assert!(config.enable_ipv4);
        assert!(!config.enable_service_topology);
        assert_eq!(config.service_cache_size, 128);
    }

    #[test]
    fn test_partial_yaml() {
        let config: Config =
            serde_yaml::from_str("cluster_name: east\nenable_service_topology: true\n").unwrap();
        assert_eq!(config.cluster_name, "east");
        assert!(config.enable_service_topology);
        assert_eq!(config.service_cache_size, 128);
    }
}
