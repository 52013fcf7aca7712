//! Cluster configuration.
//!
//! A `ClusterConfig` is built once (from a builder or a TOML file),
//! validated, and then shared read-only by a client for its whole lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Default number of send attempts per dispatch.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Default backoff scale (linear outer backoff and inner jitter ceiling).
pub const DEFAULT_BACKOFF_SCALE: Duration = Duration::from_millis(200);

/// Default wall-clock budget for recovering a lost master.
pub const DEFAULT_MASTER_RETRY_BUDGET: Duration = Duration::from_secs(60);

/// Default connect and socket io timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for every configured duration.
pub const MAX_CONFIG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Network location of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLocation {
    pub host: String,
    pub port: u16,
}

impl NodeLocation {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeLocation {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Validated, immutable cluster configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    cluster_id: String,
    nodes: BTreeMap<NodeId, NodeLocation>,
    max_attempts: u32,
    backoff_scale: Duration,
    master_retry_budget: Duration,
    connect_timeout: Duration,
}

impl ClusterConfig {
    /// Start building a configuration for the given cluster.
    pub fn builder(cluster_id: impl Into<String>) -> ClusterConfigBuilder {
        ClusterConfigBuilder {
            cluster_id: cluster_id.into(),
            nodes: BTreeMap::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_scale: DEFAULT_BACKOFF_SCALE,
            master_retry_budget: DEFAULT_MASTER_RETRY_BUDGET,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML configuration document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
        file.try_into()
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, NodeLocation> {
        &self.nodes
    }

    /// All configured node ids, in sorted order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn location(&self, node: &NodeId) -> Result<&NodeLocation> {
        self.nodes
            .get(node)
            .ok_or_else(|| ClientError::UnknownNode(node.clone()))
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff_scale(&self) -> Duration {
        self.backoff_scale
    }

    pub fn master_retry_budget(&self) -> Duration {
        self.master_retry_budget
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn validate(self) -> Result<Self> {
        if self.cluster_id.is_empty() {
            return Err(ClientError::InvalidConfig("cluster id is empty".into()));
        }
        if self.nodes.is_empty() {
            return Err(ClientError::InvalidConfig("node list empty".into()));
        }
        for (id, loc) in &self.nodes {
            if id.as_str().is_empty() {
                return Err(ClientError::InvalidConfig("empty node id".into()));
            }
            if loc.host.is_empty() || loc.port == 0 {
                return Err(ClientError::InvalidConfig(format!(
                    "node {} has invalid location {}",
                    id, loc
                )));
            }
        }
        if self.max_attempts == 0 {
            return Err(ClientError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "connect_timeout must be positive".into(),
            ));
        }
        for (name, value) in [
            ("backoff_scale", self.backoff_scale),
            ("master_retry_budget", self.master_retry_budget),
            ("connect_timeout", self.connect_timeout),
        ] {
            if value > MAX_CONFIG_DURATION {
                return Err(ClientError::InvalidConfig(format!(
                    "{} of {:?} exceeds {:?}",
                    name, value, MAX_CONFIG_DURATION
                )));
            }
        }
        Ok(self)
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Debug, Clone)]
pub struct ClusterConfigBuilder {
    cluster_id: String,
    nodes: BTreeMap<NodeId, NodeLocation>,
    max_attempts: u32,
    backoff_scale: Duration,
    master_retry_budget: Duration,
    connect_timeout: Duration,
}

impl ClusterConfigBuilder {
    /// Add a node. A second entry for the same id replaces the first.
    pub fn node(mut self, id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        self.nodes.insert(id.into(), NodeLocation::new(host, port));
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff_scale(mut self, scale: Duration) -> Self {
        self.backoff_scale = scale;
        self
    }

    pub fn master_retry_budget(mut self, budget: Duration) -> Self {
        self.master_retry_budget = budget;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ClusterConfig> {
        ClusterConfig {
            cluster_id: self.cluster_id,
            nodes: self.nodes,
            max_attempts: self.max_attempts,
            backoff_scale: self.backoff_scale,
            master_retry_budget: self.master_retry_budget,
            connect_timeout: self.connect_timeout,
        }
        .validate()
    }
}

/// On-disk TOML layout. Durations are given in seconds.
///
/// ```toml
/// cluster_id = "chr"
/// max_attempts = 3
/// backoff_scale = 0.2
/// master_retry_budget = 60.0
///
/// [nodes.n0]
/// host = "127.0.0.1"
/// port = 4000
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    cluster_id: String,
    nodes: BTreeMap<NodeId, NodeLocation>,
    max_attempts: Option<u32>,
    backoff_scale: Option<f64>,
    master_retry_budget: Option<f64>,
    connect_timeout: Option<f64>,
}

fn seconds(name: &str, value: Option<f64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| ClientError::InvalidConfig(format!("{} = {} is not a valid duration", name, secs))),
    }
}

impl TryFrom<ConfigFile> for ClusterConfig {
    type Error = ClientError;

    fn try_from(file: ConfigFile) -> Result<Self> {
        ClusterConfig {
            cluster_id: file.cluster_id,
            nodes: file.nodes,
            max_attempts: file.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_scale: seconds("backoff_scale", file.backoff_scale, DEFAULT_BACKOFF_SCALE)?,
            master_retry_budget: seconds(
                "master_retry_budget",
                file.master_retry_budget,
                DEFAULT_MASTER_RETRY_BUDGET,
            )?,
            connect_timeout: seconds("connect_timeout", file.connect_timeout, DEFAULT_CONNECT_TIMEOUT)?,
        }
        .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builder_defaults() {
        let config = ClusterConfig::builder("chr")
            .node("n0", "127.0.0.1", 4000)
            .node("n1", "127.0.0.1", 4001)
            .build()
            .unwrap();

        assert_eq!(config.cluster_id(), "chr");
        assert_eq!(config.node_ids(), vec![NodeId::from("n0"), NodeId::from("n1")]);
        assert_eq!(config.max_attempts(), DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.backoff_scale(), DEFAULT_BACKOFF_SCALE);
        assert_eq!(
            config.location(&"n1".into()).unwrap(),
            &NodeLocation::new("127.0.0.1", 4001)
        );
    }

    #[test]
    fn test_rejects_empty_node_set() {
        let err = ClusterConfig::builder("chr").build().unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = ClusterConfig::builder("chr")
            .node("n0", "localhost", 4000)
            .max_attempts(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_bad_location() {
        let err = ClusterConfig::builder("chr")
            .node("n0", "", 4000)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));

        let err = ClusterConfig::builder("chr")
            .node("n0", "localhost", 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_node_location() {
        let config = ClusterConfig::builder("chr")
            .node("n0", "localhost", 4000)
            .build()
            .unwrap();
        let err = config.location(&"n9".into()).unwrap_err();
        assert!(matches!(err, ClientError::UnknownNode(id) if id.as_str() == "n9"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
cluster_id = "ricky"
max_attempts = 3
backoff_scale = 0.5
master_retry_budget = 10.0

[nodes.n0]
host = "10.0.0.1"
port = 4000

[nodes.n1]
host = "10.0.0.2"
port = 4000
"#
        )
        .unwrap();

        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_id(), "ricky");
        assert_eq!(config.nodes().len(), 2);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.backoff_scale(), Duration::from_millis(500));
        assert_eq!(config.master_retry_budget(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_from_toml_rejects_negative_duration() {
        let err = ClusterConfig::from_toml(
            r#"
cluster_id = "chr"
backoff_scale = -1.0

[nodes.n0]
host = "localhost"
port = 4000
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_oversized_durations() {
        let err = ClusterConfig::from_toml(
            r#"
cluster_id = "chr"
master_retry_budget = 1.0e19

[nodes.n0]
host = "localhost"
port = 4000
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(ref m) if m.contains("master_retry_budget")));

        let err = ClusterConfig::builder("chr")
            .node("n0", "localhost", 4000)
            .backoff_scale(MAX_CONFIG_DURATION + Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(ref m) if m.contains("backoff_scale")));

        let config = ClusterConfig::builder("chr")
            .node("n0", "localhost", 4000)
            .master_retry_budget(MAX_CONFIG_DURATION)
            .build()
            .unwrap();
        assert_eq!(config.master_retry_budget(), MAX_CONFIG_DURATION);
    }

    #[test]
    fn test_from_toml_rejects_unknown_field() {
        let err = ClusterConfig::from_toml(
            r#"
cluster_id = "chr"
try_count = 2

[nodes.n0]
host = "localhost"
port = 4000
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ClusterConfig::from_file("/nonexistent/chr-client.toml").unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfig(_)));
    }
}
