//! Static grid configuration, read once at startup.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use arcgrid_bus::{ReplicaId, ReplicaKind};
use serde::{Deserialize, Serialize};

use crate::error::{ReplError, Result};
use crate::quorum::QuorumPolicy;

/// One configured replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Replica id, used in channel names.
    pub id: ReplicaId,
    /// Kind of storage node.
    pub kind: ReplicaKind,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
}

/// A logical collection of replicas judged together by quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection id.
    pub id: String,
    /// Pillars holding the collection.
    pub pillar_ids: Vec<ReplicaId>,
    /// Pillar failures tolerated per operation.
    #[serde(default)]
    pub max_failures: usize,
}

/// Grid configuration consumed by the coordination layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Environment prefix of every channel name.
    pub environment: String,
    /// Configured replicas.
    pub replicas: Vec<ReplicaConfig>,
    /// Quorum collections.
    pub collections: Vec<CollectionConfig>,
    /// Default wait for a correlated reply (ms).
    pub reply_timeout_ms: u64,
    /// Attempts per correction before it is reported as failed.
    pub max_correction_attempts: u32,
    /// Failures tolerated by grid-wide batch jobs.
    pub batch_max_failures: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            environment: "DEV".to_string(),
            replicas: Vec::new(),
            collections: Vec::new(),
            reply_timeout_ms: 30_000,
            max_correction_attempts: 3,
            batch_max_failures: 0,
        }
    }
}

impl GridConfig {
    /// Load from a `.toml` or `.json` file and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: GridConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReplError::config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ReplError::config(e.to_string()))?
            }
            _ => {
                return Err(ReplError::config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(ReplError::config("environment must not be empty"));
        }
        if self.reply_timeout_ms == 0 {
            return Err(ReplError::config("reply_timeout_ms must be positive"));
        }
        if self.max_correction_attempts == 0 {
            return Err(ReplError::config("max_correction_attempts must be positive"));
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.id.as_str().trim().is_empty() {
                return Err(ReplError::config("replica id must not be empty"));
            }
            if !seen.insert(&replica.id) {
                return Err(ReplError::config(format!("duplicate replica id {}", replica.id)));
            }
        }

        for collection in &self.collections {
            for pillar in &collection.pillar_ids {
                if self.replica(pillar).is_none() {
                    return Err(ReplError::config(format!(
                        "collection {} names unknown pillar {}",
                        collection.id, pillar
                    )));
                }
            }
            QuorumPolicy::new(collection.pillar_ids.iter().cloned(), collection.max_failures)
                .map_err(|e| ReplError::config(format!("collection {}: {}", collection.id, e)))?;
        }
        Ok(())
    }

    /// Look up a replica.
    pub fn replica(&self, id: &ReplicaId) -> Option<&ReplicaConfig> {
        self.replicas.iter().find(|r| &r.id == id)
    }

    /// Replicas of one kind.
    pub fn replicas_of(&self, kind: ReplicaKind) -> impl Iterator<Item = &ReplicaConfig> {
        self.replicas.iter().filter(move |r| r.kind == kind)
    }

    /// Quorum policy of a collection.
    pub fn policy(&self, collection: &str) -> Result<QuorumPolicy> {
        let c = self
            .collections
            .iter()
            .find(|c| c.id == collection)
            .ok_or_else(|| ReplError::config(format!("unknown collection {}", collection)))?;
        QuorumPolicy::new(c.pillar_ids.iter().cloned(), c.max_failures)
    }

    /// Default reply wait.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample() -> GridConfig {
        GridConfig {
            environment: "TEST".to_string(),
            replicas: vec![
                ReplicaConfig {
                    id: ReplicaId::new("kb"),
                    kind: ReplicaKind::BitArchive,
                    name: None,
                },
                ReplicaConfig {
                    id: ReplicaId::new("sb"),
                    kind: ReplicaKind::BitArchive,
                    name: Some("State Library".to_string()),
                },
                ReplicaConfig {
                    id: ReplicaId::new("cs"),
                    kind: ReplicaKind::ChecksumArchive,
                    name: None,
                },
            ],
            collections: vec![CollectionConfig {
                id: "netarchive".to_string(),
                pillar_ids: vec![ReplicaId::new("kb"), ReplicaId::new("sb"), ReplicaId::new("cs")],
                max_failures: 1,
            }],
            ..GridConfig::default()
        }
    }

    #[test]
    fn test_default_values() {
        let config = GridConfig::default();
        assert_eq!(config.environment, "DEV");
        assert_eq!(config.reply_timeout_ms, 30_000);
        assert_eq!(config.max_correction_attempts, 3);
        assert!(config.replicas.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sample_validates_and_builds_policy() {
        let config = sample();
        config.validate().unwrap();
        let policy = config.policy("netarchive").unwrap();
        assert_eq!(policy.required(), 3);
        assert_eq!(policy.max_failures(), 1);
        assert_eq!(config.replicas_of(ReplicaKind::BitArchive).count(), 2);
    }

    #[test]
    fn test_unknown_pillar_rejected() {
        let mut config = sample();
        config.collections[0].pillar_ids.push(ReplicaId::new("ghost"));
        assert!(matches!(config.validate(), Err(ReplError::Config { .. })));
    }

    #[test]
    fn test_max_failures_at_pillar_count_rejected() {
        let mut config = sample();
        config.collections[0].max_failures = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_replica_rejected() {
        let mut config = sample();
        config.replicas.push(ReplicaConfig {
            id: ReplicaId::new("KB"),
            kind: ReplicaKind::ChecksumArchive,
            name: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
environment = "prod"
reply_timeout_ms = 5000

[[replicas]]
id = "kb"
kind = "BitArchive"

[[replicas]]
id = "cs"
kind = "ChecksumArchive"

[[collections]]
id = "netarchive"
pillar_ids = ["kb", "cs"]
max_failures = 1
"#
        )
        .unwrap();

        let config = GridConfig::from_file(file.path()).unwrap();
        assert_eq!(config.environment, "prod");
        assert_eq!(config.reply_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_correction_attempts, 3);
        assert_eq!(config.replicas.len(), 2);
        assert_eq!(config.policy("netarchive").unwrap().max_failures(), 1);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "environment": "test",
                "replicas": [{{"id": "kb", "kind": "BitArchive"}}],
                "collections": [{{"id": "c", "pillar_ids": ["kb"]}}]
            }}"#
        )
        .unwrap();

        let config = GridConfig::from_file(file.path()).unwrap();
        assert_eq!(config.replicas[0].id, ReplicaId::new("kb"));
        assert_eq!(config.policy("c").unwrap().max_failures(), 0);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(matches!(
            GridConfig::from_file(file.path()),
            Err(ReplError::Config { .. })
        ));
    }
}
