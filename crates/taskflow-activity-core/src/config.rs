use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{ActivityError, BucketMap, Result};

const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// How `by_entity` applies `limit`/`offset` across shards.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EntityPagination {
    /// Merge every shard's window, sort globally, then paginate once.
    #[default]
    Global,
    /// Apply the caller's page on every shard and concatenate in shard order.
    PerShard,
}

/// Location and pool sizing for one shard database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl ShardConfig {
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            path: path.into(),
            pool_size: DEFAULT_POOL_SIZE,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    #[must_use]
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("shard-{index}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardingConfig {
    pub shard_count: usize,
    #[serde(default)]
    pub bucket_count: Option<usize>,
    #[serde(default)]
    pub bucket_mapping: Option<BTreeMap<usize, usize>>,
    #[serde(default)]
    pub entity_pagination: EntityPagination,
    pub shards: Vec<ShardConfig>,
}

impl ShardingConfig {
    /// One shard per path, default bucket layout.
    #[must_use]
    pub fn for_paths<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        let shards: Vec<ShardConfig> = paths.into_iter().map(ShardConfig::at).collect();
        Self {
            shard_count: shards.len(),
            bucket_count: None,
            bucket_mapping: None,
            entity_pagination: EntityPagination::default(),
            shards,
        }
    }

    /// Loads YAML (`.yaml`/`.yml`) or JSON configuration and validates it.
    ///
    /// # Errors
    /// Returns [`ActivityError::Configuration`] when the file cannot be read or
    /// decoded, and [`ActivityError::InvalidShardTopology`] when it describes an
    /// invalid topology.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ActivityError::Configuration(format!(
                "failed to read sharding config {}: {err}",
                path.display()
            ))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(config.resolve_relative_paths(base))
    }

    /// # Errors
    /// Returns a configuration or topology error for invalid input.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|err| {
            ActivityError::Configuration(format!("invalid sharding config YAML: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns a configuration or topology error for invalid input.
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|err| {
            ActivityError::Configuration(format!("invalid sharding config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything that can be checked without touching a shard.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] or
    /// [`ActivityError::Configuration`].
    pub fn validate(&self) -> Result<()> {
        if self.shards.len() != self.shard_count {
            return Err(ActivityError::InvalidShardTopology(format!(
                "shard_count is {} but {} shard descriptors are configured",
                self.shard_count,
                self.shards.len()
            )));
        }

        for (index, shard) in self.shards.iter().enumerate() {
            if shard.pool_size == 0 {
                return Err(ActivityError::Configuration(format!(
                    "shard {index}: pool_size MUST be >= 1"
                )));
            }
            if shard.path.as_os_str().is_empty() {
                return Err(ActivityError::Configuration(format!(
                    "shard {index}: path MUST be provided"
                )));
            }
        }

        self.bucket_map().map(|_| ())
    }

    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] for invalid bucket layouts.
    pub fn bucket_map(&self) -> Result<BucketMap> {
        BucketMap::from_config(
            self.shard_count,
            self.bucket_count,
            self.bucket_mapping.as_ref(),
        )
    }

    fn resolve_relative_paths(mut self, base: &Path) -> Self {
        for shard in &mut self.shards {
            let special = shard
                .path
                .to_str()
                .is_some_and(|raw| raw == ":memory:" || raw.starts_with("file:"));
            if shard.path.is_relative() && !special {
                shard.path = base.join(&shard.path);
            }
        }
        self
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
