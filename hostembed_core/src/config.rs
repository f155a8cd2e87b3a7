// Device configuration: read once, never mutated by lookups
use crate::error::{EmbeddingError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Replicas host tables are distributed over.
    pub replicas: usize,
    pub default_serialization_factor: usize,
    pub clip_indices: bool,
    /// Upper bound on rows gathered per serialized step, if any.
    pub max_shard_rows: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            replicas: 1,
            default_serialization_factor: 1,
            clip_indices: true,
            max_shard_rows: None,
        }
    }
}

impl DeviceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| EmbeddingError::io(path, e))?;
        let config: DeviceConfig = serde_json::from_str(&text).map_err(|e| {
            EmbeddingError::argument("config", format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), ?config, "loaded device config");
        Ok(config)
    }

    /// Loads `path` if given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.replicas < 1 {
            return Err(EmbeddingError::argument("replicas", "at least one replica is required"));
        }
        if self.default_serialization_factor < 1 {
            return Err(EmbeddingError::argument(
                "default_serialization_factor",
                "serialization factor must be at least 1",
            ));
        }
        if self.max_shard_rows == Some(0) {
            return Err(EmbeddingError::argument("max_shard_rows", "must be at least 1 when set"));
        }
        Ok(())
    }

    /// Serialization factor for a table with `rows` rows.
    ///
    /// Without `max_shard_rows` this is the configured default. With it, the
    /// smallest divisor of `rows` (no smaller than the default) whose shards
    /// fit under the bound.
    pub fn pick_serialization_factor(&self, rows: usize) -> Result<usize> {
        let Some(limit) = self.max_shard_rows else {
            return Ok(self.default_serialization_factor);
        };
        (self.default_serialization_factor.max(1)..=rows)
            .find(|factor| rows % factor == 0 && rows / factor <= limit)
            .ok_or_else(|| {
                EmbeddingError::argument(
                    "max_shard_rows",
                    format!(
                        "no serialization factor of {} rows yields shards of at most {} rows",
                        rows, limit
                    ),
                )
            })
    }
}
