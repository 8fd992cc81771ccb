use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Worker count must be at least 1")]
    ZeroWorkers,
}

/// What a backward pass does when node backward steps fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackwardFailurePolicy {
    /// Any failure fails the pass.
    #[default]
    Strict,
    /// A single failure is logged and reported in the outcome; two or more fail the pass.
    TolerateSingle,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on node backward steps running at once in concurrent mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub sequential_backward: bool,
    #[serde(default)]
    pub failure_policy: BackwardFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sequential_backward: false,
            failure_policy: BackwardFailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_sequential_backward(mut self, sequential: bool) -> Self {
        self.sequential_backward = sequential;
        self
    }

    pub fn with_failure_policy(mut self, policy: BackwardFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}
