//! Configuration types for a sampling run.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{EdgeGroup, Parameter, Workflow, WorkflowError, is_identifier};

/// Top-level configuration for a sampling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Scopes every table in the store. Reusing a name merges history.
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Path of the SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Sampling loop settings.
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Retry settings for store operations.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Stages and their edge groups.
    #[serde(default)]
    pub workflow: WorkflowDef,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            run_name: default_run_name(),
            database: default_database(),
            sampling: SamplingConfig::default(),
            retry: RetryConfig::default(),
            workflow: WorkflowDef::default(),
        }
    }
}

fn default_run_name() -> String {
    "rastrigin".to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("walker.db")
}

/// Settings for the sampling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Number of trials.
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Reuse outputs of configurations sharing a stage prefix.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            use_cache: default_use_cache(),
            random_seed: None,
        }
    }
}

fn default_samples() -> usize {
    100
}
fn default_use_cache() -> bool {
    true
}

/// Retry budget for store operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * base_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    50
}
fn default_base_delay_ms() -> u64 {
    1000
}

/// Serialized workflow: one entry per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub stages: Vec<StageDef>,
}

/// Serialized stage: its candidate edge groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    pub groups: Vec<EdgeGroup>,
}

impl Default for WorkflowDef {
    fn default() -> Self {
        rastrigin_workflow(0.01)
    }
}

impl TryFrom<WorkflowDef> for Workflow {
    type Error = WorkflowError;

    fn try_from(def: WorkflowDef) -> Result<Self, Self::Error> {
        Workflow::new(def.stages.into_iter().map(|s| s.groups).collect())
    }
}

/// Two-dimensional Rastrigin benchmark over `[-5, 5]²`.
///
/// Each dimension is one stage split into five groups covering adjacent
/// slices of the domain, so group selection and value selection both matter.
pub fn rastrigin_workflow(step: f64) -> WorkflowDef {
    let slices = [
        ("verylow", "ll", -5.0, -3.0 - step),
        ("low", "l", -3.0, -1.0 - step),
        ("mid", "m", -1.0, 1.0),
        ("high", "h", 1.0 + step, 3.0),
        ("veryhigh", "hh", 3.0 + step, 5.0),
    ];

    let stages = ["x", "y"]
        .iter()
        .enumerate()
        .map(|(dim, axis)| StageDef {
            groups: slices
                .iter()
                .map(|(group, suffix, min, max)| {
                    let param = format!("{axis}{suffix}");
                    let command = format!("$#{param}#$");
                    // Bounds are constants above, construction cannot fail.
                    let parameters = Parameter::double(&param, *min, *max, step)
                        .map(|p| vec![p])
                        .unwrap_or_default();
                    EdgeGroup::new(format!("{group}Vars{}", dim + 1), parameters, command)
                })
                .collect(),
        })
        .collect();

    WorkflowDef { stages }
}

impl SamplerConfig {
    /// Read and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: SamplerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.run_name) {
            return Err(ConfigError::InvalidRunName(self.run_name.clone()));
        }
        if self.sampling.samples == 0 {
            return Err(ConfigError::NoSamples);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoRetryAttempts);
        }
        self.build_workflow()?;
        Ok(())
    }

    /// Build the workflow described by this configuration.
    pub fn build_workflow(&self) -> Result<Workflow, WorkflowError> {
        Workflow::try_from(self.workflow.clone())
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Run name '{0}' must contain only letters, digits and underscores")]
    InvalidRunName(String),
    #[error("Sample count must be positive")]
    NoSamples,
    #[error("Retry budget must allow at least one attempt")]
    NoRetryAttempts,
    #[error("Invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_valid() {
        let config = SamplerConfig::default();
        assert!(config.validate().is_ok());
        let workflow = config.build_workflow().unwrap();
        assert_eq!(workflow.len(), 2);
        assert_eq!(workflow.stages()[0].groups().len(), 5);
    }

    #[test]
    fn test_rastrigin_slices_cover_domain() {
        let def = rastrigin_workflow(0.01);
        let groups = &def.stages[0].groups;
        assert_eq!(groups[0].name, "verylowVars1");
        assert_eq!(groups[0].parameters[0].min_value(), "-5");
        assert_eq!(groups[4].parameters[0].max_value(), "5");
        assert_eq!(groups[2].parameters[0].possibilities(), 201);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "run_name": "demo", "sampling": { "samples": 5 } }"#;
        let config: SamplerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.sampling.samples, 5);
        assert!(config.sampling.use_cache);
        assert_eq!(config.retry.max_attempts, 50);
        assert_eq!(config.workflow.stages.len(), 2);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = SamplerConfig {
            run_name: "my run".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRunName(_))));

        config.run_name = "ok".into();
        config.sampling.samples = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NoSamples)));

        config.sampling.samples = 1;
        config.workflow.stages.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Workflow(WorkflowError::Empty))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("walker.json");
        let json = r#"{
            "run_name": "pipeline",
            "workflow": { "stages": [ { "groups": [
                { "name": "trim", "parameters": [
                    { "type": "integer", "name": "quality", "min": 10, "max": 30, "step": 5 }
                ], "command": "trim -q $#quality#$" }
            ] } ] }
        }"#;
        fs::write(&path, json).unwrap();

        let config = SamplerConfig::load(&path).unwrap();
        let workflow = config.build_workflow().unwrap();
        assert_eq!(workflow.stages()[0].groups()[0].possibilities(), 5);

        assert!(matches!(
            SamplerConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_serialization() {
        let config = SamplerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SamplerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sampling.samples, config.sampling.samples);
        assert_eq!(parsed.workflow.stages.len(), 2);
    }
}
