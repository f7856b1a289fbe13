use std::collections::BTreeMap;
use std::fmt;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::spec::PipelineSpec;

/// Context keys that must be known before any stage runs.
pub const REQUIRED_CONTEXT: [&str; 4] = ["dataset", "working", "root", "src_root"];

/// A scalar configuration value, stringified when it enters the naming
/// context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Str(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Str(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Str(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

/// Provenance logging options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub enabled: bool,
    /// Template of the directory receiving one sub-directory per run.
    pub log_dir: String,
    /// Template of a stage's own directory; `{stage}` is its `dir_name`.
    pub stage_dir: String,
    /// Glob patterns of source files recorded in the manifest.
    pub sources: Vec<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: "{root}/{dataset}/logs".to_string(),
            stage_dir: "{root}/{dataset}/{stage}".to_string(),
            sources: Vec::new(),
        }
    }
}

fn default_workers() -> usize {
    1
}

/// Everything a pipeline run is configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Initial naming context.
    #[serde(default)]
    pub context: BTreeMap<String, Scalar>,
    /// Worker threads for per-iteration fan-out within a stage.
    #[serde(default = "default_workers")]
    pub n_workers: usize,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub pipeline: PipelineSpec,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            context: BTreeMap::new(),
            n_workers: default_workers(),
            logging: LoggingSettings::default(),
            pipeline: PipelineSpec::default(),
        }
    }
}

impl Settings {
    pub fn new(pipeline: PipelineSpec) -> Self {
        Self {
            pipeline,
            ..Default::default()
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|e| anyhow::anyhow!("{path}: {e}"))
    }

    /// Sets an entry of the initial naming context.
    pub fn with_context(mut self, key: &str, value: impl Into<Scalar>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_logging(mut self, logging: LoggingSettings) -> Self {
        self.logging = logging;
        self
    }

    /// Checks that every key of [`REQUIRED_CONTEXT`] is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match REQUIRED_CONTEXT
            .iter()
            .find(|key| !self.context.contains_key(**key))
        {
            Some(key) => Err(ConfigError::MissingInitialKey(key.to_string())),
            None => Ok(()),
        }
    }

    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
