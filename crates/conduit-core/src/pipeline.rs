//! Execution plan handed to an [`Engine`](crate::engine::Engine).
//!
//! A [`Config`] is an ordered list of stages, each an ordered list of steps,
//! plus the networks, volumes and secrets those steps reference by name. It
//! is immutable once built; backends only read it.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Step {
    /// Unique within a [`Config`]; backends use it as the step handle.
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<Bind>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub run_policy: RunPolicy,
}

/// Gate deciding whether a step runs given the outcome of earlier steps.
///
/// A step that declares no policy always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPolicy {
    /// Only while no earlier task failed, errored or was killed.
    OnSuccess,
    /// Only after an earlier task failed, errored or was killed.
    OnFailure,
    #[default]
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_quota: Option<u64>,
    #[serde(default)]
    pub cpu_set: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub driver: VolumeDriver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    #[serde(default, skip_serializing)]
    pub data: String,
}

/// Backing driver of a declared volume. Only `local` volumes are materialized
/// by the native backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum VolumeDriver {
    #[default]
    Local,
    Other(String),
}

impl From<String> for VolumeDriver {
    fn from(s: String) -> Self {
        if s.is_empty() || s == "local" {
            VolumeDriver::Local
        } else {
            VolumeDriver::Other(s)
        }
    }
}

impl From<VolumeDriver> for String {
    fn from(d: VolumeDriver) -> Self {
        match d {
            VolumeDriver::Local => "local".to_string(),
            VolumeDriver::Other(s) => s,
        }
    }
}

/// A `host:container[:mode]` volume binding.
///
/// `host` is either an absolute host path or the name of a declared volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Bind {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Bind {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

impl FromStr for Bind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "volume bind {s:?} is not of the form host:container[:ro|rw]"
                )))
            }
        };
        if source.is_empty() || target.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "volume bind {s:?} has an empty side"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

impl TryFrom<String> for Bind {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Bind> for String {
    fn from(b: Bind) -> Self {
        b.to_string()
    }
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)?;
        if self.read_only {
            f.write_str(":ro")?;
        }
        Ok(())
    }
}

impl Config {
    /// Parse and validate a YAML pipeline document.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Step names must be unique across all stages.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for step in self.steps() {
            if step.name.is_empty() {
                return Err(ConfigError::Invalid("step without a name".into()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate step name {:?}",
                    step.name
                )));
            }
        }
        let declared: HashSet<&str> = self.volumes.iter().map(|v| v.name.as_str()).collect();
        for step in self.steps() {
            for bind in &step.volumes {
                if !bind.source.starts_with('/') && !declared.contains(bind.source.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "step {:?} binds undeclared volume {:?}",
                        step.name, bind.source
                    )));
                }
            }
        }
        Ok(())
    }

    /// All steps in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps().find(|s| s.name == name)
    }
}
