//! Runtime configuration, loaded from TOML and overridable from the CLI.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::decode::{FileStrategy, Profile, Registry, ValueStrategy};
use crate::trace::TraceOutput;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
pub const DEFAULT_PATH: &str = "/datastore";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1000;
pub const DEFAULT_MULTIPART_MEMORY_BYTES: u64 = 50;
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// When the urlencoded form is written to the trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FormTrace {
    /// Only when parsing reported an error.
    #[default]
    OnFailure,
    OnSuccess,
    Always,
}

impl FormTrace {
    pub fn should_log(self, failed: bool) -> bool {
        match self {
            FormTrace::OnFailure => failed,
            FormTrace::OnSuccess => !failed,
            FormTrace::Always => true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: String,
    pub path: String,
    pub profile: Profile,
    /// Decoded payloads longer than this are cut before being traced.
    pub max_output_bytes: usize,
    /// File bytes kept in memory before parts spill to disk.
    pub multipart_memory_bytes: u64,
    pub max_body_bytes: usize,
    pub form_trace: FormTrace,
    pub trace_output: TraceOutput,
    /// Per-field overrides on top of the profile.
    pub files: BTreeMap<String, FileStrategy>,
    pub values: BTreeMap<String, ValueStrategy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_owned(),
            path: DEFAULT_PATH.to_owned(),
            profile: Profile::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            multipart_memory_bytes: DEFAULT_MULTIPART_MEMORY_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            form_trace: FormTrace::default(),
            trace_output: TraceOutput::default(),
            files: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.listen.parse::<SocketAddr>().is_err() {
            problems.push(format!("listen {:?} is not a socket address", self.listen));
        }
        if !self.path.starts_with('/') {
            problems.push(format!("path {:?} must start with '/'", self.path));
        }
        if self.max_output_bytes == 0 {
            problems.push("max_output_bytes must be greater than 0".to_owned());
        }
        if self.max_body_bytes == 0 {
            problems.push("max_body_bytes must be greater than 0".to_owned());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::Invalid(vec![format!("listen {:?} is not a socket address", self.listen)]))
    }

    pub fn registry(&self) -> Registry {
        let mut registry = Registry::for_profile(self.profile);
        for (field, strategy) in &self.files {
            registry.set_file(field, *strategy);
        }
        for (field, strategy) in &self.values {
            registry.set_value(field, *strategy);
        }
        registry
    }
}
