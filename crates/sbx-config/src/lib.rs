#![warn(missing_docs)]

//! # sbx-config
//!
//! Configuration loading for the sbx sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//! Every key is optional; absent keys keep the library defaults.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 5000
//! guard_margin_ms = 2000
//! max_heap_mb = 64
//! max_code_kb = 256
//! max_concurrent = 32
//! max_unwrap_depth = 32
//! max_modules = 256
//! module_paths = ["${HOME}/sbx/node_modules"]
//! circular_marker = "[Circular]"
//! worker_bin = "/usr/local/bin/sbx-worker"
//! inherit_worker_stderr = false
//! worker_log_filter = "warn,sbx::console=info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sbx::host::MAX_CONCURRENT_LIMIT;
use sbx::SandboxConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "SBX_CONFIG";

/// Config file looked for in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "sbx.toml";

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level sbx configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SbxConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Default execution timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Orchestrator guard margin in milliseconds.
    #[serde(default)]
    pub guard_margin_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum source size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,

    /// Maximum concurrent worker processes.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Bound on nested thenable unwrapping.
    #[serde(default)]
    pub max_unwrap_depth: Option<usize>,

    /// Bound on modules preloaded per execution.
    #[serde(default)]
    pub max_modules: Option<usize>,

    /// Module search roots for the `require` escape hatch.
    #[serde(default)]
    pub module_paths: Option<Vec<PathBuf>>,

    /// Replacement for cyclic references.
    #[serde(default)]
    pub circular_marker: Option<String>,

    /// Explicit worker binary.
    #[serde(default)]
    pub worker_bin: Option<PathBuf>,

    /// Let worker stderr through.
    #[serde(default)]
    pub inherit_worker_stderr: Option<bool>,

    /// `EnvFilter` directives for the worker.
    #[serde(default)]
    pub worker_log_filter: Option<String>,
}

impl SbxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: SbxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    /// Locate and load the config: `explicit`, then `$SBX_CONFIG`, then
    /// `./sbx.toml`. Returns the defaults when none of them exists.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file_with_env(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::from_file_with_env(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            tracing::debug!(path = %local.display(), "using local config file");
            return Self::from_file_with_env(local);
        }
        Ok(Self::default())
    }

    /// Apply the overrides on top of the library defaults.
    pub fn to_sandbox_config(&self) -> SandboxConfig {
        let o = &self.sandbox;
        let mut config = SandboxConfig::default();
        if let Some(ms) = o.timeout_ms {
            config.default_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = o.guard_margin_ms {
            config.guard_margin = Duration::from_millis(ms);
        }
        if let Some(mb) = o.max_heap_mb {
            config.max_heap_size = mb.saturating_mul(MIB);
        }
        if let Some(kb) = o.max_code_kb {
            config.max_code_size = kb.saturating_mul(KIB);
        }
        if let Some(n) = o.max_concurrent {
            config.max_concurrent = n;
        }
        if let Some(n) = o.max_unwrap_depth {
            config.max_unwrap_depth = n;
        }
        if let Some(n) = o.max_modules {
            config.max_modules = n;
        }
        if let Some(paths) = &o.module_paths {
            config.module_paths = paths.clone();
        }
        if let Some(marker) = &o.circular_marker {
            config.circular_marker = marker.clone();
        }
        if let Some(bin) = &o.worker_bin {
            config.worker_bin = Some(bin.clone());
        }
        if let Some(inherit) = o.inherit_worker_stderr {
            config.inherit_worker_stderr = inherit;
        }
        if let Some(filter) = &o.worker_log_filter {
            config.worker_log_filter = filter.clone();
        }
        config
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.sandbox;
        let zero = [
            ("timeout_ms", o.timeout_ms == Some(0)),
            ("guard_margin_ms", o.guard_margin_ms == Some(0)),
            ("max_heap_mb", o.max_heap_mb == Some(0)),
            ("max_code_kb", o.max_code_kb == Some(0)),
            ("max_concurrent", o.max_concurrent == Some(0)),
            ("max_unwrap_depth", o.max_unwrap_depth == Some(0)),
            ("max_modules", o.max_modules == Some(0)),
        ];
        for (name, is_zero) in zero {
            if is_zero {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be greater than zero"
                )));
            }
        }
        let scaled = [
            ("max_heap_mb", o.max_heap_mb, MIB),
            ("max_code_kb", o.max_code_kb, KIB),
        ];
        for (name, value, unit) in scaled {
            if value.is_some_and(|v| v.checked_mul(unit).is_none()) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} is too large to express in bytes"
                )));
            }
        }
        if o.max_concurrent.is_some_and(|n| n > MAX_CONCURRENT_LIMIT) {
            return Err(ConfigError::Invalid(format!(
                "sandbox.max_concurrent must be at most {MAX_CONCURRENT_LIMIT}"
            )));
        }
        if o.circular_marker.as_deref() == Some("") {
            return Err(ConfigError::Invalid(
                "sandbox.circular_marker must not be empty".into(),
            ));
        }
        if let Some(bin) = &o.worker_bin {
            if !bin.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.worker_bin must be an absolute path, got: {}",
                    bin.display()
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unset variables stay as written.
                Err(_) => result.push_str(&format!("${{{var_name}}}")),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
