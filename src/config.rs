//! Compiler and run configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::tracker::OverlapRule;

/// Environment variable prefix read by [`RunOptions::from_env`]
pub const ENV_PREFIX: &str = "PIPELINE_";

/// Options for compiling a pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Placement of overwritten columns
    pub overlap_rule: OverlapRule,
    /// Parse every rendered fragment before composing
    pub validate_fragments: bool,
    /// Terminal projection (empty = `SELECT *`)
    pub projection: Vec<String>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overlap_rule(mut self, rule: OverlapRule) -> Self {
        self.overlap_rule = rule;
        self
    }

    pub fn with_validate_fragments(mut self, validate: bool) -> Self {
        self.validate_fragments = validate;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Some(dup) = self
            .projection
            .iter()
            .enumerate()
            .find(|(i, c)| {
                self.projection[..*i]
                    .iter()
                    .any(|earlier| earlier.eq_ignore_ascii_case(c))
            })
            .map(|(_, c)| c)
        {
            return Err(format!("Projection lists column '{}' twice", dup));
        }
        Ok(())
    }

    pub fn with_projection<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Options for running a compiled pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Log every SQL segment before running it
    pub pretty_print_sql: bool,
    /// Run and preview every prefix before the real run
    pub debug_mode: bool,
    /// Include SQL in debug previews
    pub debug_show_sql: bool,
    /// Rows shown per debug preview (None = engine default of 10)
    pub debug_max_rows: Option<usize>,
    /// Materialise every fragment as a temporary table, one at a time
    pub debug_incremental: bool,
    /// Materialise the output of checkpointed steps
    pub checkpoints: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read options from `PIPELINE_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read options through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let flag = |name: &str| var(name).map(|v| parse_bool(&v)).unwrap_or(false);

        Self {
            pretty_print_sql: flag("PRETTY_PRINT_SQL"),
            debug_mode: flag("DEBUG_MODE"),
            debug_show_sql: flag("DEBUG_SHOW_SQL"),
            debug_max_rows: var("DEBUG_MAX_ROWS").and_then(|v| v.trim().parse().ok()),
            debug_incremental: flag("DEBUG_INCREMENTAL"),
            checkpoints: flag("CHECKPOINTS"),
        }
    }

    pub fn with_pretty_print_sql(mut self, enabled: bool) -> Self {
        self.pretty_print_sql = enabled;
        self
    }

    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    pub fn with_debug_show_sql(mut self, enabled: bool) -> Self {
        self.debug_show_sql = enabled;
        self
    }

    pub fn with_debug_max_rows(mut self, rows: usize) -> Self {
        self.debug_max_rows = Some(rows);
        self
    }

    pub fn with_debug_incremental(mut self, enabled: bool) -> Self {
        self.debug_incremental = enabled;
        self
    }

    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.checkpoints = enabled;
        self
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Combined configuration file
///
/// ```toml
/// [compiler]
/// overlap_rule = "keep_position"
/// validate_fragments = true
///
/// [run]
/// checkpoints = true
/// debug_max_rows = 20
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub compiler: CompilerConfig,
    pub run: RunOptions,
}

impl PipelineConfig {
    /// Parse and validate a TOML configuration
    pub fn from_toml_str(content: &str) -> PipelineResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(PipelineError::ConfigError)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Err(PipelineError::FileNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.run.debug_incremental && self.run.checkpoints {
            return Err("debug_incremental already materialises every step; disable checkpoints".to_string());
        }
        self.compiler.validate()
    }
}
