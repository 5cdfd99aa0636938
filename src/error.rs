//! Error types for pipeline operations
//!
//! Structural errors (registration, schema validation, compilation) are raised
//! before any SQL reaches the engine. Only [`PipelineError::ExecutionError`]
//! comes from the engine itself.

use std::path::PathBuf;
use thiserror::Error;

/// Error reported by a [`QueryEngine`](crate::executor::QueryEngine)
#[derive(Error, Debug)]
#[error("{message}")]
pub struct EngineError {
    /// Engine message, verbatim
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl EngineError {
    /// Create an engine error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create an engine error wrapping the engine's native error
    pub fn with_source<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors that can occur while building, compiling or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Two steps registered under the same name
    #[error("Duplicate step name: '{0}'")]
    DuplicateStepName(String),

    /// Step requires columns the upstream schema doesn't provide
    #[error("Step '{step}' requires missing column(s): {}", .columns.join(", "))]
    MissingColumn { step: String, columns: Vec<String> },

    /// Step failed its own validation at registration
    #[error("Invalid step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    /// Step declares a dependency that is not registered before it
    #[error("Step '{step}' depends on '{dependency}', which is not registered before it")]
    UnknownDependency { step: String, dependency: String },

    /// Wrapping or concatenating fragments failed
    #[error("Compilation error{}: {message}", .step.as_ref().map(|s| format!(" in step '{s}'")).unwrap_or_default())]
    CompilationError {
        step: Option<String>,
        message: String,
    },

    /// Prefix length out of range
    #[error("Cannot compile prefix of {requested} step(s): pipeline has {available}")]
    InvalidPrefix { requested: usize, available: usize },

    /// Invalid input table reference or schema
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine rejected or failed to run the compiled query
    #[error("Execution failed{}: {message}", .step_name.as_ref().map(|s| format!(" (step '{s}')")).unwrap_or_default())]
    ExecutionError {
        sql: String,
        step_index: Option<usize>,
        step_name: Option<String>,
        message: String,
        #[source]
        source: EngineError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Illegal migration status transition or ledger problem
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML error
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// Create a missing-column error
    pub fn missing_column(step: impl Into<String>, columns: Vec<String>) -> Self {
        Self::MissingColumn {
            step: step.into(),
            columns,
        }
    }

    /// Create a compilation error attributed to a step
    pub fn compilation(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CompilationError {
            step: Some(step.into()),
            message: message.into(),
        }
    }

    /// Create a compilation error not tied to any step
    pub fn internal(message: impl Into<String>) -> Self {
        Self::CompilationError {
            step: None,
            message: message.into(),
        }
    }

    /// Create an invalid-step error
    pub fn invalid_step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStep {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Get the step name if the error is attributed to one
    pub fn step_name(&self) -> Option<&str> {
        match self {
            PipelineError::DuplicateStepName(step) => Some(step),
            PipelineError::MissingColumn { step, .. } => Some(step),
            PipelineError::InvalidStep { step, .. } => Some(step),
            PipelineError::UnknownDependency { step, .. } => Some(step),
            PipelineError::CompilationError { step, .. } => step.as_deref(),
            PipelineError::ExecutionError { step_name, .. } => step_name.as_deref(),
            _ => None,
        }
    }

    /// Check if this error was raised before anything ran against the engine
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PipelineError::DuplicateStepName(_)
                | PipelineError::MissingColumn { .. }
                | PipelineError::InvalidStep { .. }
                | PipelineError::UnknownDependency { .. }
                | PipelineError::CompilationError { .. }
                | PipelineError::InvalidPrefix { .. }
                | PipelineError::InvalidInput(_)
        )
    }

    /// Get the compiled SQL if this is an execution error
    pub fn sql(&self) -> Option<&str> {
        match self {
            PipelineError::ExecutionError { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::DuplicateStepName(name) => {
                format!(
                    "Duplicate step name: '{name}'\n\nHint: Every step in a pipeline needs a unique name."
                )
            }
            PipelineError::MissingColumn { step, columns } => {
                format!(
                    "Step '{step}' requires missing column(s): {}\n\nHint: Register a step that emits these columns earlier in the pipeline.",
                    columns.join(", ")
                )
            }
            PipelineError::InvalidPrefix {
                requested,
                available,
            } => {
                format!(
                    "Cannot compile prefix of {requested} step(s): pipeline has {available}\n\nHint: Use a prefix between 0 and {available}."
                )
            }
            PipelineError::ExecutionError {
                step_name: Some(step),
                message,
                ..
            } => {
                format!(
                    "Execution failed in step '{step}': {message}\n\nHint: Compile the prefix ending at this step to inspect it in isolation."
                )
            }
            _ => self.to_string(),
        }
    }
}
