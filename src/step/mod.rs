//! Step contract
//!
//! A step is a named, schema-declared SQL transformation. It only describes
//! work: [`Step::render`] produces SQL text reading from the virtual table it
//! is handed and never touches an engine.
//!
//! # Example
//!
//! ```rust
//! use address_pipeline::step::SqlStep;
//!
//! let step = SqlStep::new(
//!     "canonicalise_postcode",
//!     "SELECT * EXCLUDE (postcode), upper(postcode) AS postcode FROM {input}",
//! )
//! .requires(["postcode"])
//! .emits(["postcode"]);
//! ```

mod sql;

pub use sql::SqlStep;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;
use crate::naming;
use crate::schema::{Column, Schema};

/// Descriptive metadata for a step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMeta {
    pub description: Option<String>,
    pub group: Option<String>,
    /// Steps that must be registered before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// What a step sees when it renders
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Upstream virtual table the step must read from
    pub input: &'a str,
    /// Upstream schema
    pub schema: &'a Schema,
    /// 1-based position of the step in the pipeline
    pub index: usize,
    /// Name of the step being rendered
    pub step: &'a str,
}

impl RenderContext<'_> {
    /// Virtual table a fragment of this step compiles to
    pub fn fragment_table(&self, fragment: &str) -> String {
        naming::fragment_table(self.index, self.step, fragment)
    }
}

/// A single `SELECT`-shaped query body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: String,
    pub sql: String,
}

impl Fragment {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Output of [`Step::render`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStep {
    /// Fragments in dependency order; each becomes one CTE
    pub fragments: Vec<Fragment>,
    /// Fragment downstream steps read from (default: the last)
    pub output: Option<String>,
}

impl RenderedStep {
    /// One fragment named [`SqlStep::MAIN`]
    pub fn single(sql: impl Into<String>) -> Self {
        Self {
            fragments: vec![Fragment::new(SqlStep::MAIN, sql)],
            output: None,
        }
    }

    /// Name of the fragment downstream steps read from
    pub fn output_fragment(&self) -> Option<&str> {
        self.output
            .as_deref()
            .or_else(|| self.fragments.last().map(|f| f.name.as_str()))
    }
}

/// The contract every cleaning step satisfies
///
/// Implementations must be deterministic given the render context: no hidden
/// state, no dependence on anything other than the upstream name and schema.
pub trait Step: fmt::Debug + Send + Sync {
    /// Unique name within a pipeline
    fn name(&self) -> &str;

    /// Columns the step reads
    fn required_columns(&self) -> &[String];

    /// Columns the step produces
    fn emitted_columns(&self) -> &[Column];

    /// Upstream columns the step removes
    fn dropped_columns(&self) -> &[String] {
        &[]
    }

    fn meta(&self) -> Option<&StepMeta> {
        None
    }

    /// Materialise this step's output when running with checkpoints
    fn checkpoint(&self) -> bool {
        false
    }

    /// Statements to run once before the compiled query
    fn preludes(&self) -> &[String] {
        &[]
    }

    /// Self-check run at registration
    fn validate(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Render the step's SQL against the upstream table in `ctx`
    fn render(&self, ctx: &RenderContext<'_>) -> PipelineResult<RenderedStep>;
}
