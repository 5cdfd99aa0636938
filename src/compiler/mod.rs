//! CTE compiler
//!
//! Turns a validated pipeline into one query made of common table
//! expressions, so the engine's optimiser sees the whole transformation chain
//! instead of one materialised result per step.
//!
//! # Example
//!
//! ```rust
//! use address_pipeline::{ColumnType, CteCompiler, InputTable, Schema, SqlStep, StepRegistry};
//!
//! let mut registry = StepRegistry::new();
//! registry.register(
//!     SqlStep::new("upper_postcode", "SELECT * EXCLUDE (postcode), upper(postcode) AS postcode FROM {input}")
//!         .requires(["postcode"])
//!         .emits(["postcode"]),
//! )?;
//! let pipeline = registry.into_pipeline();
//!
//! let input = InputTable::new("raw_addresses", Schema::new().with("postcode", ColumnType::String));
//! let plan = CteCompiler::default().plan(&pipeline, &input)?;
//!
//! let full = plan.compile()?;
//! assert_eq!(full.terminal(), "s1_upper_postcode__main");
//!
//! let identity = plan.compile_prefix(0)?;
//! assert_eq!(identity.sql(), "SELECT * FROM raw_addresses");
//! # Ok::<(), address_pipeline::PipelineError>(())
//! ```

mod lint;
mod query;

pub use lint::check_fragment;
pub use query::{CompiledQuery, CompiledStep, Materialisation, QuerySegment};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CompilerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::registry::Pipeline;
use crate::schema::Schema;
use crate::step::RenderContext;
use crate::tracker::{SchemaTrace, SchemaTracker};
use query::{Cte, compose};

/// Pseudo-step name used when the terminal projection names unknown columns
pub const TERMINAL_PROJECTION: &str = "terminal projection";

/// Table or view known to the engine, and its columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputTable {
    pub name: String,
    pub schema: Schema,
}

impl InputTable {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// A step after rendering
#[derive(Debug, Clone)]
struct PlannedStep {
    index: usize,
    name: String,
    fragments: Vec<(String, String)>,
    output: String,
    checkpoint: bool,
}

/// Compiles pipelines into CTE chains
#[derive(Debug, Clone, Default)]
pub struct CteCompiler {
    config: CompilerConfig,
}

impl CteCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Validate schemas and render every step once
    pub fn plan(&self, pipeline: &Pipeline, input: &InputTable) -> PipelineResult<PipelinePlan> {
        if input.name.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "input table name must not be empty".to_string(),
            ));
        }

        self.config.validate().map_err(PipelineError::ConfigError)?;

        let tracker = SchemaTracker::new(self.config.overlap_rule);
        let trace = tracker.trace(pipeline, &input.schema)?;

        if !self.config.projection.is_empty() {
            trace
                .final_schema()
                .project(&self.config.projection)
                .map_err(|missing| PipelineError::missing_column(TERMINAL_PROJECTION, missing))?;
        }

        let mut planned = Vec::with_capacity(pipeline.len());
        let mut seen = HashSet::new();
        let mut upstream = input.name.clone();

        for (i, step) in pipeline.steps().iter().enumerate() {
            let index = i + 1;
            let ctx = RenderContext {
                input: &upstream,
                schema: trace
                    .snapshot(i)
                    .ok_or_else(|| PipelineError::internal("schema trace is shorter than the pipeline"))?,
                index,
                step: step.name(),
            };
            let rendered = step.render(&ctx)?;

            if rendered.fragments.is_empty() {
                return Err(PipelineError::compilation(step.name(), "step rendered no fragments"));
            }

            let mut fragments = Vec::with_capacity(rendered.fragments.len());
            for fragment in &rendered.fragments {
                let table = ctx.fragment_table(&fragment.name);
                if table.eq_ignore_ascii_case(&input.name) {
                    return Err(PipelineError::compilation(
                        step.name(),
                        format!("input table '{}' collides with a generated table name", input.name),
                    ));
                }
                if !seen.insert(table.clone()) {
                    return Err(PipelineError::compilation(
                        step.name(),
                        format!("generated table name '{}' is not unique", table),
                    ));
                }
                if self.config.validate_fragments {
                    check_fragment(&fragment.sql).map_err(|e| {
                        PipelineError::compilation(
                            step.name(),
                            format!("fragment '{}': {}", fragment.name, e),
                        )
                    })?;
                }
                fragments.push((table, fragment.sql.clone()));
            }

            let output_name = rendered
                .output_fragment()
                .ok_or_else(|| PipelineError::compilation(step.name(), "no output fragment"))?;
            if !rendered.fragments.iter().any(|f| f.name == output_name) {
                return Err(PipelineError::compilation(
                    step.name(),
                    format!("output fragment '{}' was not rendered", output_name),
                ));
            }
            let output = ctx.fragment_table(output_name);

            debug!(
                step = step.name(),
                position = index,
                fragments = fragments.len(),
                output = %output,
                "Rendered step"
            );

            upstream = output.clone();
            planned.push(PlannedStep {
                index,
                name: step.name().to_string(),
                fragments,
                output,
                checkpoint: step.checkpoint(),
            });
        }

        let preludes = pipeline
            .steps()
            .iter()
            .flat_map(|s| s.preludes().iter().cloned())
            .fold(Vec::new(), |mut acc: Vec<String>, sql| {
                if !acc.contains(&sql) {
                    acc.push(sql);
                }
                acc
            });

        Ok(PipelinePlan {
            pipeline: pipeline.clone(),
            input: input.clone(),
            trace,
            steps: planned,
            preludes,
            projection: self.config.projection.clone(),
        })
    }

    /// Plan and compile the whole pipeline
    pub fn compile(&self, pipeline: &Pipeline, input: &InputTable) -> PipelineResult<CompiledQuery> {
        self.plan(pipeline, input)?.compile()
    }

    /// Plan and compile the first `k` steps
    pub fn compile_prefix(
        &self,
        pipeline: &Pipeline,
        input: &InputTable,
        k: usize,
    ) -> PipelineResult<CompiledQuery> {
        self.plan(pipeline, input)?.compile_prefix(k)
    }
}

/// A validated, rendered pipeline
///
/// Holds the schema snapshot and rendered fragments of every step, so any
/// prefix can be compiled without validating again.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pipeline: Pipeline,
    input: InputTable,
    trace: SchemaTrace,
    steps: Vec<PlannedStep>,
    preludes: Vec<String>,
    projection: Vec<String>,
}

impl PipelinePlan {
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn input(&self) -> &InputTable {
        &self.input
    }

    pub fn trace(&self) -> &SchemaTrace {
        &self.trace
    }

    /// Number of steps in the plan
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Schema after the first `k` steps
    pub fn schema_after(&self, k: usize) -> Option<&Schema> {
        self.trace.snapshot(k)
    }

    /// Prelude statements of all steps, in order, without repeats
    pub fn preludes(&self) -> &[String] {
        &self.preludes
    }

    pub fn has_checkpoints(&self) -> bool {
        self.steps.iter().any(|s| s.checkpoint)
    }

    /// Virtual table holding the output of the first `k` steps
    pub fn table_after(&self, k: usize) -> Option<&str> {
        match k {
            0 => Some(&self.input.name),
            _ => self.steps.get(k - 1).map(|s| s.output.as_str()),
        }
    }

    /// Compile the whole pipeline, applying the terminal projection
    pub fn compile(&self) -> PipelineResult<CompiledQuery> {
        let query = self.compile_range(1, self.steps.len(), &self.projection)?;
        info!(
            steps = self.steps.len(),
            fragments = query.fragment_count(),
            terminal = %query.terminal,
            "Compiled pipeline"
        );
        Ok(query)
    }

    /// Compile the first `k` steps, selecting every column of step `k`'s output
    pub fn compile_prefix(&self, k: usize) -> PipelineResult<CompiledQuery> {
        if k > self.steps.len() {
            return Err(PipelineError::InvalidPrefix {
                requested: k,
                available: self.steps.len(),
            });
        }
        self.compile_range(1, k, &[])
    }

    /// Every non-empty prefix, shortest first
    pub fn prefixes(&self) -> impl Iterator<Item = PipelineResult<CompiledQuery>> + '_ {
        (1..=self.steps.len()).map(|k| self.compile_prefix(k))
    }

    /// Split the chain after every checkpointed step
    ///
    /// Each non-final segment is materialised under the name of its last
    /// step's output table, which is exactly the name the next segment
    /// already reads from.
    pub fn compile_segments(&self) -> PipelineResult<Vec<QuerySegment>> {
        let total = self.steps.len();
        let mut segments = Vec::new();
        let mut start = 1;

        for step in &self.steps {
            if step.checkpoint && step.index < total {
                let query = self.compile_range(start, step.index, &[])?;
                segments.push(QuerySegment {
                    materialise_as: Some(step.output.clone()),
                    query,
                });
                start = step.index + 1;
            }
        }

        segments.push(QuerySegment {
            query: self.compile_range(start, total, &self.projection)?,
            materialise_as: None,
        });
        Ok(segments)
    }

    /// Query over the output of the last step once it has been materialised
    ///
    /// Used after [`materialisation_plan`](Self::materialisation_plan) has
    /// run; applies the terminal projection.
    pub fn compile_from_materialised(&self) -> PipelineResult<CompiledQuery> {
        let len = self.steps.len();
        self.compile_range(len + 1, len, &self.projection)
    }

    /// One `CREATE TEMP TABLE` per fragment, in execution order
    pub fn materialisation_plan(&self) -> Vec<Materialisation> {
        self.steps
            .iter()
            .flat_map(|step| {
                step.fragments.iter().map(move |(table, sql)| Materialisation {
                    index: step.index,
                    step: step.name.clone(),
                    table: table.clone(),
                    sql: sql.clone(),
                })
            })
            .collect()
    }

    /// Compose steps `from..=to` (1-based); an empty range selects from the
    /// output of step `from - 1`
    fn compile_range(
        &self,
        from: usize,
        to: usize,
        projection: &[String],
    ) -> PipelineResult<CompiledQuery> {
        let input = self
            .table_after(from.saturating_sub(1))
            .ok_or_else(|| PipelineError::internal(format!("no table before step {}", from)))?
            .to_string();
        let range: &[PlannedStep] = if from > to {
            &[]
        } else {
            self.steps
                .get(from - 1..to)
                .ok_or_else(|| PipelineError::internal(format!("step range {}..={} out of bounds", from, to)))?
        };

        let terminal = range
            .last()
            .map(|s| s.output.clone())
            .unwrap_or_else(|| input.clone());

        let ctes: Vec<Cte<'_>> = range
            .iter()
            .flat_map(|s| {
                s.fragments.iter().map(|(table, sql)| Cte {
                    table: table.as_str(),
                    sql: sql.as_str(),
                })
            })
            .collect();
        let (sql, spans) = compose(&ctes, &terminal, projection);

        let mut spans = spans.into_iter();
        let mut steps = Vec::with_capacity(range.len());
        for step in range {
            let mut lines: Option<(usize, usize)> = None;
            for _ in &step.fragments {
                let (start, end) = spans
                    .next()
                    .ok_or_else(|| PipelineError::internal("fragment spans out of step"))?;
                lines = Some(lines.map_or((start, end), |(s, _)| (s, end)));
            }
            steps.push(CompiledStep {
                index: step.index,
                name: step.name.clone(),
                tables: step.fragments.iter().map(|(t, _)| t.clone()).collect(),
                output: step.output.clone(),
                lines: lines.unwrap_or((0, 0)),
            });
        }

        let schema = self
            .trace
            .snapshot(to.max(from.saturating_sub(1)))
            .ok_or_else(|| PipelineError::internal("schema snapshot missing"))?;
        let schema = if projection.is_empty() {
            schema.clone()
        } else {
            schema
                .project(projection)
                .map_err(|missing| PipelineError::missing_column(TERMINAL_PROJECTION, missing))?
        };

        Ok(CompiledQuery {
            sql,
            terminal,
            input,
            schema,
            steps,
        })
    }
}
