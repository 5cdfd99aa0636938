//! Executor boundary
//!
//! The only component that talks to an engine. Compilation stays pure; the
//! executor submits the compiled SQL, turns engine failures into
//! [`PipelineError::ExecutionError`] and attributes them to a step where it
//! can.
//!
//! # Example
//!
//! ```rust,ignore
//! use address_pipeline::{CteCompiler, Executor, RunOptions};
//! use address_pipeline::executor::duckdb::DuckDbEngine;
//!
//! let plan = CteCompiler::default().plan(&pipeline, &input)?;
//! let executor = Executor::new(DuckDbEngine::memory()?, RunOptions::from_env());
//! let (result, report) = executor.run_plan(&plan)?;
//! println!("{} rows in {}", result.row_count(), report.duration_formatted());
//! ```

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;
mod result;

pub use result::ExecutionResult;

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::compiler::{CompiledQuery, PipelinePlan};
use crate::config::RunOptions;
use crate::error::{EngineError, PipelineError, PipelineResult};

/// Rows shown per debug preview when `debug_max_rows` is unset
pub const DEFAULT_PREVIEW_ROWS: usize = 10;

/// An analytical engine that runs SQL text
pub trait QueryEngine {
    /// Run a query and return its relation
    fn query(&self, sql: &str) -> Result<ExecutionResult, EngineError>;

    /// Run statements that return no relation
    fn execute(&self, sql: &str) -> Result<(), EngineError>;
}

impl<E: QueryEngine + ?Sized> QueryEngine for &E {
    fn query(&self, sql: &str) -> Result<ExecutionResult, EngineError> {
        (**self).query(sql)
    }

    fn execute(&self, sql: &str) -> Result<(), EngineError> {
        (**self).execute(sql)
    }
}

/// How a plan was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One CTE query
    Single,
    /// Checkpointed segments, each materialised
    Segmented,
    /// Every fragment materialised on its own
    Incremental,
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::Single => "single",
            RunMode::Segmented => "segmented",
            RunMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    /// Statements submitted to the engine, preludes included
    pub statements: usize,
    pub duration_ms: u64,
    /// Fingerprint of the full compiled query
    pub fingerprint: String,
    pub rows: usize,
}

impl RunReport {
    pub fn duration_formatted(&self) -> String {
        let secs = self.duration_ms / 1000;
        let mins = secs / 60;
        let remaining_secs = secs % 60;

        if mins > 0 {
            format!("{}m {}s", mins, remaining_secs)
        } else if secs > 0 {
            format!("{}s", secs)
        } else {
            format!("{}ms", self.duration_ms)
        }
    }
}

/// Result preview of one prefix, produced by [`Executor::debug`]
#[derive(Debug, Clone, PartialEq)]
pub struct StepPreview {
    pub index: usize,
    pub step: String,
    pub rows: usize,
    pub preview: String,
    pub sql: Option<String>,
}

/// Runs compiled queries against an engine
pub struct Executor<E> {
    engine: E,
    options: RunOptions,
}

impl<E: QueryEngine> Executor<E> {
    pub fn new(engine: E, options: RunOptions) -> Self {
        Self { engine, options }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Submit one compiled query
    pub fn run(&self, query: &CompiledQuery) -> PipelineResult<ExecutionResult> {
        self.log_sql("query", query.sql());
        let result = self
            .engine
            .query(query.sql())
            .map_err(|e| execution_error(query, query.sql(), 0, e))?;
        check_drift(query, &result);
        Ok(result)
    }

    /// Run the first `k` steps of a plan
    pub fn run_prefix(&self, plan: &PipelinePlan, k: usize) -> PipelineResult<ExecutionResult> {
        let query = plan.compile_prefix(k)?;
        self.run_preludes(plan)?;
        self.run(&query)
    }

    /// Run a plan in the mode selected by the run options
    pub fn run_plan(&self, plan: &PipelinePlan) -> PipelineResult<(ExecutionResult, RunReport)> {
        let full = plan.compile()?;
        let mode = self.mode(plan);
        let run_id = Uuid::new_v4().to_string();

        let _span = info_span!("pipeline_run", run_id = %run_id, mode = mode.name()).entered();
        let started_at = Utc::now();
        let start = Instant::now();

        info!(
            run_id = %run_id,
            mode = mode.name(),
            steps = plan.len(),
            "Starting pipeline run"
        );

        let mut statements = self.run_preludes(plan)?;

        if self.options.debug_mode && mode != RunMode::Incremental {
            let previews = self.debug_prefixes(plan)?;
            statements += previews.len();
        }

        let result = match mode {
            RunMode::Single => {
                statements += 1;
                self.run(&full)?
            }
            RunMode::Segmented => {
                let segments = plan.compile_segments()?;
                let count = segments.len();
                let mut last = None;
                for (i, segment) in segments.iter().enumerate() {
                    let statement = segment.statement();
                    self.log_sql(&format!("segment {}/{}", i + 1, count), &statement);
                    statements += 1;
                    let to_error =
                        |e| execution_error(&segment.query, &statement, segment.line_offset(), e);
                    match &segment.materialise_as {
                        Some(table) => {
                            self.engine.execute(&statement).map_err(to_error)?;
                            debug!(segment = i + 1, table = %table, "Materialised segment");
                        }
                        None => {
                            let result = self.engine.query(&statement).map_err(to_error)?;
                            check_drift(&segment.query, &result);
                            last = Some(result);
                        }
                    }
                }
                last.ok_or_else(|| PipelineError::internal("no final segment"))?
            }
            RunMode::Incremental => {
                let max_rows = self.preview_rows();
                for m in plan.materialisation_plan() {
                    let statement = m.statement();
                    self.log_sql(&m.table, &statement);
                    statements += 1;
                    let to_error = |sql: &str, e: EngineError| {
                        error!(step = %m.step, table = %m.table, error = %e, "Materialisation failed");
                        PipelineError::ExecutionError {
                            sql: sql.to_string(),
                            step_index: Some(m.index),
                            step_name: Some(m.step.clone()),
                            message: e.message.clone(),
                            source: e,
                        }
                    };
                    self.engine
                        .execute(&statement)
                        .map_err(|e| to_error(&statement, e))?;
                    debug!(step = %m.step, table = %m.table, "Materialised fragment");

                    let preview_sql = format!("SELECT * FROM {} LIMIT {}", m.table, max_rows);
                    statements += 1;
                    let sample = self
                        .engine
                        .query(&preview_sql)
                        .map_err(|e| to_error(&preview_sql, e))?;
                    info!(
                        step = %m.step,
                        table = %m.table,
                        "Materialised preview:\n{}",
                        sample.preview(max_rows)
                    );
                }
                statements += 1;
                self.run(&plan.compile_from_materialised()?)?
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            steps = plan.len(),
            rows = result.row_count(),
            duration_ms,
            "Pipeline run completed"
        );

        let report = RunReport {
            run_id,
            mode,
            started_at,
            statements,
            duration_ms,
            fingerprint: full.fingerprint(),
            rows: result.row_count(),
        };
        Ok((result, report))
    }

    /// Run every prefix and log a preview of each
    ///
    /// Stops at the first failing prefix, which is the first step whose SQL
    /// the engine rejects.
    pub fn debug(&self, plan: &PipelinePlan) -> PipelineResult<Vec<StepPreview>> {
        self.run_preludes(plan)?;
        self.debug_prefixes(plan)
    }

    fn debug_prefixes(&self, plan: &PipelinePlan) -> PipelineResult<Vec<StepPreview>> {
        let max_rows = self.preview_rows();
        let mut previews = Vec::with_capacity(plan.len());

        for (i, query) in plan.prefixes().enumerate() {
            let query = query?;
            let index = i + 1;
            let step = query
                .steps()
                .last()
                .map(|s| s.name.clone())
                .unwrap_or_default();

            let result = self.run(&query)?;
            let preview = result.preview(max_rows);

            if self.options.debug_show_sql {
                info!(step = %step, position = index, "Step SQL:\n{}", query.sql());
            }
            info!(
                step = %step,
                position = index,
                rows = result.row_count(),
                "Step preview:\n{}",
                preview
            );

            previews.push(StepPreview {
                index,
                step,
                rows: result.row_count(),
                preview,
                sql: self.options.debug_show_sql.then(|| query.sql().to_string()),
            });
        }

        Ok(previews)
    }

    fn preview_rows(&self) -> usize {
        self.options.debug_max_rows.unwrap_or(DEFAULT_PREVIEW_ROWS)
    }

    fn mode(&self, plan: &PipelinePlan) -> RunMode {
        if self.options.debug_incremental {
            RunMode::Incremental
        } else if self.options.checkpoints && plan.has_checkpoints() {
            RunMode::Segmented
        } else {
            RunMode::Single
        }
    }

    fn run_preludes(&self, plan: &PipelinePlan) -> PipelineResult<usize> {
        for sql in plan.preludes() {
            self.log_sql("prelude", sql);
            self.engine.execute(sql).map_err(|e| {
                error!(error = %e, "Prelude failed");
                PipelineError::ExecutionError {
                    sql: sql.clone(),
                    step_index: None,
                    step_name: None,
                    message: e.message.clone(),
                    source: e,
                }
            })?;
        }
        Ok(plan.preludes().len())
    }

    fn log_sql(&self, header: &str, sql: &str) {
        if self.options.pretty_print_sql {
            info!("-- {} --\n{}", header, sql);
        }
    }
}

fn execution_error(
    query: &CompiledQuery,
    sql: &str,
    line_offset: usize,
    err: EngineError,
) -> PipelineError {
    let step = query.locate_at(&err.message, line_offset);
    error!(
        step = step.map(|s| s.name.as_str()).unwrap_or("unknown"),
        error = %err.message,
        "Engine rejected query"
    );
    PipelineError::ExecutionError {
        sql: sql.to_string(),
        step_index: step.map(|s| s.index),
        step_name: step.map(|s| s.name.clone()),
        message: err.message.clone(),
        source: err,
    }
}

fn check_drift(query: &CompiledQuery, result: &ExecutionResult) {
    if !result.schema.same_names(query.schema()) {
        warn!(
            expected = %query.schema(),
            actual = %result.schema,
            "Result columns differ from the compiled schema"
        );
    }
}
