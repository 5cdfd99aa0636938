//! Address Pipeline - compile ordered SQL cleaning steps into one CTE query
//!
//! Provides:
//! - A step contract with declared required and emitted columns
//! - A registry that fixes step order and rejects duplicate names
//! - Schema propagation that fails before any SQL runs
//! - A compiler producing one `WITH ...` query for the whole chain, or any prefix of it
//! - An executor boundary over a pluggable query engine (DuckDB behind `duckdb-backend`)
//! - A migration ledger tracking per-step port status

pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod migration;
pub mod naming;
pub mod registry;
pub mod schema;
pub mod step;
pub mod tracker;

// Re-export commonly used types
pub use compiler::{
    CompiledQuery, CompiledStep, CteCompiler, InputTable, Materialisation, PipelinePlan,
    QuerySegment,
};
pub use config::{CompilerConfig, PipelineConfig, RunOptions};
pub use error::{EngineError, PipelineError, PipelineResult};
pub use executor::{ExecutionResult, Executor, QueryEngine, RunMode, RunReport, StepPreview};
pub use migration::{MigrationEntry, MigrationLedger, MigrationStatus, MigrationSummary};
pub use registry::{Pipeline, StepRegistry};
pub use schema::{Column, ColumnType, Schema};
pub use step::{Fragment, RenderContext, RenderedStep, SqlStep, Step, StepMeta};
pub use tracker::{OverlapRule, SchemaTrace, SchemaTracker};

#[cfg(feature = "duckdb-backend")]
pub use executor::duckdb::DuckDbEngine;
