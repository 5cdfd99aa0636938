//! Schema propagation and validation
//!
//! Threads the input schema through every step before any SQL is rendered,
//! so structural mistakes fail fast. The check is by name only; row-level
//! type problems surface at execution time.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::registry::Pipeline;
use crate::schema::{Column, ColumnType, Schema};
use crate::step::Step;

/// Where an overwritten column ends up in the downstream schema
///
/// A column is overwritten when a step both requires and emits it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapRule {
    /// Remove from its position and append in emitted order, as
    /// `SELECT * EXCLUDE (col), f(col) AS col` does
    #[default]
    MoveToEnd,
    /// Keep the upstream position
    KeepPosition,
}

impl std::str::FromStr for OverlapRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "move_to_end" => Ok(Self::MoveToEnd),
            "keep_position" => Ok(Self::KeepPosition),
            _ => Err(format!("Unknown overlap rule: {}", s)),
        }
    }
}

/// Schema snapshots of a validated pipeline
///
/// Always holds at least the input schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTrace")]
pub struct SchemaTrace {
    snapshots: Vec<Schema>,
}

#[derive(Deserialize)]
struct RawTrace {
    snapshots: Vec<Schema>,
}

impl TryFrom<RawTrace> for SchemaTrace {
    type Error = String;

    fn try_from(raw: RawTrace) -> Result<Self, Self::Error> {
        if raw.snapshots.is_empty() {
            return Err("schema trace needs at least the input snapshot".to_string());
        }
        Ok(Self {
            snapshots: raw.snapshots,
        })
    }
}

impl SchemaTrace {
    /// Schema after the first `k` steps; `k = 0` is the input schema
    pub fn snapshot(&self, k: usize) -> Option<&Schema> {
        self.snapshots.get(k)
    }

    pub fn input(&self) -> &Schema {
        &self.snapshots[0]
    }

    pub fn final_schema(&self) -> &Schema {
        &self.snapshots[self.snapshots.len() - 1]
    }

    /// Number of steps traced
    pub fn steps(&self) -> usize {
        self.snapshots.len() - 1
    }

    pub fn snapshots(&self) -> &[Schema] {
        &self.snapshots
    }
}

/// Validates column requirements and computes each step's output schema
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaTracker {
    rule: OverlapRule,
}

impl SchemaTracker {
    pub fn new(rule: OverlapRule) -> Self {
        Self { rule }
    }

    pub fn rule(&self) -> OverlapRule {
        self.rule
    }

    /// Validate every step in order and record the schema after each
    pub fn trace(&self, pipeline: &Pipeline, input: &Schema) -> PipelineResult<SchemaTrace> {
        let mut snapshots = Vec::with_capacity(pipeline.len() + 1);
        snapshots.push(input.clone());

        for (i, step) in pipeline.steps().iter().enumerate() {
            let next = self.evolve(step.as_ref(), &snapshots[i])?;
            debug!(
                step = step.name(),
                position = i + 1,
                columns = next.len(),
                "Validated step schema"
            );
            snapshots.push(next);
        }

        Ok(SchemaTrace { snapshots })
    }

    /// Schema downstream of `step` given the upstream `schema`
    pub fn evolve(&self, step: &dyn Step, schema: &Schema) -> PipelineResult<Schema> {
        let required = step.required_columns();
        let dropped = step.dropped_columns();

        let mut missing = schema.missing(required);
        for name in schema.missing(dropped) {
            if !missing.contains(&name) {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::missing_column(step.name(), missing));
        }

        let mut next = schema.clone();
        for name in dropped {
            next.remove(name);
        }

        for column in step.emitted_columns() {
            let Some(upstream) = schema.get(&column.name) else {
                next.push_back(column.clone());
                continue;
            };

            if !required.contains(&column.name) {
                warn!(
                    step = step.name(),
                    column = %column.name,
                    "Step emits an existing column it does not require; treating as overwrite"
                );
            }

            let ty = match column.ty {
                ColumnType::Unknown => upstream.ty,
                ty => ty,
            };
            let overwritten = Column::new(column.name.clone(), ty);
            match self.rule {
                OverlapRule::MoveToEnd => next.push_back(overwritten),
                OverlapRule::KeepPosition => next.upsert(overwritten),
            }
        }

        Ok(next)
    }
}
