//! Step migration ledger
//!
//! Tracks, per step, whether its SQL has been ported and whether the port
//! has been verified against reference output. Verification records the
//! fingerprint of the prefix query it was checked with, so a later change to
//! any step up to and including it marks the entry stale.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compiler::PipelinePlan;
use crate::error::{PipelineError, PipelineResult};
use crate::registry::Pipeline;

/// Migration status of one step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    #[default]
    Pending,
    Ported,
    Verified,
}

impl MigrationStatus {
    pub fn name(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Ported => "ported",
            MigrationStatus::Verified => "verified",
        }
    }

    /// Whether a step may move from `self` to `next`
    pub fn can_transition_to(self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        matches!(
            (self, next),
            (Pending, Ported) | (Ported, Verified) | (Verified, Ported) | (Verified, Verified)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "ported" => Ok(Self::Ported),
            "verified" => Ok(Self::Verified),
            _ => Err(format!("Unknown migration status: {}", s)),
        }
    }
}

/// Ledger entry for one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEntry {
    pub status: MigrationStatus,
    pub updated_at: DateTime<Utc>,
    /// Fingerprint of the prefix query the step was verified with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl MigrationEntry {
    fn pending() -> Self {
        Self {
            status: MigrationStatus::Pending,
            updated_at: Utc::now(),
            fingerprint: None,
            notes: None,
        }
    }
}

/// Count of steps per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub pending: usize,
    pub ported: usize,
    pub verified: usize,
}

impl MigrationSummary {
    pub fn total(&self) -> usize {
        self.pending + self.ported + self.verified
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.ported == 0
    }
}

impl fmt::Display for MigrationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} verified ({} ported, {} pending)",
            self.verified,
            self.total(),
            self.ported,
            self.pending
        )
    }
}

/// Per-step migration status, persisted next to the pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationLedger {
    #[serde(default)]
    pub steps: BTreeMap<String, MigrationEntry>,
}

impl MigrationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending entry for every step the ledger doesn't know yet
    ///
    /// Returns the number of entries added.
    pub fn track(&mut self, pipeline: &Pipeline) -> usize {
        let mut added = 0;
        for name in pipeline.step_names() {
            if !self.steps.contains_key(name) {
                self.steps.insert(name.to_string(), MigrationEntry::pending());
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, total = self.steps.len(), "Tracked new steps");
        }
        added
    }

    pub fn entry(&self, step: &str) -> Option<&MigrationEntry> {
        self.steps.get(step)
    }

    pub fn status(&self, step: &str) -> Option<MigrationStatus> {
        self.steps.get(step).map(|e| e.status)
    }

    /// Move a step to `next`, rejecting illegal transitions
    pub fn set_status(&mut self, step: &str, next: MigrationStatus) -> PipelineResult<()> {
        let entry = self.entry_mut(step)?;
        if !entry.status.can_transition_to(next) {
            return Err(PipelineError::MigrationError(format!(
                "step '{}' cannot move from {} to {}",
                step, entry.status, next
            )));
        }
        if next != MigrationStatus::Verified {
            entry.fingerprint = None;
        }
        entry.status = next;
        entry.updated_at = Utc::now();
        info!(step, status = next.name(), "Migration status changed");
        Ok(())
    }

    pub fn mark_ported(&mut self, step: &str) -> PipelineResult<()> {
        self.set_status(step, MigrationStatus::Ported)
    }

    /// Mark a step verified against the prefix query with `fingerprint`
    pub fn mark_verified(&mut self, step: &str, fingerprint: impl Into<String>) -> PipelineResult<()> {
        self.set_status(step, MigrationStatus::Verified)?;
        self.entry_mut(step)?.fingerprint = Some(fingerprint.into());
        Ok(())
    }

    /// Mark a step verified using its prefix in `plan`
    pub fn verify_in(&mut self, step: &str, plan: &PipelinePlan) -> PipelineResult<()> {
        let fingerprint = prefix_fingerprint(plan, step)?;
        self.mark_verified(step, fingerprint)
    }

    /// Return a step to pending from any status
    pub fn reset(&mut self, step: &str) -> PipelineResult<()> {
        let entry = self.entry_mut(step)?;
        entry.status = MigrationStatus::Pending;
        entry.fingerprint = None;
        entry.updated_at = Utc::now();
        info!(step, "Migration status reset");
        Ok(())
    }

    pub fn set_notes(&mut self, step: &str, notes: impl Into<String>) -> PipelineResult<()> {
        let entry = self.entry_mut(step)?;
        entry.notes = Some(notes.into());
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Whether a verified step's recorded fingerprint differs from `fingerprint`
    pub fn is_stale(&self, step: &str, fingerprint: &str) -> bool {
        self.steps.get(step).is_some_and(|e| {
            e.status == MigrationStatus::Verified && e.fingerprint.as_deref() != Some(fingerprint)
        })
    }

    /// Verified steps whose prefix SQL in `plan` has changed since verification
    pub fn stale_steps(&self, plan: &PipelinePlan) -> PipelineResult<Vec<String>> {
        let mut stale = Vec::new();
        for name in plan.pipeline().step_names() {
            if self.status(name) == Some(MigrationStatus::Verified)
                && self.is_stale(name, &prefix_fingerprint(plan, name)?)
            {
                stale.push(name.to_string());
            }
        }
        Ok(stale)
    }

    pub fn summary(&self) -> MigrationSummary {
        self.steps
            .values()
            .fold(MigrationSummary::default(), |mut acc, e| {
                match e.status {
                    MigrationStatus::Pending => acc.pending += 1,
                    MigrationStatus::Ported => acc.ported += 1,
                    MigrationStatus::Verified => acc.verified += 1,
                }
                acc
            })
    }

    /// Save the ledger as pretty-printed JSON
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a ledger saved with [`save`](Self::save)
    pub fn load(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Err(PipelineError::FileNotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        let ledger: Self = serde_json::from_str(&json)?;
        Ok(ledger)
    }

    pub fn to_yaml(&self) -> PipelineResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &str) -> PipelineResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Default ledger path for a pipeline file
    pub fn default_path(pipeline_file: &Path) -> PathBuf {
        let mut path = pipeline_file.to_path_buf();
        path.set_extension("migration.json");
        path
    }

    fn entry_mut(&mut self, step: &str) -> PipelineResult<&mut MigrationEntry> {
        self.steps
            .get_mut(step)
            .ok_or_else(|| PipelineError::MigrationError(format!("step '{}' is not tracked", step)))
    }
}

fn prefix_fingerprint(plan: &PipelinePlan, step: &str) -> PipelineResult<String> {
    let k = plan
        .pipeline()
        .position(step)
        .ok_or_else(|| PipelineError::MigrationError(format!("step '{}' is not in the pipeline", step)))?;
    Ok(plan.compile_prefix(k)?.fingerprint())
}
