//! Template-based SQL step

use std::collections::HashSet;

use super::{Fragment, RenderContext, RenderedStep, Step, StepMeta};
use crate::error::{PipelineError, PipelineResult};
use crate::naming;
use crate::schema::Column;

const INPUT_PLACEHOLDER: &str = "{input}";

/// Step defined by raw SQL templates
///
/// `{input}` is replaced with the upstream virtual table. A fragment may also
/// reference any earlier fragment of the same step as `{fragment_name}`.
#[derive(Debug, Clone)]
pub struct SqlStep {
    name: String,
    fragments: Vec<Fragment>,
    output: Option<String>,
    required: Vec<String>,
    emitted: Vec<Column>,
    dropped: Vec<String>,
    meta: StepMeta,
    checkpoint: bool,
    preludes: Vec<String>,
}

impl SqlStep {
    /// Fragment name used by single-fragment steps
    pub const MAIN: &'static str = "main";

    /// Create a single-fragment step
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::with_fragments(name, [(Self::MAIN, sql.into())])
    }

    /// Create a step from `(fragment_name, sql)` pairs, in order
    pub fn with_fragments<I, N, S>(name: impl Into<String>, fragments: I) -> Self
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fragments: fragments
                .into_iter()
                .map(|(n, s)| Fragment::new(n, s))
                .collect(),
            output: None,
            required: Vec::new(),
            emitted: Vec::new(),
            dropped: Vec::new(),
            meta: StepMeta::default(),
            checkpoint: false,
            preludes: Vec::new(),
        }
    }

    /// Append a fragment
    pub fn fragment(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.fragments.push(Fragment::new(name, sql));
        self
    }

    /// Select which fragment downstream steps read from
    pub fn output(mut self, fragment: impl Into<String>) -> Self {
        self.output = Some(fragment.into());
        self
    }

    pub fn requires<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn emits<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        self.emitted.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn drops<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dropped.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.meta.description = Some(description.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.meta.group = Some(group.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.meta.depends_on.push(step.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: bool) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn prelude(mut self, sql: impl Into<String>) -> Self {
        self.preludes.push(sql.into());
        self
    }

    fn placeholder(fragment: &str) -> String {
        format!("{{{}}}", fragment)
    }
}

impl Step for SqlStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_columns(&self) -> &[String] {
        &self.required
    }

    fn emitted_columns(&self) -> &[Column] {
        &self.emitted
    }

    fn dropped_columns(&self) -> &[String] {
        &self.dropped
    }

    fn meta(&self) -> Option<&StepMeta> {
        Some(&self.meta)
    }

    fn checkpoint(&self) -> bool {
        self.checkpoint
    }

    fn preludes(&self) -> &[String] {
        &self.preludes
    }

    fn validate(&self) -> PipelineResult<()> {
        if self.fragments.is_empty() {
            return Err(PipelineError::invalid_step(&self.name, "step has no fragments"));
        }

        let mut names = HashSet::new();
        let mut slugs = HashSet::new();
        for fragment in &self.fragments {
            if fragment.name.trim().is_empty() {
                return Err(PipelineError::invalid_step(&self.name, "empty fragment name"));
            }
            if fragment.name == "input" {
                return Err(PipelineError::invalid_step(
                    &self.name,
                    "fragment name 'input' is reserved for the upstream table",
                ));
            }
            if !names.insert(fragment.name.as_str()) {
                return Err(PipelineError::invalid_step(
                    &self.name,
                    format!("duplicate fragment name '{}'", fragment.name),
                ));
            }
            if !slugs.insert(naming::slug(&fragment.name)) {
                return Err(PipelineError::invalid_step(
                    &self.name,
                    format!(
                        "fragment name '{}' collides with another fragment once normalised",
                        fragment.name
                    ),
                ));
            }
        }

        if let Some(output) = &self.output {
            if !names.contains(output.as_str()) {
                return Err(PipelineError::invalid_step(
                    &self.name,
                    format!("output fragment '{}' does not exist", output),
                ));
            }
        }

        let mut emitted = HashSet::new();
        for column in &self.emitted {
            if !emitted.insert(column.name.as_str()) {
                return Err(PipelineError::invalid_step(
                    &self.name,
                    format!("column '{}' emitted twice", column.name),
                ));
            }
        }
        if let Some(column) = self.dropped.iter().find(|c| emitted.contains(c.as_str())) {
            return Err(PipelineError::invalid_step(
                &self.name,
                format!("column '{}' is both dropped and emitted", column),
            ));
        }

        Ok(())
    }

    fn render(&self, ctx: &RenderContext<'_>) -> PipelineResult<RenderedStep> {
        let mut rendered = Vec::with_capacity(self.fragments.len());

        for (position, fragment) in self.fragments.iter().enumerate() {
            if let Some(later) = self.fragments[position..]
                .iter()
                .find(|f| fragment.sql.contains(&Self::placeholder(&f.name)))
            {
                return Err(PipelineError::compilation(
                    &self.name,
                    format!(
                        "fragment '{}' references '{}', which is not defined before it",
                        fragment.name, later.name
                    ),
                ));
            }

            let mut sql = fragment.sql.replace(INPUT_PLACEHOLDER, ctx.input);
            for earlier in &self.fragments[..position] {
                sql = sql.replace(
                    &Self::placeholder(&earlier.name),
                    &ctx.fragment_table(&earlier.name),
                );
            }
            rendered.push(Fragment::new(fragment.name.clone(), sql));
        }

        Ok(RenderedStep {
            fragments: rendered,
            output: self.output.clone(),
        })
    }
}
