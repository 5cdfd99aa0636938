//! Step registry and the immutable pipeline it produces

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::step::Step;

/// Ordered collection of steps with unique names
///
/// Registration order is the execution order: each step sees the cumulative
/// output of every step registered before it.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Arc<dyn Step>>,
    names: HashSet<String>,
}

impl StepRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step at the end of the pipeline
    pub fn register<S: Step + 'static>(&mut self, step: S) -> PipelineResult<()> {
        self.register_shared(Arc::new(step))
    }

    /// Register an already shared step
    pub fn register_shared(&mut self, step: Arc<dyn Step>) -> PipelineResult<()> {
        let name = step.name().to_string();
        if name.trim().is_empty() {
            return Err(PipelineError::invalid_step(name, "step name must not be empty"));
        }
        if self.names.contains(&name) {
            return Err(PipelineError::DuplicateStepName(name));
        }
        step.validate()?;

        if let Some(meta) = step.meta() {
            if let Some(dependency) = meta.depends_on.iter().find(|d| !self.names.contains(*d)) {
                return Err(PipelineError::UnknownDependency {
                    step: name,
                    dependency: dependency.clone(),
                });
            }
        }

        debug!(step = %name, position = self.steps.len() + 1, "Registered step");
        self.names.insert(name);
        self.steps.push(step);
        Ok(())
    }

    /// Builder-style [`StepRegistry::register`]
    pub fn with_step<S: Step + 'static>(mut self, step: S) -> PipelineResult<Self> {
        self.register(step)?;
        Ok(self)
    }

    /// Registered steps in registration order
    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Freeze the registry into an immutable pipeline
    pub fn into_pipeline(self) -> Pipeline {
        Pipeline {
            steps: self.steps.into(),
        }
    }
}

/// Immutable, ordered sequence of uniquely named steps
///
/// Cloning is cheap; a pipeline can be shared between threads and compiled
/// concurrently.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn Step>]>,
}

impl Pipeline {
    /// Build a pipeline from steps, enforcing the registry's rules
    pub fn from_steps<I>(steps: I) -> PipelineResult<Self>
    where
        I: IntoIterator<Item = Arc<dyn Step>>,
    {
        let mut registry = StepRegistry::new();
        for step in steps {
            registry.register_shared(step)?;
        }
        Ok(registry.into_pipeline())
    }

    /// A pipeline with no steps
    pub fn empty() -> Self {
        StepRegistry::new().into_pipeline()
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at 1-based position `index`
    pub fn step(&self, index: usize) -> Option<&Arc<dyn Step>> {
        index.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    /// 1-based position of the step called `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name() == name).map(|i| i + 1)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// The steps after the first `k`, as their own pipeline
    ///
    /// Dependencies on steps inside the first `k` are not re-checked.
    pub fn tail(&self, k: usize) -> PipelineResult<Pipeline> {
        if k > self.steps.len() {
            return Err(PipelineError::InvalidPrefix {
                requested: k,
                available: self.steps.len(),
            });
        }
        Ok(Pipeline {
            steps: self.steps[k..].iter().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::SqlStep;

    fn step(name: &str) -> SqlStep {
        SqlStep::new(name, "SELECT * FROM {input}")
    }

    #[test]
    fn test_register_preserves_order() {
        let mut registry = StepRegistry::new();
        registry.register(step("trim")).unwrap();
        registry.register(step("upper")).unwrap();
        registry.register(step("tokenise")).unwrap();

        let pipeline = registry.into_pipeline();
        assert_eq!(pipeline.step_names(), vec!["trim", "upper", "tokenise"]);
        assert_eq!(pipeline.position("upper"), Some(2));
        assert_eq!(pipeline.step(3).unwrap().name(), "tokenise");
        assert!(pipeline.step(0).is_none());
    }

    #[test]
    fn test_duplicate_name_rejected_at_any_position() {
        for position in 0..3 {
            let mut registry = StepRegistry::new();
            let names = ["a", "b", "c"];
            for name in names {
                registry.register(step(name)).unwrap();
            }
            let err = registry.register(step(names[position])).unwrap_err();
            assert!(matches!(err, PipelineError::DuplicateStepName(ref n) if n == names[position]));
            assert_eq!(registry.len(), 3);
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = StepRegistry::new();
        let err = registry.register(step("  ")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidStep { .. }));
    }

    #[test]
    fn test_dependency_must_precede() {
        let mut registry = StepRegistry::new();
        let err = registry
            .register(step("tokenise").depends_on("trim"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownDependency { ref dependency, .. } if dependency == "trim"));

        registry.register(step("trim")).unwrap();
        registry
            .register(step("tokenise").depends_on("trim"))
            .unwrap();
    }

    #[test]
    fn test_tail() {
        let pipeline = StepRegistry::new()
            .with_step(step("a"))
            .and_then(|r| r.with_step(step("b")))
            .and_then(|r| r.with_step(step("c")))
            .unwrap()
            .into_pipeline();

        assert_eq!(pipeline.tail(1).unwrap().step_names(), vec!["b", "c"]);
        assert!(pipeline.tail(3).unwrap().is_empty());
        assert!(matches!(
            pipeline.tail(4),
            Err(PipelineError::InvalidPrefix { requested: 4, available: 3 })
        ));
    }

    #[test]
    fn test_pipeline_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Pipeline>();
    }
}
