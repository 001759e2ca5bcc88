//! Saga definitions and the registry the orchestrator resolves them from.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Result, SagaError};
use crate::step::Step;

/// An ordered, immutable sequence of steps identified by a saga type.
#[derive(Clone)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<Arc<dyn Step>>,
}

impl SagaDefinition {
    /// Starts building a definition for `saga_type`.
    pub fn builder(saga_type: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Arc<dyn Step>> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("saga_type", &self.saga_type)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
pub struct SagaDefinitionBuilder {
    saga_type: String,
    steps: Vec<Arc<dyn Step>>,
}

impl SagaDefinitionBuilder {
    /// Appends a step.
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends a shared step.
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Validates and builds the definition.
    pub fn build(self) -> Result<SagaDefinition> {
        let invalid = |reason: String| SagaError::InvalidDefinition {
            saga_type: self.saga_type.clone(),
            reason,
        };

        if self.saga_type.trim().is_empty() {
            return Err(invalid("saga type must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("a saga needs at least one step".into()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name().is_empty() {
                return Err(invalid("step names must not be empty".into()));
            }
            if !seen.insert(step.name()) {
                return Err(invalid(format!("duplicate step name '{}'", step.name())));
            }
            if step.policy().max_attempts == 0 {
                return Err(invalid(format!(
                    "step '{}' must allow at least one attempt",
                    step.name()
                )));
            }
        }

        Ok(SagaDefinition {
            saga_type: self.saga_type,
            steps: self.steps,
        })
    }
}

/// Registered saga definitions, keyed by saga type.
#[derive(Debug, Clone, Default)]
pub struct SagaRegistry {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition. A saga type can only be registered once.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        if self.definitions.contains_key(definition.saga_type()) {
            return Err(SagaError::DuplicateDefinition(
                definition.saga_type().to_string(),
            ));
        }
        tracing::debug!(
            saga_type = definition.saga_type(),
            steps = definition.len(),
            "saga definition registered"
        );
        self.definitions
            .insert(definition.saga_type().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Registers a definition, builder style.
    pub fn with(mut self, definition: SagaDefinition) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    /// Looks up the definition for a saga type.
    pub fn get(&self, saga_type: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    pub fn contains(&self, saga_type: &str) -> bool {
        self.definitions.contains_key(saga_type)
    }

    pub fn saga_types(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use saga_store::SagaContext;

    use super::*;
    use crate::step::{StepContext, StepError, StepPolicy};

    struct Noop {
        name: &'static str,
        policy: StepPolicy,
    }

    fn noop(name: &'static str) -> Noop {
        Noop {
            name,
            policy: StepPolicy::default(),
        }
    }

    #[async_trait]
    impl Step for Noop {
        fn name(&self) -> &str {
            self.name
        }

        fn policy(&self) -> StepPolicy {
            self.policy
        }

        async fn execute(
            &self,
            _: &StepContext,
            _: &SagaContext,
        ) -> std::result::Result<SagaContext, StepError> {
            Ok(SagaContext::new())
        }

        async fn compensate(
            &self,
            _: &StepContext,
            _: &SagaContext,
        ) -> std::result::Result<(), StepError> {
            Ok(())
        }
    }

    #[test]
    fn test_build_keeps_step_order() {
        let definition = SagaDefinition::builder("Order")
            .step(noop("a"))
            .step(noop("b"))
            .step(noop("c"))
            .build()
            .unwrap();
        assert_eq!(definition.step_names(), ["a", "b", "c"]);
        assert_eq!(definition.len(), 3);
        assert_eq!(definition.step(1).unwrap().name(), "b");
        assert!(definition.step(3).is_none());
    }

    #[test]
    fn test_empty_definition_is_rejected() {
        let result = SagaDefinition::builder("Order").build();
        assert!(matches!(result, Err(SagaError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_duplicate_step_names_are_rejected() {
        let result = SagaDefinition::builder("Order")
            .step(noop("a"))
            .step(noop("a"))
            .build();
        match result {
            Err(SagaError::InvalidDefinition { reason, .. }) => {
                assert!(reason.contains("duplicate step name 'a'"))
            }
            other => panic!("expected invalid definition, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_attempt_budget_is_rejected() {
        let result = SagaDefinition::builder("Order")
            .step(Noop {
                name: "a",
                policy: StepPolicy::default().with_max_attempts(0),
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_rejects_second_registration() {
        let mut registry = SagaRegistry::new();
        let definition = SagaDefinition::builder("Order")
            .step(noop("a"))
            .build()
            .unwrap();
        registry.register(definition.clone()).unwrap();

        assert!(matches!(
            registry.register(definition),
            Err(SagaError::DuplicateDefinition(t)) if t == "Order"
        ));
        assert!(registry.contains("Order"));
        assert!(matches!(
            registry.get("Refund"),
            Err(SagaError::UnknownSagaType(_))
        ));
    }
}
