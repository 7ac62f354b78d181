//! Pipeline registry: payload `type` -> pipeline factory.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::KilnError;

use super::Pipeline;

/// Builds a fresh pipeline per execution.
pub trait PipelineFactory: Send + Sync {
    fn build(&self) -> Pipeline;
}

impl<F> PipelineFactory for F
where
    F: Fn() -> Pipeline + Send + Sync,
{
    fn build(&self) -> Pipeline {
        self()
    }
}

/// Process-wide map from payload `type` to factory.
///
/// Duplicate names are rejected rather than silently replaced; lookup is a
/// single read-locked hash probe. A missing key at dispatch time is a fatal
/// job failure.
#[derive(Default)]
pub struct PipelineRegistry {
    factories: RwLock<HashMap<String, Arc<dyn PipelineFactory>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        pipeline_type: impl Into<String>,
        factory: Arc<dyn PipelineFactory>,
    ) -> Result<(), KilnError> {
        let pipeline_type = pipeline_type.into();
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if factories.contains_key(&pipeline_type) {
            return Err(KilnError::DuplicatePipeline(pipeline_type));
        }
        factories.insert(pipeline_type, factory);
        Ok(())
    }

    /// Register a closure as a factory.
    pub fn register_fn<F>(
        &self,
        pipeline_type: impl Into<String>,
        factory: F,
    ) -> Result<(), KilnError>
    where
        F: Fn() -> Pipeline + Send + Sync + 'static,
    {
        self.register(pipeline_type, Arc::new(factory))
    }

    pub fn get(&self, pipeline_type: &str) -> Option<Arc<dyn PipelineFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline_type)
            .cloned()
    }

    pub fn contains(&self, pipeline_type: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(pipeline_type)
    }

    pub fn len(&self) -> usize {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
