//! Services the orchestrator depends on but does not implement.
//!
//! - [`DataTransfer`]: loads input tables/files into the working directory
//!   and stores produced outputs, reporting input watermarks for the state
//! - [`ComponentCatalog`]: looks up processor descriptors by component id

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::component::{ComponentDescriptor, JobConfiguration, JobContext, JobRow};
use crate::error::{ImageError, RunnerError};
use crate::state::{InputState, StateSnapshot};

/// Moves data between storage and the working directory.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Fills `data/in` and returns the input watermarks for the state's
    /// storage namespace.
    async fn load_inputs(
        &self,
        context: &JobContext,
        row: &JobRow,
        configuration: &JobConfiguration,
        data_dir: &Path,
    ) -> Result<InputState, RunnerError>;

    /// Uploads whatever the last stage left in `data/out`.
    async fn store_outputs(
        &self,
        context: &JobContext,
        row: &JobRow,
        configuration: &JobConfiguration,
        data_dir: &Path,
    ) -> Result<(), RunnerError>;
}

/// [`DataTransfer`] that moves nothing and keeps the prior watermarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDataTransfer;

#[async_trait]
impl DataTransfer for NoopDataTransfer {
    async fn load_inputs(
        &self,
        _context: &JobContext,
        row: &JobRow,
        _configuration: &JobConfiguration,
        _data_dir: &Path,
    ) -> Result<InputState, RunnerError> {
        Ok(StateSnapshot::from_value(&row.state).storage)
    }

    async fn store_outputs(
        &self,
        _context: &JobContext,
        _row: &JobRow,
        _configuration: &JobConfiguration,
        _data_dir: &Path,
    ) -> Result<(), RunnerError> {
        Ok(())
    }
}

/// Source of processor component descriptors.
#[async_trait]
pub trait ComponentCatalog: Send + Sync {
    async fn component(&self, id: &str) -> Result<ComponentDescriptor, ImageError>;
}

/// [`ComponentCatalog`] over a fixed set of descriptors.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    components: HashMap<String, ComponentDescriptor>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, descriptor: ComponentDescriptor) -> Self {
        self.components.insert(descriptor.id.clone(), descriptor);
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

#[async_trait]
impl ComponentCatalog for InMemoryCatalog {
    async fn component(&self, id: &str) -> Result<ComponentDescriptor, ImageError> {
        self.components
            .get(id)
            .cloned()
            .ok_or_else(|| ImageError::ComponentNotFound(id.to_string()))
    }
}
