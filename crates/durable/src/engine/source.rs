//! Workflow definition lookup

use async_trait::async_trait;
use dashmap::DashMap;

use crate::persistence::StoreError;
use crate::workflow::WorkflowDefinition;

/// Supplies workflow definitions to the executor
///
/// Definitions are immutable data owned by the embedding application; the
/// engine only ever reads them by id.
#[async_trait]
pub trait WorkflowSource: Send + Sync + 'static {
    /// Look up a definition
    async fn workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError>;
}

/// In-memory workflow source
///
/// # Example
///
/// ```
/// use windlass_durable::engine::InMemoryWorkflowSource;
/// use windlass_durable::workflow::WorkflowDefinition;
///
/// let source = InMemoryWorkflowSource::new();
/// source.insert(WorkflowDefinition::new("wf-1", vec![]));
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowSource {
    definitions: DashMap<String, WorkflowDefinition>,
}

impl InMemoryWorkflowSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a definition
    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions.insert(definition.id.clone(), definition);
    }

    /// Number of registered definitions
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether the source is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[async_trait]
impl WorkflowSource for InMemoryWorkflowSource {
    async fn workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.get(id).map(|d| d.clone()))
    }
}
