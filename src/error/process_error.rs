//! Process-level error types.

use super::NodeError;
use thiserror::Error;

/// Process-level errors
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Process definition not found: {0}")]
    ProcessNotFound(String),
    #[error("Process instance not found: {0}")]
    InstanceNotFound(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Node instance not found: {0}")]
    NodeInstanceNotFound(u64),
    #[error("Duplicate node id in container '{container}': {node}")]
    DuplicateNodeId { container: String, node: String },
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
    #[error("No start node found in container: {0}")]
    NoStartNode(String),
    #[error("Dynamic node '{0}' has no completion condition")]
    MissingCompletionCondition(String),
    #[error("Compensation handler '{0}' declares a nested compensation handler")]
    NestedCompensation(String),
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),
    #[error("Work item not found: {0}")]
    WorkItemNotFound(u64),
    #[error("No work item handler registered for type: {0}")]
    NoWorkItemHandler(String),
    #[error("Process instance '{0}' is suspended")]
    InstanceSuspended(String),
    #[error("Process instance '{id}' is not in state {expected}")]
    IllegalInstanceState { id: String, expected: String },
    #[error("Max steps exceeded: {0}")]
    MaxStepsExceeded(i32),
    #[error("Marshalling error: {0}")]
    Marshalling(String),
    #[error("Node error: {0}")]
    NodeError(Box<NodeError>),
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<NodeError> for ProcessError {
    fn from(value: NodeError) -> Self {
        ProcessError::NodeError(Box::new(value))
    }
}
