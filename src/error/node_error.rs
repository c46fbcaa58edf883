use thiserror::Error;

/// Node-level errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Variable not found: {0}")]
    VariableNotFound(String),
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("No work item handler registered for type: {0}")]
    NoHandler(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl NodeError {
    /// Fault name used when this error is propagated through the exception
    /// scope chain instead of failing the call outright.
    pub fn fault_name(&self) -> &'static str {
        "error"
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::SerializationError(e.to_string())
    }
}
