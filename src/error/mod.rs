//! Error types for the process engine.
//!
//! - [`NodeError`] — Errors raised while executing a single node's behavior.
//! - [`ProcessError`] — Top-level errors for definition building, validation,
//!   and process-instance operations.

pub mod node_error;
pub mod process_error;

pub use node_error::NodeError;
pub use process_error::ProcessError;

/// Convenience alias for process-level results.
pub type ProcessResult<T> = Result<T, ProcessError>;
/// Convenience alias for node-level results.
pub type NodeResult<T> = Result<T, NodeError>;
