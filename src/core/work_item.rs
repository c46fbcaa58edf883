//! Work items: the bridge between the engine and external task handlers.
//!
//! A work-item node hands execution off to whatever [`WorkItemHandler`] is
//! registered for its work name. The handler records completion or abort on
//! the [`WorkItemManager`] it receives; the engine drains those dispositions
//! after the handler returns, so the state machine is never re-entered from
//! inside a handler call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a work item within its process instance.
pub type WorkItemId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemState {
    Active,
    Completed,
    Aborted,
}

/// One unit of external work handed to a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub work_name: String,
    pub parameters: HashMap<String, Value>,
    pub state: WorkItemState,
    pub process_instance_id: String,
}

impl WorkItem {
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }
}

/// Pending disposition recorded by a handler.
#[derive(Debug, Clone)]
pub enum WorkItemDisposition {
    Complete {
        id: WorkItemId,
        results: HashMap<String, Value>,
    },
    Abort {
        id: WorkItemId,
    },
}

/// Collects handler dispositions for the engine to apply.
#[derive(Debug, Default)]
pub struct WorkItemManager {
    dispositions: Vec<WorkItemDisposition>,
}

impl WorkItemManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record completion of a work item with its result map.
    pub fn complete_work_item(&mut self, id: WorkItemId, results: HashMap<String, Value>) {
        self.dispositions
            .push(WorkItemDisposition::Complete { id, results });
    }

    /// Record abortion of a work item.
    pub fn abort_work_item(&mut self, id: WorkItemId) {
        self.dispositions.push(WorkItemDisposition::Abort { id });
    }

    pub(crate) fn drain(&mut self) -> Vec<WorkItemDisposition> {
        std::mem::take(&mut self.dispositions)
    }
}

/// External task handler, registered per work name.
#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    /// Called when a work item of this handler's type is created. Completion
    /// may be recorded immediately on `manager` or arrive later through the
    /// runtime.
    async fn execute_work_item(&self, item: &WorkItem, manager: &mut WorkItemManager);

    /// Called when the owning node instance is cancelled while the work item
    /// is still active.
    async fn abort_work_item(&self, _item: &WorkItem, _manager: &mut WorkItemManager) {}
}

/// Registry of work item handlers by work name, shared per runtime.
#[derive(Default)]
pub struct WorkItemHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn WorkItemHandler>>>,
}

impl WorkItemHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, work_name: &str, handler: Arc<dyn WorkItemHandler>) {
        self.handlers
            .write()
            .insert(work_name.to_string(), handler);
    }

    pub fn get(&self, work_name: &str) -> Option<Arc<dyn WorkItemHandler>> {
        self.handlers.read().get(work_name).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}
