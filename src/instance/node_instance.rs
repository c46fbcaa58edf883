//! Runtime node-instance records.
//!
//! One [`NodeInstance`] exists per active execution token at a node. Instances
//! live in an arena on the owning process instance, keyed by
//! [`NodeInstanceId`], and point at their container by id — the container tree
//! is rooted at the process instance itself ([`ContainerId::Process`]).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::scope::ScopeId;
use crate::core::work_item::WorkItemId;

/// Identifier of a node instance within its process instance.
pub type NodeInstanceId = u64;

/// Identifier of a scheduled timer within its process instance.
pub type TimerId = u64;

/// The container a node instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerId {
    /// Top level: owned directly by the process instance.
    Process,
    /// Owned by a composite/dynamic/for-each container node instance.
    Node(NodeInstanceId),
}

/// Lifecycle states of a node instance.
///
/// `Created → Triggered → (Active | Completed | Aborted)`; synchronous kinds
/// pass through `Triggered` to `Completed` in one step, asynchronous kinds
/// park in `Active` until resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceState {
    Created,
    Triggered,
    Active,
    Completed,
    Aborted,
}

/// How a node instance resolves its definition.
///
/// Statically-wired instances reference a node id in their enclosing
/// container's definition. For-each iterations and dynamically-added children
/// have no static definition; their configuration lives inline so instance
/// state stays serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DefRef {
    /// Node id within the enclosing container's definition.
    Node(String),
    /// Synthetic iteration container; its sub-graph is the enclosing
    /// for-each node's body.
    ForEachBody,
    /// Work item added through the dynamic-container protocol.
    DynamicWorkItem {
        work_name: String,
        parameters: HashMap<String, Value>,
    },
    /// Sub-process added through the dynamic-container protocol.
    DynamicSubProcess {
        process_id: String,
        parameters: HashMap<String, Value>,
    },
}

impl DefRef {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            DefRef::Node(id) => Some(id),
            _ => None,
        }
    }
}

/// Kind-specific runtime payload of a node instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRuntime {
    None,
    /// AND-join arrival bookkeeping (connection arrival keys).
    Join { arrivals: Vec<String> },
    /// Container instances own a child variable scope.
    Container { scope: ScopeId },
    /// Parked on an active work item.
    WorkItem { work_item_id: WorkItemId },
    /// Parked on (or fired past) a child process instance.
    SubProcess {
        child_instance_id: Option<String>,
        wait: bool,
        independent: bool,
    },
    /// Parked on a scheduled timer.
    Timer { timer_id: TimerId },
    /// Parked on an event subscription.
    Event { event_type: String },
}

/// The mutable runtime counterpart of a node definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: NodeInstanceId,
    pub def: DefRef,
    pub container: ContainerId,
    /// Nesting depth; top-level instances are level 1.
    pub level: u32,
    pub state: NodeInstanceState,
    pub runtime: NodeRuntime,
}

impl NodeInstance {
    /// The definition node id, if this instance is statically wired.
    pub fn node_id(&self) -> Option<&str> {
        self.def.node_id()
    }

    /// Child variable scope, for container instances.
    pub fn scope(&self) -> Option<ScopeId> {
        match self.runtime {
            NodeRuntime::Container { scope } => Some(scope),
            _ => None,
        }
    }

    /// Still present and able to make progress or receive signals.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            NodeInstanceState::Created | NodeInstanceState::Triggered | NodeInstanceState::Active
        )
    }
}
