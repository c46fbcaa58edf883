//! Snapshot and restore of process-instance state.
//!
//! Every mutable entity of an instance — scopes, node instances with their
//! kind payloads, work items, timers, event and boundary subscriptions, and
//! the fault record — round-trips through [`ProcessInstanceSnapshot`]. The
//! snapshot is plain serde data; the wire format is the marshaller's choice.
//! Restoring re-arms subscriptions identically; the runtime re-arms pending
//! timers with their remaining delay.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::scope::VariableScopes;
use crate::core::work_item::{WorkItem, WorkItemId};
use crate::definition::types::ProcessDefinition;
use crate::error::{ProcessError, ProcessResult};
use crate::instance::node_instance::{NodeInstance, NodeInstanceId, TimerId};
use crate::instance::process_instance::{
    BoundarySub, EngineConfig, ProcessFault, ProcessInstance, ProcessState, TimerSubscription,
};

/// Full mutable state of one process instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstanceSnapshot {
    pub id: String,
    pub process_id: String,
    pub state: ProcessState,
    pub scopes: VariableScopes,
    pub nodes: Vec<NodeInstance>,
    pub next_node_id: NodeInstanceId,
    pub next_work_item_id: WorkItemId,
    pub next_timer_id: TimerId,
    pub work_items: Vec<WorkItem>,
    pub work_item_nodes: HashMap<WorkItemId, NodeInstanceId>,
    pub timers: HashMap<TimerId, TimerSubscription>,
    pub event_subscriptions: HashMap<String, Vec<NodeInstanceId>>,
    pub boundary_subs: Vec<BoundarySub>,
    pub fault: Option<ProcessFault>,
    pub started: bool,
}

impl ProcessInstance {
    /// Capture the instance's full mutable state. Only quiescent instances
    /// (no in-flight agenda operations) can be captured.
    pub fn snapshot(&self) -> ProcessResult<ProcessInstanceSnapshot> {
        if !self.agenda.is_empty() || !self.pending_spawns.is_empty() {
            return Err(ProcessError::Marshalling(
                "instance has in-flight operations".into(),
            ));
        }
        Ok(ProcessInstanceSnapshot {
            id: self.id.clone(),
            process_id: self.definition.id.clone(),
            state: self.state,
            scopes: self.scopes.clone(),
            nodes: self.nodes.values().cloned().collect(),
            next_node_id: self.next_node_id,
            next_work_item_id: self.next_work_item_id,
            next_timer_id: self.next_timer_id,
            work_items: self.work_items.values().cloned().collect(),
            work_item_nodes: self.work_item_nodes.clone(),
            timers: self.timers.clone(),
            event_subscriptions: self.event_subscriptions.clone(),
            boundary_subs: self.boundary_subs.clone(),
            fault: self.fault.clone(),
            started: self.started,
        })
    }

    /// Rebuild an equivalent instance from a snapshot against its original
    /// definition.
    pub fn restore(
        definition: Arc<ProcessDefinition>,
        config: EngineConfig,
        snapshot: ProcessInstanceSnapshot,
    ) -> ProcessResult<Self> {
        if definition.id != snapshot.process_id {
            return Err(ProcessError::Marshalling(format!(
                "snapshot of process '{}' cannot restore against definition '{}'",
                snapshot.process_id, definition.id
            )));
        }
        Ok(ProcessInstance {
            id: snapshot.id,
            definition,
            config,
            state: snapshot.state,
            scopes: snapshot.scopes,
            nodes: snapshot.nodes.into_iter().map(|n| (n.id, n)).collect(),
            next_node_id: snapshot.next_node_id,
            next_work_item_id: snapshot.next_work_item_id,
            next_timer_id: snapshot.next_timer_id,
            work_items: snapshot
                .work_items
                .into_iter()
                .map(|w| (w.id, w))
                .collect(),
            work_item_nodes: snapshot.work_item_nodes,
            timers: snapshot.timers,
            event_subscriptions: snapshot.event_subscriptions,
            boundary_subs: snapshot.boundary_subs,
            fault: snapshot.fault,
            agenda: VecDeque::new(),
            pending_spawns: Vec::new(),
            pending_timer_arms: Vec::new(),
            pending_child_aborts: Vec::new(),
            aborted_work_items: Vec::new(),
            started: snapshot.started,
        })
    }
}
