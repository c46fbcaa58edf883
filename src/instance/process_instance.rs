//! The process instance: aggregate root of the execution state machine.
//!
//! A [`ProcessInstance`] owns the arena of active [`NodeInstance`]s, the
//! variable-scope arena, the suspension tables (work items, timers, event
//! subscriptions), and the fault record. Execution is agenda-driven: public
//! entry points (`start`, `signal`, `complete_work_item`, `fire_timer`, …)
//! enqueue [`EngineOp`]s and replay the state machine until the agenda drains.
//! Asynchronous node kinds park as `Active` with a continuation record and the
//! call stack returns to the caller; a later entry point resumes them.
//!
//! All state transitions for one instance are single-threaded: the owning
//! runtime serializes access behind a per-instance lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::context::RuntimeContext;
use crate::core::event_bus::ProcessEvent;
use crate::core::scope::{ScopeId, VariableScopes};
use crate::core::work_item::{
    WorkItem, WorkItemDisposition, WorkItemHandlerRegistry, WorkItemId, WorkItemManager,
    WorkItemState,
};
use crate::definition::types::{
    CompletionCondition, Connection, ContainerDef, ExceptionHandlerDef, FaultMatcher,
    HandlerAction, JoinKind, NodeDefinition, NodeKind, ProcessAction, ProcessDefinition,
    SplitKind, WorkItemDef, PORT_OUT,
};
use crate::error::{NodeError, ProcessError, ProcessResult};
use crate::evaluator::evaluate_group;
use crate::instance::node_instance::{
    ContainerId, DefRef, NodeInstance, NodeInstanceId, NodeInstanceState, NodeRuntime, TimerId,
};

/// Fault name used when an embedded action or binding evaluation fails.
pub const FAULT_ERROR: &str = "error";
/// Fault raised by an XOR/OR split when no branch guard matches.
pub const FAULT_NO_BRANCH: &str = "no-branch-matched";
/// Reserved signal type that invokes compensation handlers.
pub const SIGNAL_COMPENSATE: &str = "compensate";

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Runaway-loop guard: max agenda operations per entry-point call.
    #[serde(default = "default_max_steps")]
    pub max_steps: i32,
    /// Missing variable reads in bindings fail instead of yielding null.
    #[serde(default)]
    pub strict_variables: bool,
}

fn default_max_steps() -> i32 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_steps: 500,
            strict_variables: false,
        }
    }
}

/// Process instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Pending,
    Active,
    Completed,
    Aborted,
    Error,
    Suspended,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Aborted | ProcessState::Error
        )
    }
}

/// Fault record held while the instance is in [`ProcessState::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessFault {
    pub fault_name: String,
    /// Definition id of the faulting node.
    pub node_id: String,
    pub container: ContainerId,
    pub data: Option<Value>,
}

/// A timer continuation awaiting its firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerSubscription {
    pub node_instance: NodeInstanceId,
    pub delay_ms: u64,
    pub armed_at_ms: i64,
}

/// An armed boundary event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundarySub {
    pub event_type: String,
    pub container: ContainerId,
    pub boundary_node_id: String,
    pub attached: NodeInstanceId,
    pub cancel_activity: bool,
}

/// Request for the runtime to start a child process instance.
#[derive(Debug, Clone)]
pub struct SubProcessSpawn {
    pub node_instance: NodeInstanceId,
    pub process_id: String,
    pub parameters: HashMap<String, Value>,
    pub wait_for_completion: bool,
    pub independent: bool,
}

/// Shared services an instance needs while executing.
pub struct EngineServices<'a> {
    pub handlers: &'a WorkItemHandlerRegistry,
    pub context: &'a RuntimeContext,
}

/// Deferred state-machine operation.
#[derive(Debug)]
pub(crate) enum EngineOp {
    Trigger {
        container: ContainerId,
        node_id: String,
        arrival: Option<String>,
    },
    TriggerExisting {
        instance: NodeInstanceId,
    },
    CompleteWorkItem {
        id: WorkItemId,
        results: HashMap<String, Value>,
    },
    AbortWorkItem {
        id: WorkItemId,
    },
    Signal {
        event_type: String,
        payload: Value,
    },
    FireTimer {
        timer_id: TimerId,
    },
    ResumeSubProcess {
        instance: NodeInstanceId,
        outputs: HashMap<String, Value>,
    },
}

/// How a completed node selects its outgoing connections.
enum Continuation {
    /// Follow the default port.
    Default,
    /// Follow connections leaving through the given ports.
    Ports(Vec<String>),
    /// Follow every outgoing connection.
    All,
}

/// Commands recorded by an embedded action for the engine to apply.
#[derive(Debug, Clone)]
pub(crate) enum ActionCommand {
    Signal { event_type: String, payload: Value },
    TriggerNode { node_id: String },
}

/// Execution context handed to embedded [`ProcessAction`]s.
pub struct ActionContext<'a> {
    scope: ScopeId,
    scopes: &'a mut VariableScopes,
    commands: &'a mut Vec<ActionCommand>,
}

impl ActionContext<'_> {
    /// Read a variable through the scope chain.
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.scopes.get(self.scope, name)
    }

    /// Write a variable into the nearest declaring scope.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.scopes.set(self.scope, name, value);
    }

    /// Queue a signal delivered after the action returns.
    pub fn signal(&mut self, event_type: &str, payload: Value) {
        self.commands.push(ActionCommand::Signal {
            event_type: event_type.to_string(),
            payload,
        });
    }

    /// Queue an out-of-band trigger of a node in this action's container.
    pub fn trigger_node(&mut self, node_id: &str) {
        self.commands.push(ActionCommand::TriggerNode {
            node_id: node_id.to_string(),
        });
    }
}

/// The runtime aggregate for one running process.
pub struct ProcessInstance {
    pub(crate) id: String,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) config: EngineConfig,
    pub(crate) state: ProcessState,
    pub(crate) scopes: VariableScopes,
    pub(crate) nodes: HashMap<NodeInstanceId, NodeInstance>,
    pub(crate) next_node_id: NodeInstanceId,
    pub(crate) next_work_item_id: WorkItemId,
    pub(crate) next_timer_id: TimerId,
    pub(crate) work_items: HashMap<WorkItemId, WorkItem>,
    pub(crate) work_item_nodes: HashMap<WorkItemId, NodeInstanceId>,
    pub(crate) timers: HashMap<TimerId, TimerSubscription>,
    pub(crate) event_subscriptions: HashMap<String, Vec<NodeInstanceId>>,
    pub(crate) boundary_subs: Vec<BoundarySub>,
    pub(crate) fault: Option<ProcessFault>,
    pub(crate) agenda: VecDeque<EngineOp>,
    pub(crate) pending_spawns: Vec<SubProcessSpawn>,
    pub(crate) pending_timer_arms: Vec<TimerId>,
    pub(crate) pending_child_aborts: Vec<String>,
    pub(crate) aborted_work_items: Vec<WorkItem>,
    pub(crate) started: bool,
}

impl ProcessInstance {
    pub fn new(id: String, definition: Arc<ProcessDefinition>, config: EngineConfig) -> Self {
        ProcessInstance {
            id,
            definition,
            config,
            state: ProcessState::Pending,
            scopes: VariableScopes::new(),
            nodes: HashMap::new(),
            next_node_id: 1,
            next_work_item_id: 1,
            next_timer_id: 1,
            work_items: HashMap::new(),
            work_item_nodes: HashMap::new(),
            timers: HashMap::new(),
            event_subscriptions: HashMap::new(),
            boundary_subs: Vec::new(),
            fault: None,
            agenda: VecDeque::new(),
            pending_spawns: Vec::new(),
            pending_timer_arms: Vec::new(),
            pending_child_aborts: Vec::new(),
            aborted_work_items: Vec::new(),
            started: false,
        }
    }

    // ================================
    // Accessors
    // ================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn process_id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn fault(&self) -> Option<&ProcessFault> {
        self.fault.as_ref()
    }

    /// Read a process variable from the root scope.
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.scopes.get(self.scopes.root(), name)
    }

    /// Write a process variable at the root scope.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        let root = self.scopes.root();
        self.scopes.set(root, name, value);
    }

    /// Snapshot of the root-scope variables.
    pub fn variables(&self) -> HashMap<String, Value> {
        self.scopes.visible(self.scopes.root())
    }

    /// Node instances directly owned by the given container.
    pub fn node_instances(&self, container: ContainerId) -> Vec<&NodeInstance> {
        let mut out: Vec<&NodeInstance> = self
            .nodes
            .values()
            .filter(|n| n.container == container)
            .collect();
        out.sort_by_key(|n| n.id);
        out
    }

    /// First live instance of the given definition node id, anywhere.
    pub fn find_active_instance(&self, node_id: &str) -> Option<&NodeInstance> {
        self.nodes
            .values()
            .filter(|n| n.is_live())
            .find(|n| n.node_id() == Some(node_id))
    }

    pub fn node_instance(&self, id: NodeInstanceId) -> Option<&NodeInstance> {
        self.nodes.get(&id)
    }

    /// Currently active work items.
    pub fn work_items(&self) -> Vec<&WorkItem> {
        let mut out: Vec<&WorkItem> = self.work_items.values().collect();
        out.sort_by_key(|w| w.id);
        out
    }

    pub fn work_item(&self, id: WorkItemId) -> Option<&WorkItem> {
        self.work_items.get(&id)
    }

    pub fn timers(&self) -> &HashMap<TimerId, TimerSubscription> {
        &self.timers
    }

    // ================================
    // Entry points
    // ================================

    /// Start the process: declare root variables, trigger the start nodes, and
    /// run the state machine to its first quiescence.
    pub async fn start(
        &mut self,
        services: &EngineServices<'_>,
        initial: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        if self.state != ProcessState::Pending {
            return Err(ProcessError::IllegalInstanceState {
                id: self.id.clone(),
                expected: "pending".into(),
            });
        }
        let root = self.scopes.root();
        for decl in &self.definition.container.variables {
            self.scopes.declare(root, &decl.name, decl.default.clone());
        }
        for (name, value) in initial {
            self.scopes.declare(root, &name, value);
        }
        self.state = ProcessState::Active;
        self.started = true;
        self.emit(
            services,
            ProcessEvent::ProcessStarted {
                instance_id: self.id.clone(),
                process_id: self.definition.id.clone(),
                timestamp: Utc::now(),
            },
        );
        let starts: Vec<String> = self
            .definition
            .container
            .start_nodes()
            .map(|n| n.id.clone())
            .collect();
        for node_id in starts {
            self.agenda.push_back(EngineOp::Trigger {
                container: ContainerId::Process,
                node_id,
                arrival: None,
            });
        }
        self.drive(services).await
    }

    /// Deliver an external signal. A no-op against terminal instances and
    /// unsubscribed event types.
    pub async fn signal(
        &mut self,
        services: &EngineServices<'_>,
        event_type: &str,
        payload: Value,
    ) -> ProcessResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.ensure_not_suspended()?;
        self.agenda.push_back(EngineOp::Signal {
            event_type: event_type.to_string(),
            payload,
        });
        self.drive(services).await
    }

    /// Complete an active work item with its result map.
    pub async fn complete_work_item(
        &mut self,
        services: &EngineServices<'_>,
        id: WorkItemId,
        results: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        self.ensure_not_suspended()?;
        if !self.work_items.contains_key(&id) {
            return Err(ProcessError::WorkItemNotFound(id));
        }
        self.agenda
            .push_back(EngineOp::CompleteWorkItem { id, results });
        self.drive(services).await
    }

    /// Abort an active work item; its owning node instance is cancelled.
    pub async fn abort_work_item(
        &mut self,
        services: &EngineServices<'_>,
        id: WorkItemId,
    ) -> ProcessResult<()> {
        self.ensure_not_suspended()?;
        if !self.work_items.contains_key(&id) {
            return Err(ProcessError::WorkItemNotFound(id));
        }
        self.agenda.push_back(EngineOp::AbortWorkItem { id });
        self.drive(services).await
    }

    /// Fire a scheduled timer. Stale timer ids are ignored.
    pub async fn fire_timer(
        &mut self,
        services: &EngineServices<'_>,
        timer_id: TimerId,
    ) -> ProcessResult<()> {
        if self.state.is_terminal() || self.state == ProcessState::Suspended {
            return Ok(());
        }
        self.agenda.push_back(EngineOp::FireTimer { timer_id });
        self.drive(services).await
    }

    /// Abort the instance: cascade-cancel every live node instance bottom-up,
    /// then mark the instance aborted. Idempotent.
    pub async fn abort(&mut self, services: &EngineServices<'_>) -> ProcessResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let top_level: Vec<NodeInstanceId> = self
            .nodes
            .values()
            .filter(|n| n.container == ContainerId::Process)
            .map(|n| n.id)
            .collect();
        for id in top_level {
            self.cancel_instance(id);
        }
        self.flush_aborted_work_items(services).await;
        self.agenda.clear();
        self.timers.clear();
        self.event_subscriptions.clear();
        self.boundary_subs.clear();
        self.state = ProcessState::Aborted;
        self.emit(
            services,
            ProcessEvent::ProcessAborted {
                instance_id: self.id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    /// Re-attempt the faulted node after an operator fixed the inputs.
    pub async fn retrigger(&mut self, services: &EngineServices<'_>) -> ProcessResult<()> {
        if self.state != ProcessState::Error {
            return Err(ProcessError::IllegalInstanceState {
                id: self.id.clone(),
                expected: "error".into(),
            });
        }
        let fault = self
            .fault
            .take()
            .ok_or_else(|| ProcessError::InternalError("error state without fault".into()))?;
        self.state = ProcessState::Active;
        self.agenda.push_back(EngineOp::Trigger {
            container: fault.container,
            node_id: fault.node_id,
            arrival: None,
        });
        self.drive(services).await
    }

    /// Pause the instance. Only reachable from `Active`.
    pub fn suspend(&mut self) -> ProcessResult<()> {
        if self.state != ProcessState::Active {
            return Err(ProcessError::IllegalInstanceState {
                id: self.id.clone(),
                expected: "active".into(),
            });
        }
        self.state = ProcessState::Suspended;
        Ok(())
    }

    /// Resume a suspended instance.
    pub fn resume(&mut self) -> ProcessResult<()> {
        if self.state != ProcessState::Suspended {
            return Err(ProcessError::IllegalInstanceState {
                id: self.id.clone(),
                expected: "suspended".into(),
            });
        }
        self.state = ProcessState::Active;
        Ok(())
    }

    fn ensure_not_suspended(&self) -> ProcessResult<()> {
        if self.state == ProcessState::Suspended {
            return Err(ProcessError::InstanceSuspended(self.id.clone()));
        }
        Ok(())
    }

    // ================================
    // Runtime integration
    // ================================

    pub(crate) fn take_pending_spawns(&mut self) -> Vec<SubProcessSpawn> {
        std::mem::take(&mut self.pending_spawns)
    }

    pub(crate) fn take_pending_timer_arms(&mut self) -> Vec<(TimerId, u64)> {
        let ids = std::mem::take(&mut self.pending_timer_arms);
        ids.into_iter()
            .filter_map(|id| self.timers.get(&id).map(|t| (id, t.delay_ms)))
            .collect()
    }

    pub(crate) fn take_pending_child_aborts(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_child_aborts)
    }

    pub(crate) fn set_sub_process_child(&mut self, node_instance: NodeInstanceId, child_id: &str) {
        if let Some(inst) = self.nodes.get_mut(&node_instance) {
            if let NodeRuntime::SubProcess {
                child_instance_id, ..
            } = &mut inst.runtime
            {
                *child_instance_id = Some(child_id.to_string());
            }
        }
    }

    /// Called by the runtime when a waited-for child instance completed.
    pub async fn on_sub_process_completed(
        &mut self,
        services: &EngineServices<'_>,
        node_instance: NodeInstanceId,
        outputs: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.agenda.push_back(EngineOp::ResumeSubProcess {
            instance: node_instance,
            outputs,
        });
        self.drive(services).await
    }

    /// Called by the runtime when a waited-for child ended in a fault.
    pub async fn on_sub_process_faulted(
        &mut self,
        services: &EngineServices<'_>,
        node_instance: NodeInstanceId,
        fault_name: String,
        data: Option<Value>,
    ) -> ProcessResult<()> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let Some(inst) = self.nodes.get(&node_instance) else {
            return Ok(());
        };
        let container = inst.container;
        let node_id = inst.node_id().unwrap_or_default().to_string();
        self.cancel_instance(node_instance);
        self.resolve_fault(services, container, &node_id, &fault_name, data)?;
        self.drive(services).await
    }

    // ================================
    // Agenda loop
    // ================================

    async fn drive(&mut self, services: &EngineServices<'_>) -> ProcessResult<()> {
        let mut steps = 0;
        while let Some(op) = self.agenda.pop_front() {
            if self.state.is_terminal() {
                self.agenda.clear();
                break;
            }
            steps += 1;
            if steps > self.config.max_steps {
                return Err(ProcessError::MaxStepsExceeded(self.config.max_steps));
            }
            self.execute_op(op, services).await?;
            self.flush_aborted_work_items(services).await;
            self.check_process_drain(services);
        }
        self.check_process_drain(services);
        Ok(())
    }

    async fn execute_op(
        &mut self,
        op: EngineOp,
        services: &EngineServices<'_>,
    ) -> ProcessResult<()> {
        match op {
            EngineOp::Trigger {
                container,
                node_id,
                arrival,
            } => self.trigger_node(services, container, &node_id, arrival).await,
            EngineOp::TriggerExisting { instance } => {
                self.dispatch_trigger(services, instance).await
            }
            EngineOp::CompleteWorkItem { id, results } => {
                self.apply_work_item_completion(services, id, results)
            }
            EngineOp::AbortWorkItem { id } => self.apply_work_item_abort(services, id),
            EngineOp::Signal {
                event_type,
                payload,
            } => self.handle_signal(services, &event_type, payload),
            EngineOp::FireTimer { timer_id } => self.apply_timer_fired(services, timer_id),
            EngineOp::ResumeSubProcess { instance, outputs } => {
                self.apply_sub_process_resume(services, instance, outputs)
            }
        }
    }

    async fn flush_aborted_work_items(&mut self, services: &EngineServices<'_>) {
        let aborted = std::mem::take(&mut self.aborted_work_items);
        for item in aborted {
            if let Some(handler) = services.handlers.get(&item.work_name) {
                let mut manager = WorkItemManager::new();
                handler.abort_work_item(&item, &mut manager).await;
                self.enqueue_dispositions(manager.drain());
            }
        }
    }

    fn check_process_drain(&mut self, services: &EngineServices<'_>) {
        if self.state == ProcessState::Active
            && self.started
            && self.nodes.is_empty()
            && self.agenda.is_empty()
            && self.pending_spawns.is_empty()
        {
            self.complete_process(services);
        }
    }

    fn complete_process(&mut self, services: &EngineServices<'_>) {
        self.state = ProcessState::Completed;
        self.agenda.clear();
        self.timers.clear();
        self.event_subscriptions.clear();
        self.boundary_subs.clear();
        self.emit(
            services,
            ProcessEvent::ProcessCompleted {
                instance_id: self.id.clone(),
                timestamp: Utc::now(),
            },
        );
    }

    // ================================
    // Node triggering
    // ================================

    async fn trigger_node(
        &mut self,
        services: &EngineServices<'_>,
        container: ContainerId,
        node_id: &str,
        arrival: Option<String>,
    ) -> ProcessResult<()> {
        let definition = Arc::clone(&self.definition);
        let node_def = resolve_container_def(&definition, &self.nodes, container)?
            .node(node_id)
            .ok_or_else(|| ProcessError::NodeNotFound(node_id.to_string()))?
            .clone();

        if let NodeKind::Join { kind } = node_def.kind {
            return self.trigger_join(services, container, node_id, kind, arrival);
        }

        let id = self.create_instance(container, DefRef::Node(node_id.to_string()));
        self.arm_boundaries(&definition, container, node_id, id)?;
        self.dispatch_trigger(services, id).await
    }

    fn trigger_join(
        &mut self,
        services: &EngineServices<'_>,
        container: ContainerId,
        node_id: &str,
        kind: JoinKind,
        arrival: Option<String>,
    ) -> ProcessResult<()> {
        match kind {
            JoinKind::Xor => {
                let id = self.create_instance(container, DefRef::Node(node_id.to_string()));
                self.set_state(id, NodeInstanceState::Triggered);
                self.emit_node_triggered(services, id);
                self.complete_and_continue(services, id, Continuation::Default)
            }
            JoinKind::And => {
                let definition = Arc::clone(&self.definition);
                let needed = resolve_container_def(&definition, &self.nodes, container)?
                    .incoming(node_id)
                    .count();
                let existing = self
                    .nodes
                    .values()
                    .find(|n| {
                        n.container == container && n.node_id() == Some(node_id) && n.is_live()
                    })
                    .map(|n| n.id);
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id =
                            self.create_instance(container, DefRef::Node(node_id.to_string()));
                        if let Some(inst) = self.nodes.get_mut(&id) {
                            inst.state = NodeInstanceState::Active;
                            inst.runtime = NodeRuntime::Join {
                                arrivals: Vec::new(),
                            };
                        }
                        self.emit_node_triggered(services, id);
                        id
                    }
                };
                let key = arrival.unwrap_or_else(|| "external".to_string());
                let satisfied = {
                    let inst = self
                        .nodes
                        .get_mut(&id)
                        .ok_or(ProcessError::NodeInstanceNotFound(id))?;
                    if let NodeRuntime::Join { arrivals } = &mut inst.runtime {
                        if !arrivals.contains(&key) {
                            arrivals.push(key);
                        }
                        arrivals.len() >= needed
                    } else {
                        false
                    }
                };
                if satisfied {
                    self.complete_and_continue(services, id, Continuation::Default)?;
                }
                Ok(())
            }
        }
    }

    async fn dispatch_trigger(
        &mut self,
        services: &EngineServices<'_>,
        id: NodeInstanceId,
    ) -> ProcessResult<()> {
        let Some(inst) = self.nodes.get(&id) else {
            return Ok(());
        };
        // Trigger is delivered at most once per instance.
        if inst.state != NodeInstanceState::Created {
            return Ok(());
        }
        let container = inst.container;
        let def_ref = inst.def.clone();
        self.set_state(id, NodeInstanceState::Triggered);
        self.emit_node_triggered(services, id);

        match def_ref {
            DefRef::Node(node_id) => {
                let definition = Arc::clone(&self.definition);
                let node_def = resolve_container_def(&definition, &self.nodes, container)?
                    .node(&node_id)
                    .ok_or_else(|| ProcessError::NodeNotFound(node_id.clone()))?
                    .clone();
                self.dispatch_static(services, id, container, node_def).await
            }
            DefRef::DynamicWorkItem {
                work_name,
                parameters,
            } => {
                self.execute_work_item_node(services, id, work_name, parameters)
                    .await
            }
            DefRef::DynamicSubProcess {
                process_id,
                parameters,
            } => {
                if let Some(inst) = self.nodes.get_mut(&id) {
                    inst.state = NodeInstanceState::Active;
                    inst.runtime = NodeRuntime::SubProcess {
                        child_instance_id: None,
                        wait: true,
                        independent: true,
                    };
                }
                self.pending_spawns.push(SubProcessSpawn {
                    node_instance: id,
                    process_id,
                    parameters,
                    wait_for_completion: true,
                    independent: true,
                });
                Ok(())
            }
            DefRef::ForEachBody => Err(ProcessError::InternalError(
                "iteration containers are not triggered through dispatch".into(),
            )),
        }
    }

    async fn dispatch_static(
        &mut self,
        services: &EngineServices<'_>,
        id: NodeInstanceId,
        container: ContainerId,
        node_def: NodeDefinition,
    ) -> ProcessResult<()> {
        match node_def.kind {
            NodeKind::Start => self.complete_and_continue(services, id, Continuation::Default),
            NodeKind::End { terminate } => self.handle_end(services, id, terminate),
            NodeKind::Action { action } => {
                match self.run_action_at(container, action.as_ref()) {
                    Ok(()) => self.complete_and_continue(services, id, Continuation::Default),
                    Err(e) => {
                        warn!(node = %node_def.id, error = %e, "action node failed");
                        self.cancel_instance(id);
                        self.resolve_fault(
                            services,
                            container,
                            &node_def.id,
                            FAULT_ERROR,
                            Some(Value::String(e.to_string())),
                        )
                    }
                }
            }
            NodeKind::Split { kind, branches } => {
                let scope = self.scope_of(container);
                let resolve = |name: &str| self.scopes.get(scope, name);
                let continuation = match kind {
                    SplitKind::And => Some(Continuation::All),
                    SplitKind::Xor => {
                        let mut sorted: Vec<_> = branches.iter().collect();
                        sorted.sort_by_key(|b| b.priority);
                        sorted
                            .into_iter()
                            .find(|b| {
                                b.guard
                                    .as_ref()
                                    .map_or(true, |g| evaluate_group(g, &resolve))
                            })
                            .map(|b| Continuation::Ports(vec![b.port.clone()]))
                    }
                    SplitKind::Or => {
                        let matched: Vec<String> = branches
                            .iter()
                            .filter(|b| {
                                b.guard
                                    .as_ref()
                                    .map(|g| evaluate_group(g, &resolve))
                                    .unwrap_or(false)
                            })
                            .map(|b| b.port.clone())
                            .collect();
                        if !matched.is_empty() {
                            Some(Continuation::Ports(matched))
                        } else {
                            branches
                                .iter()
                                .find(|b| b.guard.is_none())
                                .map(|b| Continuation::Ports(vec![b.port.clone()]))
                        }
                    }
                };
                match continuation {
                    Some(cont) => self.complete_and_continue(services, id, cont),
                    None => {
                        self.cancel_instance(id);
                        self.resolve_fault(services, container, &node_def.id, FAULT_NO_BRANCH, None)
                    }
                }
            }
            NodeKind::Join { .. } => Err(ProcessError::InternalError(
                "joins are handled at trigger time".into(),
            )),
            NodeKind::WorkItem(wi_def) => {
                let scope = self.scope_of(container);
                match self.resolve_bindings(scope, &wi_def) {
                    Ok(parameters) => {
                        self.execute_work_item_node(
                            services,
                            id,
                            wi_def.work_name.clone(),
                            parameters,
                        )
                        .await
                    }
                    Err(e) => {
                        self.cancel_instance(id);
                        self.resolve_fault(
                            services,
                            container,
                            &node_def.id,
                            FAULT_ERROR,
                            Some(Value::String(e.to_string())),
                        )
                    }
                }
            }
            NodeKind::Composite(cdef) => self.enter_container(services, id, &cdef, false),
            NodeKind::Dynamic(cdef) => self.enter_container(services, id, &cdef, true),
            NodeKind::SubProcess(sdef) => {
                let scope = self.scope_of(container);
                let mut parameters = HashMap::new();
                for (from, to) in &sdef.in_mappings {
                    let value = self.scopes.get(scope, from).unwrap_or(Value::Null);
                    parameters.insert(to.clone(), value);
                }
                if let Some(inst) = self.nodes.get_mut(&id) {
                    inst.state = NodeInstanceState::Active;
                    inst.runtime = NodeRuntime::SubProcess {
                        child_instance_id: None,
                        wait: sdef.wait_for_completion,
                        independent: sdef.independent,
                    };
                }
                self.pending_spawns.push(SubProcessSpawn {
                    node_instance: id,
                    process_id: sdef.process_id.clone(),
                    parameters,
                    wait_for_completion: sdef.wait_for_completion,
                    independent: sdef.independent,
                });
                if !sdef.wait_for_completion {
                    self.complete_and_continue(services, id, Continuation::Default)?;
                }
                Ok(())
            }
            NodeKind::Fault {
                fault_name,
                fault_variable,
            } => {
                let scope = self.scope_of(container);
                let data = fault_variable
                    .as_deref()
                    .and_then(|v| self.scopes.get(scope, v));
                self.set_state(id, NodeInstanceState::Aborted);
                self.remove_instance(id);
                self.resolve_fault(services, container, &node_def.id, &fault_name, data)
            }
            NodeKind::Timer(tdef) => {
                let timer_id = self.next_timer_id;
                self.next_timer_id += 1;
                self.timers.insert(
                    timer_id,
                    TimerSubscription {
                        node_instance: id,
                        delay_ms: tdef.delay_ms,
                        armed_at_ms: services.context.time_provider.now_millis(),
                    },
                );
                self.pending_timer_arms.push(timer_id);
                if let Some(inst) = self.nodes.get_mut(&id) {
                    inst.state = NodeInstanceState::Active;
                    inst.runtime = NodeRuntime::Timer { timer_id };
                }
                Ok(())
            }
            NodeKind::Event(edef) => {
                self.event_subscriptions
                    .entry(edef.event_type.clone())
                    .or_default()
                    .push(id);
                if let Some(inst) = self.nodes.get_mut(&id) {
                    inst.state = NodeInstanceState::Active;
                    inst.runtime = NodeRuntime::Event {
                        event_type: edef.event_type.clone(),
                    };
                }
                Ok(())
            }
            NodeKind::ForEach(fdef) => {
                let scope = self.scope_of(container);
                let items = match self.scopes.get(scope, &fdef.collection_variable) {
                    Some(Value::Array(items)) => items,
                    Some(_) | None if self.config.strict_variables => {
                        self.cancel_instance(id);
                        return self.resolve_fault(
                            services,
                            container,
                            &node_def.id,
                            FAULT_ERROR,
                            Some(Value::String(format!(
                                "collection variable '{}' is not an array",
                                fdef.collection_variable
                            ))),
                        );
                    }
                    _ => Vec::new(),
                };
                let own_scope = self.scopes.create_child(scope);
                if let Some(inst) = self.nodes.get_mut(&id) {
                    inst.state = NodeInstanceState::Active;
                    inst.runtime = NodeRuntime::Container { scope: own_scope };
                }
                let starts: Vec<String> =
                    fdef.body.start_nodes().map(|n| n.id.clone()).collect();
                for item in items {
                    let iter_scope = self.scopes.create_child(own_scope);
                    self.scopes.declare(iter_scope, &fdef.item_variable, item);
                    let iter_id = self.create_instance(ContainerId::Node(id), DefRef::ForEachBody);
                    if let Some(inst) = self.nodes.get_mut(&iter_id) {
                        inst.state = NodeInstanceState::Active;
                        inst.runtime = NodeRuntime::Container { scope: iter_scope };
                    }
                    for start in &starts {
                        self.agenda.push_back(EngineOp::Trigger {
                            container: ContainerId::Node(iter_id),
                            node_id: start.clone(),
                            arrival: None,
                        });
                    }
                }
                self.check_container_completion(services, ContainerId::Node(id))
            }
            NodeKind::Boundary(_) => {
                self.complete_and_continue(services, id, Continuation::Default)
            }
        }
    }

    /// Activate a composite or dynamic container instance: child scope,
    /// declared variables, embedded start nodes.
    fn enter_container(
        &mut self,
        services: &EngineServices<'_>,
        id: NodeInstanceId,
        cdef: &ContainerDef,
        dynamic: bool,
    ) -> ProcessResult<()> {
        let parent_scope = {
            let inst = self
                .nodes
                .get(&id)
                .ok_or(ProcessError::NodeInstanceNotFound(id))?;
            self.scope_of(inst.container)
        };
        let scope = self.scopes.create_child(parent_scope);
        for decl in &cdef.variables {
            self.scopes.declare(scope, &decl.name, decl.default.clone());
        }
        if let Some(inst) = self.nodes.get_mut(&id) {
            inst.state = NodeInstanceState::Active;
            inst.runtime = NodeRuntime::Container { scope };
        }
        for start in cdef.start_nodes() {
            self.agenda.push_back(EngineOp::Trigger {
                container: ContainerId::Node(id),
                node_id: start.id.clone(),
                arrival: None,
            });
        }
        // A dynamic container whose static sub-graph is empty passes straight
        // through under its completion condition; one carrying templates stays
        // active until children come and go.
        if dynamic && cdef.nodes.is_empty() {
            self.check_container_completion(services, ContainerId::Node(id))?;
        }
        Ok(())
    }

    async fn execute_work_item_node(
        &mut self,
        services: &EngineServices<'_>,
        id: NodeInstanceId,
        work_name: String,
        parameters: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        let work_item_id = self.next_work_item_id;
        self.next_work_item_id += 1;
        let item = WorkItem {
            id: work_item_id,
            work_name: work_name.clone(),
            parameters,
            state: WorkItemState::Active,
            process_instance_id: self.id.clone(),
        };
        self.work_items.insert(work_item_id, item.clone());
        self.work_item_nodes.insert(work_item_id, id);
        if let Some(inst) = self.nodes.get_mut(&id) {
            inst.state = NodeInstanceState::Active;
            inst.runtime = NodeRuntime::WorkItem { work_item_id };
        }
        self.emit(
            services,
            ProcessEvent::WorkItemCreated {
                instance_id: self.id.clone(),
                work_item_id,
                work_name: work_name.clone(),
                timestamp: Utc::now(),
            },
        );

        let Some(handler) = services.handlers.get(&work_name) else {
            // Handlers are a runtime concern: an unregistered type surfaces to
            // the caller when the work item is created, and the instance is
            // left retriggerable.
            let (container, node_id) = {
                let inst = self.nodes.get(&id);
                (
                    inst.map(|n| n.container).unwrap_or(ContainerId::Process),
                    inst
                        .and_then(|n| n.node_id())
                        .unwrap_or_default()
                        .to_string(),
                )
            };
            self.work_items.remove(&work_item_id);
            self.work_item_nodes.remove(&work_item_id);
            self.cancel_instance(id);
            self.fault = Some(ProcessFault {
                fault_name: FAULT_ERROR.to_string(),
                node_id,
                container,
                data: Some(Value::String(format!(
                    "no work item handler registered for '{work_name}'"
                ))),
            });
            self.state = ProcessState::Error;
            self.agenda.clear();
            return Err(ProcessError::NoWorkItemHandler(work_name));
        };

        let mut manager = WorkItemManager::new();
        handler.execute_work_item(&item, &mut manager).await;
        self.enqueue_dispositions(manager.drain());
        Ok(())
    }

    fn enqueue_dispositions(&mut self, dispositions: Vec<WorkItemDisposition>) {
        for disposition in dispositions {
            match disposition {
                WorkItemDisposition::Complete { id, results } => {
                    self.agenda
                        .push_back(EngineOp::CompleteWorkItem { id, results });
                }
                WorkItemDisposition::Abort { id } => {
                    self.agenda.push_back(EngineOp::AbortWorkItem { id });
                }
            }
        }
    }

    fn resolve_bindings(
        &self,
        scope: ScopeId,
        def: &WorkItemDef,
    ) -> Result<HashMap<String, Value>, NodeError> {
        let mut out = HashMap::new();
        for (name, binding) in &def.parameters {
            let value = match binding {
                crate::definition::types::ParamBinding::Literal(v) => v.clone(),
                crate::definition::types::ParamBinding::Variable(var) => {
                    match self.scopes.get(scope, var) {
                        Some(v) => v,
                        None if self.config.strict_variables => {
                            return Err(NodeError::VariableNotFound(var.clone()));
                        }
                        None => Value::Null,
                    }
                }
            };
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    // ================================
    // Completion / continuation
    // ================================

    fn handle_end(
        &mut self,
        services: &EngineServices<'_>,
        id: NodeInstanceId,
        terminate: bool,
    ) -> ProcessResult<()> {
        let Some(inst) = self.nodes.get(&id) else {
            return Ok(());
        };
        let container = inst.container;
        self.set_state(id, NodeInstanceState::Completed);
        self.emit_node_completed(services, id);
        self.remove_instance(id);

        if terminate {
            let siblings: Vec<NodeInstanceId> = self
                .nodes
                .values()
                .filter(|n| n.container == container)
                .map(|n| n.id)
                .collect();
            for sibling in siblings {
                self.cancel_instance(sibling);
            }
            self.agenda.retain(|op| !op_targets_container(op, container));
            match container {
                ContainerId::Process => self.complete_process(services),
                ContainerId::Node(owner) => {
                    self.complete_and_continue(services, owner, Continuation::Default)?;
                }
            }
            return Ok(());
        }

        if let ContainerId::Node(owner) = container {
            if self.children_of(container).is_empty() && !self.has_pending_ops(container) {
                let policy = self.completion_policy(owner)?;
                match policy {
                    None => {
                        // Static composites complete through their end nodes.
                        self.complete_and_continue(services, owner, Continuation::Default)?;
                    }
                    Some(_) => self.check_container_completion(services, container)?,
                }
            }
        }
        Ok(())
    }

    fn complete_and_continue(
        &mut self,
        services: &EngineServices<'_>,
        id: NodeInstanceId,
        continuation: Continuation,
    ) -> ProcessResult<()> {
        let Some(inst) = self.nodes.get(&id) else {
            return Ok(());
        };
        let container = inst.container;
        let def_ref = inst.def.clone();
        self.set_state(id, NodeInstanceState::Completed);
        self.emit_node_completed(services, id);

        if let DefRef::Node(node_id) = &def_ref {
            let definition = Arc::clone(&self.definition);
            let cdef = resolve_container_def(&definition, &self.nodes, container)?;
            let connections: Vec<Connection> = match continuation {
                Continuation::Default => cdef.outgoing(node_id, PORT_OUT).cloned().collect(),
                Continuation::Ports(ports) => ports
                    .iter()
                    .flat_map(|p| cdef.outgoing(node_id, p).cloned().collect::<Vec<_>>())
                    .collect(),
                Continuation::All => cdef.outgoing_all(node_id).cloned().collect(),
            };
            for conn in connections {
                self.agenda.push_back(EngineOp::Trigger {
                    container,
                    node_id: conn.to.clone(),
                    arrival: Some(conn.arrival_key()),
                });
            }
        }

        self.remove_instance(id);
        self.check_container_completion(services, container)
    }

    /// Container completion policy, re-evaluated after every child removal.
    fn check_container_completion(
        &mut self,
        services: &EngineServices<'_>,
        container: ContainerId,
    ) -> ProcessResult<()> {
        let ContainerId::Node(owner) = container else {
            // The process root drains through the agenda loop.
            return Ok(());
        };
        let Some(inst) = self.nodes.get(&owner) else {
            return Ok(());
        };
        if inst.state != NodeInstanceState::Active {
            return Ok(());
        }
        if !self.children_of(container).is_empty() || self.has_pending_ops(container) {
            return Ok(());
        }
        let scope = inst.scope();
        match self.completion_policy(owner)? {
            None => Ok(()),
            Some(CompletionCondition::Autocomplete) => {
                debug!(instance = self.id.as_str(), owner, "container autocompleted");
                self.complete_and_continue(services, owner, Continuation::Default)
            }
            Some(CompletionCondition::Expression(group)) => {
                let scope = scope.unwrap_or_else(|| self.scopes.root());
                let holds = evaluate_group(&group, |name| self.scopes.get(scope, name));
                if holds {
                    self.complete_and_continue(services, owner, Continuation::Default)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Effective completion policy of a container instance.
    fn completion_policy(
        &self,
        owner: NodeInstanceId,
    ) -> ProcessResult<Option<CompletionCondition>> {
        let Some(inst) = self.nodes.get(&owner) else {
            return Ok(None);
        };
        match &inst.def {
            DefRef::ForEachBody => Ok(Some(CompletionCondition::Autocomplete)),
            DefRef::Node(node_id) => {
                let cdef = resolve_container_def(&self.definition, &self.nodes, inst.container)?;
                let node = cdef
                    .node(node_id)
                    .ok_or_else(|| ProcessError::NodeNotFound(node_id.clone()))?;
                match &node.kind {
                    NodeKind::Composite(c) | NodeKind::Dynamic(c) => Ok(c.completion.clone()),
                    NodeKind::ForEach(_) => Ok(Some(CompletionCondition::Autocomplete)),
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    fn children_of(&self, container: ContainerId) -> Vec<NodeInstanceId> {
        self.nodes
            .values()
            .filter(|n| n.container == container)
            .map(|n| n.id)
            .collect()
    }

    fn has_pending_ops(&self, container: ContainerId) -> bool {
        self.agenda.iter().any(|op| op_targets_container(op, container))
    }

    // ================================
    // Work items, timers, sub-processes
    // ================================

    fn apply_work_item_completion(
        &mut self,
        services: &EngineServices<'_>,
        id: WorkItemId,
        results: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        let Some(node) = self.work_item_nodes.remove(&id) else {
            return Ok(());
        };
        if let Some(mut item) = self.work_items.remove(&id) {
            item.state = WorkItemState::Completed;
            self.emit(
                services,
                ProcessEvent::WorkItemCompleted {
                    instance_id: self.id.clone(),
                    work_item_id: id,
                    timestamp: Utc::now(),
                },
            );
        }
        let Some(inst) = self.nodes.get(&node) else {
            return Ok(());
        };
        let container = inst.container;
        let scope = self.scope_of(container);

        // Map results back into the triggering node's scope.
        match &inst.def {
            DefRef::Node(node_id) => {
                let definition = Arc::clone(&self.definition);
                let mappings = resolve_container_def(&definition, &self.nodes, container)?
                    .node(node_id)
                    .and_then(|n| match &n.kind {
                        NodeKind::WorkItem(def) => Some(def.results.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                for mapping in mappings {
                    if let Some(value) = results.get(&mapping.result_key) {
                        self.scopes.set(scope, &mapping.variable, value.clone());
                    }
                }
            }
            DefRef::DynamicWorkItem { .. } => {
                for (key, value) in &results {
                    self.scopes.set(scope, key, value.clone());
                }
            }
            _ => {}
        }
        self.complete_and_continue(services, node, Continuation::Default)
    }

    fn apply_work_item_abort(
        &mut self,
        services: &EngineServices<'_>,
        id: WorkItemId,
    ) -> ProcessResult<()> {
        let Some(node) = self.work_item_nodes.remove(&id) else {
            return Ok(());
        };
        if let Some(mut item) = self.work_items.remove(&id) {
            item.state = WorkItemState::Aborted;
            self.aborted_work_items.push(item);
        }
        let container = self.nodes.get(&node).map(|n| n.container);
        self.cancel_instance(node);
        if let Some(container) = container {
            self.check_container_completion(services, container)?;
        }
        Ok(())
    }

    fn apply_timer_fired(
        &mut self,
        services: &EngineServices<'_>,
        timer_id: TimerId,
    ) -> ProcessResult<()> {
        let Some(sub) = self.timers.remove(&timer_id) else {
            return Ok(());
        };
        self.complete_and_continue(services, sub.node_instance, Continuation::Default)
    }

    fn apply_sub_process_resume(
        &mut self,
        services: &EngineServices<'_>,
        instance: NodeInstanceId,
        outputs: HashMap<String, Value>,
    ) -> ProcessResult<()> {
        let Some(inst) = self.nodes.get(&instance) else {
            return Ok(());
        };
        let container = inst.container;
        let scope = self.scope_of(container);
        if let DefRef::Node(node_id) = &inst.def {
            let definition = Arc::clone(&self.definition);
            let mappings = resolve_container_def(&definition, &self.nodes, container)?
                .node(node_id)
                .and_then(|n| match &n.kind {
                    NodeKind::SubProcess(def) => Some(def.out_mappings.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            for (from, to) in mappings {
                if let Some(value) = outputs.get(&from) {
                    self.scopes.set(scope, &to, value.clone());
                }
            }
        }
        self.complete_and_continue(services, instance, Continuation::Default)
    }

    // ================================
    // Signals, boundaries, compensation
    // ================================

    fn handle_signal(
        &mut self,
        services: &EngineServices<'_>,
        event_type: &str,
        payload: Value,
    ) -> ProcessResult<()> {
        self.emit(
            services,
            ProcessEvent::SignalReceived {
                instance_id: self.id.clone(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
                timestamp: Utc::now(),
            },
        );

        if event_type == SIGNAL_COMPENSATE {
            let target = payload.as_str().unwrap_or_default().to_string();
            return self.trigger_compensation(&target);
        }

        // Event-node subscriptions: every subscribed instance resumes.
        let subscribers = self
            .event_subscriptions
            .remove(event_type)
            .unwrap_or_default();
        for sub in subscribers {
            let Some(inst) = self.nodes.get(&sub) else {
                continue;
            };
            let container = inst.container;
            if let DefRef::Node(node_id) = inst.def.clone() {
                let definition = Arc::clone(&self.definition);
                let variable = resolve_container_def(&definition, &self.nodes, container)?
                    .node(&node_id)
                    .and_then(|n| match &n.kind {
                        NodeKind::Event(def) => def.variable.clone(),
                        _ => None,
                    });
                if let Some(var) = variable {
                    let scope = self.scope_of(container);
                    self.scopes.set(scope, &var, payload.clone());
                }
            }
            self.complete_and_continue(services, sub, Continuation::Default)?;
        }

        // Boundary events armed on live node instances.
        let matched: Vec<BoundarySub> = self
            .boundary_subs
            .iter()
            .filter(|b| b.event_type == event_type)
            .cloned()
            .collect();
        if !matched.is_empty() {
            self.boundary_subs.retain(|b| b.event_type != event_type);
            for sub in matched {
                if !self.nodes.contains_key(&sub.attached) {
                    continue;
                }
                self.agenda.push_back(EngineOp::Trigger {
                    container: sub.container,
                    node_id: sub.boundary_node_id.clone(),
                    arrival: None,
                });
                if sub.cancel_activity {
                    let container = self.nodes.get(&sub.attached).map(|n| n.container);
                    self.cancel_instance(sub.attached);
                    if let Some(container) = container {
                        self.check_container_completion(services, container)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Out-of-band invocation of the compensation handler registered for the
    /// signalled activity.
    fn trigger_compensation(&mut self, target: &str) -> ProcessResult<()> {
        let found = self
            .definition
            .container
            .compensation
            .iter()
            .find(|c| c.for_node == target)
            .map(|c| (ContainerId::Process, c.handler_node.clone()));

        let found = found.or_else(|| {
            self.nodes.values().find_map(|inst| {
                if !inst.is_live() {
                    return None;
                }
                let cdef =
                    resolve_container_def(&self.definition, &self.nodes, ContainerId::Node(inst.id))
                        .ok()?;
                cdef.compensation
                    .iter()
                    .find(|c| c.for_node == target)
                    .map(|c| (ContainerId::Node(inst.id), c.handler_node.clone()))
            })
        });

        if let Some((container, handler_node)) = found {
            self.agenda.push_back(EngineOp::Trigger {
                container,
                node_id: handler_node,
                arrival: None,
            });
        }
        Ok(())
    }

    fn arm_boundaries(
        &mut self,
        definition: &ProcessDefinition,
        container: ContainerId,
        node_id: &str,
        attached: NodeInstanceId,
    ) -> ProcessResult<()> {
        let cdef = resolve_container_def(definition, &self.nodes, container)?;
        let boundaries: Vec<BoundarySub> = cdef
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Boundary(b) if b.attached_to == node_id => Some(BoundarySub {
                    event_type: b.event_type.clone(),
                    container,
                    boundary_node_id: n.id.clone(),
                    attached,
                    cancel_activity: b.cancel_activity,
                }),
                _ => None,
            })
            .collect();
        self.boundary_subs.extend(boundaries);
        Ok(())
    }

    // ================================
    // Fault resolution
    // ================================

    /// Chain-of-responsibility lookup for the nearest enclosing exception
    /// handler, walking outward from the faulting container to the root.
    fn resolve_fault(
        &mut self,
        services: &EngineServices<'_>,
        origin: ContainerId,
        origin_node: &str,
        fault_name: &str,
        data: Option<Value>,
    ) -> ProcessResult<()> {
        self.emit(
            services,
            ProcessEvent::FaultRaised {
                instance_id: self.id.clone(),
                fault_name: fault_name.to_string(),
                node_id: origin_node.to_string(),
                timestamp: Utc::now(),
            },
        );

        let definition = Arc::clone(&self.definition);
        let mut container = origin;
        loop {
            let handler = {
                let cdef = resolve_container_def(&definition, &self.nodes, container)?;
                find_handler(&cdef.exception_handlers, fault_name).cloned()
            };
            if let Some(handler) = handler {
                debug!(
                    instance = self.id.as_str(),
                    fault = fault_name,
                    "exception handler matched"
                );
                self.emit(
                    services,
                    ProcessEvent::HandlerInvoked {
                        instance_id: self.id.clone(),
                        fault_name: fault_name.to_string(),
                        timestamp: Utc::now(),
                    },
                );
                let scope = self.scope_of(container);
                if let Some(var) = &handler.fault_variable {
                    self.scopes
                        .declare(scope, var, data.clone().unwrap_or(Value::Null));
                }
                match &handler.action {
                    HandlerAction::Run(action) => {
                        if let Err(e) = self.run_action_at(container, action.as_ref()) {
                            warn!(
                                instance = self.id.as_str(),
                                fault = fault_name,
                                error = %e,
                                "exception handler action failed"
                            );
                            return self.enter_error_state(
                                services,
                                origin_node,
                                origin,
                                fault_name,
                                data,
                            );
                        }
                    }
                    HandlerAction::SignalEvent { event_type } => {
                        self.agenda.push_back(EngineOp::Signal {
                            event_type: event_type.clone(),
                            payload: data.clone().unwrap_or(Value::Null),
                        });
                    }
                    HandlerAction::TriggerNode { node_id } => {
                        self.agenda.push_back(EngineOp::Trigger {
                            container,
                            node_id: node_id.clone(),
                            arrival: None,
                        });
                    }
                }
                return Ok(());
            }
            match container {
                ContainerId::Process => break,
                ContainerId::Node(i) => {
                    container = self
                        .nodes
                        .get(&i)
                        .map(|n| n.container)
                        .unwrap_or(ContainerId::Process);
                }
            }
        }

        self.enter_error_state(services, origin_node, origin, fault_name, data)
    }

    fn enter_error_state(
        &mut self,
        services: &EngineServices<'_>,
        origin_node: &str,
        origin: ContainerId,
        fault_name: &str,
        data: Option<Value>,
    ) -> ProcessResult<()> {
        self.fault = Some(ProcessFault {
            fault_name: fault_name.to_string(),
            node_id: origin_node.to_string(),
            container: origin,
            data,
        });
        self.state = ProcessState::Error;
        self.agenda.clear();
        self.emit(
            services,
            ProcessEvent::ProcessFaulted {
                instance_id: self.id.clone(),
                fault_name: fault_name.to_string(),
                node_id: origin_node.to_string(),
                timestamp: Utc::now(),
            },
        );
        Ok(())
    }

    // ================================
    // Actions
    // ================================

    fn run_action_at(
        &mut self,
        container: ContainerId,
        action: &dyn ProcessAction,
    ) -> Result<(), NodeError> {
        let scope = self.scope_of(container);
        let mut commands = Vec::new();
        {
            let mut ctx = ActionContext {
                scope,
                scopes: &mut self.scopes,
                commands: &mut commands,
            };
            action.execute(&mut ctx)?;
        }
        for command in commands {
            match command {
                ActionCommand::Signal {
                    event_type,
                    payload,
                } => self.agenda.push_back(EngineOp::Signal {
                    event_type,
                    payload,
                }),
                ActionCommand::TriggerNode { node_id } => {
                    self.agenda.push_back(EngineOp::Trigger {
                        container,
                        node_id,
                        arrival: None,
                    });
                }
            }
        }
        Ok(())
    }

    // ================================
    // Arena plumbing
    // ================================

    pub(crate) fn create_instance(
        &mut self,
        container: ContainerId,
        def: DefRef,
    ) -> NodeInstanceId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        let level = match container {
            ContainerId::Process => 1,
            ContainerId::Node(parent) => {
                self.nodes.get(&parent).map(|p| p.level + 1).unwrap_or(1)
            }
        };
        self.nodes.insert(
            id,
            NodeInstance {
                id,
                def,
                container,
                level,
                state: NodeInstanceState::Created,
                runtime: NodeRuntime::None,
            },
        );
        id
    }

    pub(crate) fn enqueue_trigger_existing(&mut self, instance: NodeInstanceId) {
        self.agenda.push_back(EngineOp::TriggerExisting { instance });
    }

    pub(crate) async fn drive_public(
        &mut self,
        services: &EngineServices<'_>,
    ) -> ProcessResult<()> {
        self.drive(services).await
    }

    fn set_state(&mut self, id: NodeInstanceId, state: NodeInstanceState) {
        if let Some(inst) = self.nodes.get_mut(&id) {
            inst.state = state;
        }
    }

    /// Cancel a node instance and (recursively, children first) everything it
    /// contains; releases scopes, subscriptions, timers, and work items.
    /// Cancellation counts as a removal, so callers that may leave the
    /// enclosing container drained follow up with
    /// [`Self::check_container_completion`].
    fn cancel_instance(&mut self, id: NodeInstanceId) {
        if !self.nodes.contains_key(&id) {
            return;
        }
        let children = self.children_of(ContainerId::Node(id));
        for child in children {
            self.cancel_instance(child);
        }
        if let Some(inst) = self.nodes.get(&id) {
            match &inst.runtime {
                NodeRuntime::WorkItem { work_item_id } => {
                    let wi = *work_item_id;
                    self.work_item_nodes.remove(&wi);
                    if let Some(mut item) = self.work_items.remove(&wi) {
                        item.state = WorkItemState::Aborted;
                        self.aborted_work_items.push(item);
                    }
                }
                NodeRuntime::SubProcess {
                    child_instance_id: Some(child),
                    independent: false,
                    ..
                } => {
                    self.pending_child_aborts.push(child.clone());
                }
                _ => {}
            }
        }
        self.set_state(id, NodeInstanceState::Aborted);
        self.remove_instance(id);
    }

    fn remove_instance(&mut self, id: NodeInstanceId) {
        if let Some(inst) = self.nodes.remove(&id) {
            if let NodeRuntime::Container { scope } = inst.runtime {
                self.scopes.remove(scope);
            }
        }
        self.timers.retain(|_, t| t.node_instance != id);
        for subs in self.event_subscriptions.values_mut() {
            subs.retain(|s| *s != id);
        }
        self.event_subscriptions.retain(|_, subs| !subs.is_empty());
        self.boundary_subs.retain(|b| b.attached != id);
    }

    /// Variable scope of a container (the root scope for the process level).
    fn scope_of(&self, container: ContainerId) -> ScopeId {
        match container {
            ContainerId::Process => self.scopes.root(),
            ContainerId::Node(i) => {
                let mut current = Some(i);
                while let Some(id) = current {
                    let Some(inst) = self.nodes.get(&id) else {
                        break;
                    };
                    if let Some(scope) = inst.scope() {
                        return scope;
                    }
                    current = match inst.container {
                        ContainerId::Process => None,
                        ContainerId::Node(parent) => Some(parent),
                    };
                }
                self.scopes.root()
            }
        }
    }

    // ================================
    // Events
    // ================================

    fn emit(&self, services: &EngineServices<'_>, event: ProcessEvent) {
        services.context.emit(event);
    }

    fn emit_node_triggered(&self, services: &EngineServices<'_>, id: NodeInstanceId) {
        if let Some(inst) = self.nodes.get(&id) {
            self.emit(
                services,
                ProcessEvent::NodeTriggered {
                    instance_id: self.id.clone(),
                    node_id: inst.node_id().unwrap_or("<dynamic>").to_string(),
                    timestamp: Utc::now(),
                },
            );
        }
    }

    fn emit_node_completed(&self, services: &EngineServices<'_>, id: NodeInstanceId) {
        if let Some(inst) = self.nodes.get(&id) {
            self.emit(
                services,
                ProcessEvent::NodeCompleted {
                    instance_id: self.id.clone(),
                    node_id: inst.node_id().unwrap_or("<dynamic>").to_string(),
                    timestamp: Utc::now(),
                },
            );
        }
    }
}

fn op_targets_container(op: &EngineOp, container: ContainerId) -> bool {
    match op {
        EngineOp::Trigger { container: c, .. } => *c == container,
        _ => false,
    }
}

/// Exact-name handlers win over the match-any sentinel.
fn find_handler<'a>(
    handlers: &'a [ExceptionHandlerDef],
    fault_name: &str,
) -> Option<&'a ExceptionHandlerDef> {
    handlers
        .iter()
        .find(|h| matches!(&h.matcher, FaultMatcher::Named(n) if n == fault_name))
        .or_else(|| {
            handlers
                .iter()
                .find(|h| matches!(h.matcher, FaultMatcher::Any))
        })
}

/// Resolve the definition sub-graph owned by a container.
pub(crate) fn resolve_container_def<'a>(
    definition: &'a ProcessDefinition,
    nodes: &HashMap<NodeInstanceId, NodeInstance>,
    container: ContainerId,
) -> ProcessResult<&'a ContainerDef> {
    match container {
        ContainerId::Process => Ok(&definition.container),
        ContainerId::Node(id) => {
            let inst = nodes
                .get(&id)
                .ok_or(ProcessError::NodeInstanceNotFound(id))?;
            match &inst.def {
                DefRef::Node(node_id) => {
                    let parent = resolve_container_def(definition, nodes, inst.container)?;
                    let node = parent
                        .node(node_id)
                        .ok_or_else(|| ProcessError::NodeNotFound(node_id.clone()))?;
                    node.kind.container().ok_or_else(|| {
                        ProcessError::InternalError(format!(
                            "node '{node_id}' is not a container"
                        ))
                    })
                }
                DefRef::ForEachBody => {
                    let ContainerId::Node(parent_id) = inst.container else {
                        return Err(ProcessError::InternalError(
                            "iteration container without a for-each parent".into(),
                        ));
                    };
                    let parent = nodes
                        .get(&parent_id)
                        .ok_or(ProcessError::NodeInstanceNotFound(parent_id))?;
                    let DefRef::Node(foreach_id) = &parent.def else {
                        return Err(ProcessError::InternalError(
                            "for-each parent without a static definition".into(),
                        ));
                    };
                    let grandparent =
                        resolve_container_def(definition, nodes, parent.container)?;
                    let node = grandparent
                        .node(foreach_id)
                        .ok_or_else(|| ProcessError::NodeNotFound(foreach_id.clone()))?;
                    match &node.kind {
                        NodeKind::ForEach(f) => Ok(&f.body),
                        _ => Err(ProcessError::InternalError(format!(
                            "node '{foreach_id}' is not a for-each"
                        ))),
                    }
                }
                _ => Err(ProcessError::InternalError(
                    "dynamic children are not containers".into(),
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::builder::ProcessBuilder;

    fn handler(matcher: FaultMatcher) -> ExceptionHandlerDef {
        ExceptionHandlerDef {
            matcher,
            fault_variable: None,
            action: HandlerAction::SignalEvent {
                event_type: "noop".into(),
            },
        }
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_steps, 500);
        assert!(!config.strict_variables);
    }

    #[test]
    fn test_process_state_terminal() {
        assert!(ProcessState::Completed.is_terminal());
        assert!(ProcessState::Aborted.is_terminal());
        assert!(ProcessState::Error.is_terminal());
        assert!(!ProcessState::Active.is_terminal());
        assert!(!ProcessState::Suspended.is_terminal());
        assert!(!ProcessState::Pending.is_terminal());
    }

    #[test]
    fn test_find_handler_exact_match_beats_default() {
        let handlers = vec![handler(FaultMatcher::Any), handler(FaultMatcher::Named("F".into()))];
        let found = find_handler(&handlers, "F").unwrap();
        assert_eq!(found.matcher, FaultMatcher::Named("F".into()));

        let found = find_handler(&handlers, "other").unwrap();
        assert_eq!(found.matcher, FaultMatcher::Any);

        assert!(find_handler(&[], "F").is_none());
    }

    #[tokio::test]
    async fn test_straight_through_process() {
        let definition = Arc::new(
            ProcessBuilder::new("org.test.unit", "unit")
                .node(crate::definition::types::NodeDefinition::start("start"))
                .node(crate::definition::types::NodeDefinition::end("end"))
                .connect("start", "end")
                .build()
                .unwrap(),
        );
        let mut instance =
            ProcessInstance::new("i-1".into(), definition, EngineConfig::default());
        let registry = WorkItemHandlerRegistry::new();
        let context = RuntimeContext::default();
        let services = EngineServices {
            handlers: &registry,
            context: &context,
        };

        assert_eq!(instance.state(), ProcessState::Pending);
        instance.start(&services, HashMap::new()).await.unwrap();
        assert_eq!(instance.state(), ProcessState::Completed);
        assert!(instance.node_instances(ContainerId::Process).is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let definition = Arc::new(
            ProcessBuilder::new("org.test.unit2", "unit2")
                .node(crate::definition::types::NodeDefinition::start("start"))
                .node(crate::definition::types::NodeDefinition::end("end"))
                .connect("start", "end")
                .build()
                .unwrap(),
        );
        let mut instance =
            ProcessInstance::new("i-2".into(), definition, EngineConfig::default());
        let registry = WorkItemHandlerRegistry::new();
        let context = RuntimeContext::default();
        let services = EngineServices {
            handlers: &registry,
            context: &context,
        };

        instance.start(&services, HashMap::new()).await.unwrap();
        let err = instance.start(&services, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::IllegalInstanceState { .. }));
    }
}
