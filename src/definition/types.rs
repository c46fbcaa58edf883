//! Immutable process-definition graph.
//!
//! A [`ProcessDefinition`] is produced once (by a front-end parser or the
//! [`ProcessBuilder`](crate::definition::builder::ProcessBuilder)) and then
//! shared read-only between all of its running instances. Nodes are a closed
//! [`NodeKind`] enum; container kinds (composite, dynamic, for-each) own their
//! own nested [`ContainerDef`] sub-graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeResult;
use crate::evaluator::ConditionGroup;
use crate::instance::ActionContext;

/// Default outgoing port for connections.
pub const PORT_OUT: &str = "out";
/// Default incoming port for connections.
pub const PORT_IN: &str = "in";

/// A directed, typed connection between two node ports within one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub from_port: String,
    pub to: String,
    pub to_port: String,
}

impl Connection {
    pub fn new(from: &str, to: &str) -> Self {
        Connection {
            from: from.to_string(),
            from_port: PORT_OUT.to_string(),
            to: to.to_string(),
            to_port: PORT_IN.to_string(),
        }
    }

    pub fn with_ports(from: &str, from_port: &str, to: &str, to_port: &str) -> Self {
        Connection {
            from: from.to_string(),
            from_port: from_port.to_string(),
            to: to.to_string(),
            to_port: to_port.to_string(),
        }
    }

    /// Key identifying this connection for join-arrival bookkeeping.
    pub fn arrival_key(&self) -> String {
        format!("{}:{}", self.from, self.from_port)
    }
}

/// A declared process or container variable with an optional default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

/// Matches a raised fault name against a handler declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultMatcher {
    /// Exact fault-name match; wins over [`FaultMatcher::Any`].
    Named(String),
    /// Match-any sentinel, the container's default handler.
    Any,
}

impl FaultMatcher {
    pub fn matches(&self, fault_name: &str) -> bool {
        match self {
            FaultMatcher::Named(name) => name == fault_name,
            FaultMatcher::Any => true,
        }
    }
}

/// What an exception handler does once selected.
#[derive(Clone)]
pub enum HandlerAction {
    /// Run an embedded action in the handling container's scope.
    Run(Arc<dyn ProcessAction>),
    /// Signal an event within the process instance.
    SignalEvent { event_type: String },
    /// Trigger a node in the handling container, outside the connection graph.
    TriggerNode { node_id: String },
}

impl fmt::Debug for HandlerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerAction::Run(_) => write!(f, "Run(<action>)"),
            HandlerAction::SignalEvent { event_type } => {
                write!(f, "SignalEvent({event_type})")
            }
            HandlerAction::TriggerNode { node_id } => write!(f, "TriggerNode({node_id})"),
        }
    }
}

/// Exception handler declared on a container level.
#[derive(Debug, Clone)]
pub struct ExceptionHandlerDef {
    pub matcher: FaultMatcher,
    /// Variable in the handling container's scope that receives the fault data.
    pub fault_variable: Option<String>,
    pub action: HandlerAction,
}

/// Associates a compensation handler node with the activity it compensates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationDef {
    pub for_node: String,
    pub handler_node: String,
}

/// Container completion policy, re-evaluated after every child removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompletionCondition {
    /// Complete as soon as no active children remain.
    Autocomplete,
    /// Complete when the expression holds and no active children remain.
    Expression(ConditionGroup),
}

/// A nested sub-graph owned by a container node (or the process root).
#[derive(Debug, Clone, Default)]
pub struct ContainerDef {
    pub nodes: Vec<NodeDefinition>,
    pub connections: Vec<Connection>,
    pub variables: Vec<VariableDecl>,
    pub exception_handlers: Vec<ExceptionHandlerDef>,
    pub compensation: Vec<CompensationDef>,
    pub completion: Option<CompletionCondition>,
}

impl ContainerDef {
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing connections of `node_id` leaving through `port`.
    pub fn outgoing<'a>(
        &'a self,
        node_id: &'a str,
        port: &'a str,
    ) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections
            .iter()
            .filter(move |c| c.from == node_id && c.from_port == port)
    }

    /// All outgoing connections of `node_id`, any port.
    pub fn outgoing_all<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.from == node_id)
    }

    /// All incoming connections of `node_id`.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Connection> + 'a {
        self.connections.iter().filter(move |c| c.to == node_id)
    }

    pub fn start_nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
    }
}

/// Branch of a split gateway, keyed by outgoing port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitBranch {
    pub port: String,
    /// Lower value wins first. Branches without a guard act as the default.
    pub priority: u32,
    pub guard: Option<ConditionGroup>,
}

/// Split gateway semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    /// Trigger every outgoing connection.
    And,
    /// Trigger the first branch whose guard holds.
    Xor,
    /// Trigger every branch whose guard holds.
    Or,
}

/// Join gateway semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Wait for an arrival on every incoming connection.
    And,
    /// Pass each arrival straight through.
    Xor,
}

/// How a work-item parameter is produced at trigger time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParamBinding {
    Literal(Value),
    /// Resolved through the node's variable-scope chain.
    Variable(String),
}

/// Maps one work-item result entry back into a process variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMapping {
    pub result_key: String,
    pub variable: String,
}

/// Work-item (external task) node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemDef {
    pub work_name: String,
    #[serde(default)]
    pub parameters: HashMap<String, ParamBinding>,
    #[serde(default)]
    pub results: Vec<ResultMapping>,
}

/// Sub-process invocation node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubProcessDef {
    pub process_id: String,
    /// Park the invoking node until the child instance ends.
    pub wait_for_completion: bool,
    /// Independent children survive the parent's abort.
    pub independent: bool,
    /// (parent variable, child variable) initial bindings.
    #[serde(default)]
    pub in_mappings: Vec<(String, String)>,
    /// (child variable, parent variable) completion bindings.
    #[serde(default)]
    pub out_mappings: Vec<(String, String)>,
}

/// Timer node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerDef {
    pub delay_ms: u64,
}

/// Intermediate catch-event node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDef {
    pub event_type: String,
    /// Variable receiving the signal payload, if any.
    pub variable: Option<String>,
}

/// For-each node: instantiates its body once per collection element.
#[derive(Debug, Clone)]
pub struct ForEachDef {
    pub collection_variable: String,
    pub item_variable: String,
    pub body: ContainerDef,
}

/// Boundary event attached to a sibling node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryDef {
    pub attached_to: String,
    pub event_type: String,
    /// Cancel the attached node instance when the event fires.
    pub cancel_activity: bool,
}

/// Embedded executable behavior for action nodes and exception handlers.
pub trait ProcessAction: Send + Sync {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> NodeResult<()>;
}

impl<F> ProcessAction for F
where
    F: Fn(&mut ActionContext<'_>) -> NodeResult<()> + Send + Sync,
{
    fn execute(&self, ctx: &mut ActionContext<'_>) -> NodeResult<()> {
        self(ctx)
    }
}

/// Closed set of node kinds; every state-machine operation dispatches over
/// this enum exhaustively.
#[derive(Clone)]
pub enum NodeKind {
    Start,
    End {
        terminate: bool,
    },
    Action {
        action: Arc<dyn ProcessAction>,
    },
    Split {
        kind: SplitKind,
        branches: Vec<SplitBranch>,
    },
    Join {
        kind: JoinKind,
    },
    WorkItem(WorkItemDef),
    Composite(ContainerDef),
    Dynamic(ContainerDef),
    SubProcess(SubProcessDef),
    Fault {
        fault_name: String,
        fault_variable: Option<String>,
    },
    Timer(TimerDef),
    Event(EventDef),
    ForEach(ForEachDef),
    Boundary(BoundaryDef),
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End { .. } => "end",
            NodeKind::Action { .. } => "action",
            NodeKind::Split { .. } => "split",
            NodeKind::Join { .. } => "join",
            NodeKind::WorkItem(_) => "work-item",
            NodeKind::Composite(_) => "composite",
            NodeKind::Dynamic(_) => "dynamic",
            NodeKind::SubProcess(_) => "sub-process",
            NodeKind::Fault { .. } => "fault",
            NodeKind::Timer(_) => "timer",
            NodeKind::Event(_) => "event",
            NodeKind::ForEach(_) => "for-each",
            NodeKind::Boundary(_) => "boundary",
        }
    }

    /// Nested sub-graph for container kinds.
    pub fn container(&self) -> Option<&ContainerDef> {
        match self {
            NodeKind::Composite(c) | NodeKind::Dynamic(c) => Some(c),
            NodeKind::ForEach(f) => Some(&f.body),
            _ => None,
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Start => write!(f, "Start"),
            NodeKind::End { terminate } => write!(f, "End {{ terminate: {terminate} }}"),
            NodeKind::Action { .. } => write!(f, "Action(<action>)"),
            NodeKind::Split { kind, branches } => {
                write!(f, "Split {{ kind: {kind:?}, branches: {} }}", branches.len())
            }
            NodeKind::Join { kind } => write!(f, "Join {{ kind: {kind:?} }}"),
            NodeKind::WorkItem(def) => write!(f, "WorkItem({})", def.work_name),
            NodeKind::Composite(c) => write!(f, "Composite({} nodes)", c.nodes.len()),
            NodeKind::Dynamic(c) => write!(f, "Dynamic({} nodes)", c.nodes.len()),
            NodeKind::SubProcess(def) => write!(f, "SubProcess({})", def.process_id),
            NodeKind::Fault { fault_name, .. } => write!(f, "Fault({fault_name})"),
            NodeKind::Timer(def) => write!(f, "Timer({}ms)", def.delay_ms),
            NodeKind::Event(def) => write!(f, "Event({})", def.event_type),
            NodeKind::ForEach(def) => write!(f, "ForEach({})", def.collection_variable),
            NodeKind::Boundary(def) => write!(f, "Boundary(on {})", def.attached_to),
        }
    }
}

/// A single node in a container's sub-graph.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

impl NodeDefinition {
    pub fn new(id: &str, name: &str, kind: NodeKind) -> Self {
        NodeDefinition {
            id: id.to_string(),
            name: name.to_string(),
            kind,
        }
    }
}

/// The immutable root of a process graph.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub container: ContainerDef,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.container.node(id)
    }
}
