//! Fluent builders for assembling process definitions programmatically.
//!
//! Front-end parsers produce [`ProcessDefinition`]s from their own formats;
//! embedders and tests assemble them directly through [`ProcessBuilder`] and
//! [`ContainerBuilder`]. [`ProcessBuilder::build`] runs the definition
//! validator, so an invalid graph never reaches the engine.

use serde_json::Value;

use super::types::{
    CompensationDef, CompletionCondition, Connection, ContainerDef, EventDef, ExceptionHandlerDef,
    FaultMatcher, ForEachDef, HandlerAction, JoinKind, NodeDefinition, NodeKind, ProcessAction,
    ProcessDefinition, SplitBranch, SplitKind, SubProcessDef, TimerDef, VariableDecl, WorkItemDef,
};
use super::validator::validate;
use crate::error::ProcessResult;

/// Builds one container's sub-graph (the process root or a nested container).
#[derive(Default)]
pub struct ContainerBuilder {
    container: ContainerDef,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, def: NodeDefinition) -> Self {
        self.container.nodes.push(def);
        self
    }

    /// Connect two nodes through the default ports.
    pub fn connect(mut self, from: &str, to: &str) -> Self {
        self.container.connections.push(Connection::new(from, to));
        self
    }

    /// Connect through explicit ports (used for split branches).
    pub fn connect_ports(mut self, from: &str, from_port: &str, to: &str, to_port: &str) -> Self {
        self.container
            .connections
            .push(Connection::with_ports(from, from_port, to, to_port));
        self
    }

    pub fn variable(mut self, name: &str, default: Value) -> Self {
        self.container.variables.push(VariableDecl {
            name: name.to_string(),
            default,
        });
        self
    }

    pub fn exception_handler(
        mut self,
        matcher: FaultMatcher,
        fault_variable: Option<&str>,
        action: HandlerAction,
    ) -> Self {
        self.container.exception_handlers.push(ExceptionHandlerDef {
            matcher,
            fault_variable: fault_variable.map(str::to_string),
            action,
        });
        self
    }

    pub fn compensation(mut self, for_node: &str, handler_node: &str) -> Self {
        self.container.compensation.push(CompensationDef {
            for_node: for_node.to_string(),
            handler_node: handler_node.to_string(),
        });
        self
    }

    pub fn completion(mut self, condition: CompletionCondition) -> Self {
        self.container.completion = Some(condition);
        self
    }

    pub fn build(self) -> ContainerDef {
        self.container
    }
}

/// Builds a full [`ProcessDefinition`] and validates it.
pub struct ProcessBuilder {
    id: String,
    name: String,
    version: String,
    root: ContainerBuilder,
}

impl ProcessBuilder {
    pub fn new(id: &str, name: &str) -> Self {
        ProcessBuilder {
            id: id.to_string(),
            name: name.to_string(),
            version: "1".to_string(),
            root: ContainerBuilder::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn node(mut self, def: NodeDefinition) -> Self {
        self.root = self.root.node(def);
        self
    }

    pub fn connect(mut self, from: &str, to: &str) -> Self {
        self.root = self.root.connect(from, to);
        self
    }

    pub fn connect_ports(mut self, from: &str, from_port: &str, to: &str, to_port: &str) -> Self {
        self.root = self.root.connect_ports(from, from_port, to, to_port);
        self
    }

    pub fn variable(mut self, name: &str, default: Value) -> Self {
        self.root = self.root.variable(name, default);
        self
    }

    pub fn exception_handler(
        mut self,
        matcher: FaultMatcher,
        fault_variable: Option<&str>,
        action: HandlerAction,
    ) -> Self {
        self.root = self.root.exception_handler(matcher, fault_variable, action);
        self
    }

    pub fn compensation(mut self, for_node: &str, handler_node: &str) -> Self {
        self.root = self.root.compensation(for_node, handler_node);
        self
    }

    pub fn build(self) -> ProcessResult<ProcessDefinition> {
        let def = ProcessDefinition {
            id: self.id,
            name: self.name,
            version: self.version,
            container: self.root.build(),
        };
        validate(&def)?;
        Ok(def)
    }
}

// ================================
// NodeDefinition constructors
// ================================

impl NodeDefinition {
    pub fn start(id: &str) -> Self {
        NodeDefinition::new(id, "Start", NodeKind::Start)
    }

    pub fn end(id: &str) -> Self {
        NodeDefinition::new(id, "End", NodeKind::End { terminate: false })
    }

    pub fn terminate_end(id: &str) -> Self {
        NodeDefinition::new(id, "End", NodeKind::End { terminate: true })
    }

    pub fn action<A: ProcessAction + 'static>(id: &str, name: &str, action: A) -> Self {
        NodeDefinition::new(
            id,
            name,
            NodeKind::Action {
                action: std::sync::Arc::new(action),
            },
        )
    }

    pub fn split(id: &str, kind: SplitKind, branches: Vec<SplitBranch>) -> Self {
        NodeDefinition::new(id, "Split", NodeKind::Split { kind, branches })
    }

    pub fn join(id: &str, kind: JoinKind) -> Self {
        NodeDefinition::new(id, "Join", NodeKind::Join { kind })
    }

    pub fn work_item(id: &str, name: &str, def: WorkItemDef) -> Self {
        NodeDefinition::new(id, name, NodeKind::WorkItem(def))
    }

    pub fn composite(id: &str, name: &str, container: ContainerDef) -> Self {
        NodeDefinition::new(id, name, NodeKind::Composite(container))
    }

    pub fn dynamic(id: &str, name: &str, container: ContainerDef) -> Self {
        NodeDefinition::new(id, name, NodeKind::Dynamic(container))
    }

    pub fn sub_process(id: &str, name: &str, def: SubProcessDef) -> Self {
        NodeDefinition::new(id, name, NodeKind::SubProcess(def))
    }

    pub fn fault(id: &str, fault_name: &str, fault_variable: Option<&str>) -> Self {
        NodeDefinition::new(
            id,
            "Fault",
            NodeKind::Fault {
                fault_name: fault_name.to_string(),
                fault_variable: fault_variable.map(str::to_string),
            },
        )
    }

    pub fn timer(id: &str, delay_ms: u64) -> Self {
        NodeDefinition::new(id, "Timer", NodeKind::Timer(TimerDef { delay_ms }))
    }

    pub fn event(id: &str, event_type: &str, variable: Option<&str>) -> Self {
        NodeDefinition::new(
            id,
            "Event",
            NodeKind::Event(EventDef {
                event_type: event_type.to_string(),
                variable: variable.map(str::to_string),
            }),
        )
    }

    pub fn for_each(
        id: &str,
        name: &str,
        collection_variable: &str,
        item_variable: &str,
        body: ContainerDef,
    ) -> Self {
        NodeDefinition::new(
            id,
            name,
            NodeKind::ForEach(ForEachDef {
                collection_variable: collection_variable.to_string(),
                item_variable: item_variable.to_string(),
                body,
            }),
        )
    }

    pub fn boundary(id: &str, attached_to: &str, event_type: &str, cancel_activity: bool) -> Self {
        NodeDefinition::new(
            id,
            "Boundary",
            NodeKind::Boundary(super::types::BoundaryDef {
                attached_to: attached_to.to_string(),
                event_type: event_type.to_string(),
                cancel_activity,
            }),
        )
    }
}
