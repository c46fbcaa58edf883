//! # Procflow — a business-process execution engine
//!
//! `procflow` interprets directed graphs of typed nodes — the shape of BPMN2
//! processes — and advances process instances through them while maintaining
//! variable scopes, pending work items, timers, and event subscriptions. It
//! supports:
//!
//! - **Node kinds**: Start, End (terminating and plain), Action, Split
//!   (AND/XOR/OR), Join (AND/XOR), Work Item, Composite, Dynamic (ad-hoc),
//!   Sub-Process, Fault, Timer, Event, For-Each, and Boundary events.
//! - **Hierarchical variable scopes**: container-local declarations shadow
//!   outer scopes; lookup walks outward to the process root.
//! - **Exception scopes**: chain-of-responsibility fault handling walking from
//!   the faulting container to the process level, with a match-any default;
//!   unhandled faults park the instance in an error state an operator can
//!   retrigger.
//! - **Dynamic containers**: work items and sub-processes added to a running
//!   container from outside the connection graph, with an autocomplete policy.
//! - **Work item bridge**: external task handlers registered per work name on
//!   the runtime, resumed through explicit completion calls.
//! - **Suspend/resume**: instance state snapshots that round-trip through
//!   serde with timers and subscriptions re-armed on restore.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use procflow::{NodeDefinition, ProcessBuilder, ProcessRuntime};
//!
//! #[tokio::main]
//! async fn main() {
//!     let process = ProcessBuilder::new("org.example.hello", "hello")
//!         .node(NodeDefinition::start("start"))
//!         .node(NodeDefinition::end("end"))
//!         .connect("start", "end")
//!         .build()
//!         .unwrap();
//!
//!     let runtime = Arc::new(ProcessRuntime::new());
//!     runtime.register_process(process).unwrap();
//!     let instance_id = runtime
//!         .start_process("org.example.hello", HashMap::new())
//!         .await
//!         .unwrap();
//!     println!("{:?}", runtime.state(&instance_id).await.unwrap());
//! }
//! ```

pub mod core;
pub mod definition;
pub mod error;
pub mod evaluator;
pub mod instance;
pub mod runtime;

pub use crate::core::{
    create_event_channel, EventReceiver, EventSender, FakeIdGenerator, FakeTimeProvider,
    IdGenerator, ProcessEvent, RealIdGenerator, RealTimeProvider, RuntimeContext, TimeProvider,
    VariableScopes, WorkItem, WorkItemHandler, WorkItemHandlerRegistry, WorkItemId,
    WorkItemManager, WorkItemState,
};
pub use crate::definition::{
    CompletionCondition, Connection, ContainerBuilder, ContainerDef, EventDef, FaultMatcher,
    HandlerAction, JoinKind, NodeDefinition, NodeKind, ParamBinding, ProcessAction,
    ProcessBuilder, ProcessDefinition, ResultMapping, SplitBranch, SplitKind, SubProcessDef,
    TimerDef, WorkItemDef,
};
pub use crate::error::{NodeError, NodeResult, ProcessError, ProcessResult};
pub use crate::evaluator::{ComparisonOperator, Condition, ConditionGroup, LogicalOperator};
pub use crate::instance::{
    ActionContext, ContainerId, EngineConfig, NodeInstance, NodeInstanceId, NodeInstanceState,
    ProcessFault, ProcessInstance, ProcessInstanceSnapshot, ProcessState, FAULT_ERROR,
    FAULT_NO_BRANCH, SIGNAL_COMPENSATE,
};
pub use crate::runtime::ProcessRuntime;
