//! Process definitions: the immutable node graph consumed by the engine.

pub mod builder;
pub mod types;
pub mod validator;

pub use builder::{ContainerBuilder, ProcessBuilder};
pub use types::{
    BoundaryDef, CompensationDef, CompletionCondition, Connection, ContainerDef, EventDef,
    ExceptionHandlerDef, FaultMatcher, ForEachDef, HandlerAction, JoinKind, NodeDefinition,
    NodeKind, ParamBinding, ProcessAction, ProcessDefinition, ResultMapping, SplitBranch,
    SplitKind, SubProcessDef, TimerDef, VariableDecl, WorkItemDef, PORT_IN, PORT_OUT,
};
pub use validator::validate;
