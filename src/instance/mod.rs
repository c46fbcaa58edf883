//! Process-instance runtime state: the node-instance arena, the agenda-driven
//! state machine, dynamic container operations, and snapshot/restore.

pub mod dynamic;
pub mod marshal;
pub mod node_instance;
pub mod process_instance;

pub use marshal::ProcessInstanceSnapshot;
pub use node_instance::{
    ContainerId, DefRef, NodeInstance, NodeInstanceId, NodeInstanceState, NodeRuntime, TimerId,
};
pub use process_instance::{
    ActionContext, BoundarySub, EngineConfig, EngineServices, ProcessFault, ProcessInstance,
    ProcessState, SubProcessSpawn, TimerSubscription, FAULT_ERROR, FAULT_NO_BRANCH,
    SIGNAL_COMPENSATE,
};
