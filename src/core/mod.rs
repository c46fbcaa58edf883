//! Engine-wide support services: runtime context, events, scopes, work items.

pub mod context;
pub mod event_bus;
pub mod scope;
pub mod work_item;

pub use context::{
    FakeIdGenerator, FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider,
    RuntimeContext, TimeProvider,
};
pub use event_bus::{create_event_channel, EventReceiver, EventSender, ProcessEvent};
pub use scope::{ScopeId, VariableScopes};
pub use work_item::{
    WorkItem, WorkItemDisposition, WorkItemHandler, WorkItemHandlerRegistry, WorkItemId,
    WorkItemManager, WorkItemState,
};
