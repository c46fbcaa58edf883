use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Engine events emitted while a process instance executes.
#[derive(Clone, Debug, Serialize)]
pub enum ProcessEvent {
    ProcessStarted {
        instance_id: String,
        process_id: String,
        timestamp: DateTime<Utc>,
    },

    NodeTriggered {
        instance_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },

    NodeCompleted {
        instance_id: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },

    WorkItemCreated {
        instance_id: String,
        work_item_id: u64,
        work_name: String,
        timestamp: DateTime<Utc>,
    },

    WorkItemCompleted {
        instance_id: String,
        work_item_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A fault entered exception-scope resolution.
    FaultRaised {
        instance_id: String,
        fault_name: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },

    /// An exception handler matched and ran.
    HandlerInvoked {
        instance_id: String,
        fault_name: String,
        timestamp: DateTime<Utc>,
    },

    SignalReceived {
        instance_id: String,
        event_type: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },

    ProcessCompleted {
        instance_id: String,
        timestamp: DateTime<Utc>,
    },

    ProcessAborted {
        instance_id: String,
        timestamp: DateTime<Utc>,
    },

    /// The instance entered the error state with an unhandled fault.
    ProcessFaulted {
        instance_id: String,
        fault_name: String,
        node_id: String,
        timestamp: DateTime<Utc>,
    },
}

/// Event sender handle.
pub type EventSender = mpsc::UnboundedSender<ProcessEvent>;

/// Event receiver handle.
pub type EventReceiver = mpsc::UnboundedReceiver<ProcessEvent>;

/// Create an event channel pair.
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
