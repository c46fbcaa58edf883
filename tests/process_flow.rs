//! Core flow behavior: gateways, work items, variables, timers, events,
//! sub-processes, boundary events, for-each, and the persistence boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use procflow::{
    ActionContext, ComparisonOperator, ConditionGroup, ContainerBuilder, JoinKind,
    NodeDefinition, NodeResult, ParamBinding, ProcessBuilder, ProcessError, ProcessRuntime,
    ProcessState, ResultMapping, SplitBranch, SplitKind, SubProcessDef, WorkItem, WorkItemDef,
    WorkItemHandler, WorkItemManager,
};

#[derive(Default)]
struct RecordingHandler {
    items: Mutex<Vec<WorkItem>>,
    aborted: Mutex<Vec<WorkItem>>,
}

#[async_trait]
impl WorkItemHandler for RecordingHandler {
    async fn execute_work_item(&self, item: &WorkItem, _manager: &mut WorkItemManager) {
        self.items.lock().push(item.clone());
    }

    async fn abort_work_item(&self, item: &WorkItem, _manager: &mut WorkItemManager) {
        self.aborted.lock().push(item.clone());
    }
}

fn push_action(
    log: &Arc<Mutex<Vec<String>>>,
    entry: &str,
) -> impl Fn(&mut ActionContext<'_>) -> NodeResult<()> + Send + Sync + 'static {
    let log = log.clone();
    let entry = entry.to_string();
    move |_: &mut ActionContext| -> NodeResult<()> {
        log.lock().push(entry.clone());
        Ok(())
    }
}

fn human_task() -> WorkItemDef {
    WorkItemDef {
        work_name: "Human Task".into(),
        ..Default::default()
    }
}

// ================================
// Variable scopes
// ================================

#[tokio::test]
async fn test_scope_shadowing_and_outward_writes() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let read_inner = {
        let log = log.clone();
        move |ctx: &mut ActionContext| -> NodeResult<()> {
            let x = ctx.get_variable("x").unwrap_or(json!(null));
            log.lock().push(format!("inner={}", x.as_str().unwrap_or("?")));
            ctx.set_variable("y", json!("from-inner"));
            Ok(())
        }
    };
    let read_outer = {
        let log = log.clone();
        move |ctx: &mut ActionContext| -> NodeResult<()> {
            let x = ctx.get_variable("x").unwrap_or(json!(null));
            log.lock().push(format!("outer={}", x.as_str().unwrap_or("?")));
            Ok(())
        }
    };

    let composite = ContainerBuilder::new()
        .variable("x", json!("shadowed"))
        .node(NodeDefinition::start("cstart"))
        .node(NodeDefinition::action("cread", "Read Inner", read_inner))
        .node(NodeDefinition::end("cend"))
        .connect("cstart", "cread")
        .connect("cread", "cend")
        .build();

    let process = ProcessBuilder::new("org.test.scopes", "scopes")
        .variable("x", json!("root-value"))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::composite("comp", "Composite", composite))
        .node(NodeDefinition::action("read", "Read Outer", read_outer))
        .node(NodeDefinition::end("end"))
        .connect("start", "comp")
        .connect("comp", "read")
        .connect("read", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let instance_id = runtime
        .start_process("org.test.scopes", HashMap::new())
        .await
        .unwrap();

    assert_eq!(*log.lock(), ["inner=shadowed", "outer=root-value"]);
    // Undeclared writes from the composite land at the process root.
    assert_eq!(
        runtime.get_variable(&instance_id, "y").await.unwrap(),
        Some(json!("from-inner"))
    );
    // The shadowing declaration never leaked outward.
    assert_eq!(
        runtime.get_variable(&instance_id, "x").await.unwrap(),
        Some(json!("root-value"))
    );
}

// ================================
// Gateways
// ================================

#[tokio::test]
async fn test_xor_split_takes_first_matching_guard() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let branches = vec![
        SplitBranch {
            port: "high".into(),
            priority: 1,
            guard: Some(ConditionGroup::single(
                "amount",
                ComparisonOperator::GreaterThan,
                json!(100),
            )),
        },
        SplitBranch {
            port: "low".into(),
            priority: 2,
            guard: None,
        },
    ];
    let process = ProcessBuilder::new("org.test.xor", "xor")
        .variable("amount", json!(0))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::split("split", SplitKind::Xor, branches))
        .node(NodeDefinition::action("high", "High", push_action(&log, "high")))
        .node(NodeDefinition::action("low", "Low", push_action(&log, "low")))
        .node(NodeDefinition::join("join", JoinKind::Xor))
        .node(NodeDefinition::end("end"))
        .connect("start", "split")
        .connect_ports("split", "high", "high", "in")
        .connect_ports("split", "low", "low", "in")
        .connect("high", "join")
        .connect("low", "join")
        .connect("join", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();

    let mut vars = HashMap::new();
    vars.insert("amount".to_string(), json!(150));
    let instance_id = runtime.start_process("org.test.xor", vars).await.unwrap();

    assert_eq!(*log.lock(), ["high"]);
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_and_split_and_join() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let process = ProcessBuilder::new("org.test.and", "and")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::split("split", SplitKind::And, vec![]))
        .node(NodeDefinition::action("a", "A", push_action(&log, "a")))
        .node(NodeDefinition::action("b", "B", push_action(&log, "b")))
        .node(NodeDefinition::join("join", JoinKind::And))
        .node(NodeDefinition::action("after", "After", push_action(&log, "joined")))
        .node(NodeDefinition::end("end"))
        .connect("start", "split")
        .connect("split", "a")
        .connect("split", "b")
        .connect("a", "join")
        .connect("b", "join")
        .connect("join", "after")
        .connect("after", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let instance_id = runtime
        .start_process("org.test.and", HashMap::new())
        .await
        .unwrap();

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().filter(|e| *e == "joined").count(), 1);
    assert_eq!(entries[2], "joined");
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_or_split_triggers_all_matching_branches() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let branches = vec![
        SplitBranch {
            port: "big".into(),
            priority: 1,
            guard: Some(ConditionGroup::single(
                "x",
                ComparisonOperator::GreaterThan,
                json!(10),
            )),
        },
        SplitBranch {
            port: "positive".into(),
            priority: 2,
            guard: Some(ConditionGroup::single(
                "x",
                ComparisonOperator::GreaterThan,
                json!(0),
            )),
        },
    ];
    let process = ProcessBuilder::new("org.test.or", "or")
        .variable("x", json!(0))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::split("split", SplitKind::Or, branches))
        .node(NodeDefinition::action("big", "Big", push_action(&log, "big")))
        .node(NodeDefinition::action(
            "positive",
            "Positive",
            push_action(&log, "positive"),
        ))
        .node(NodeDefinition::join("join", JoinKind::Xor))
        .node(NodeDefinition::end("end"))
        .connect("start", "split")
        .connect_ports("split", "big", "big", "in")
        .connect_ports("split", "positive", "positive", "in")
        .connect("big", "join")
        .connect("positive", "join")
        .connect("join", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let mut vars = HashMap::new();
    vars.insert("x".to_string(), json!(20));
    let instance_id = runtime.start_process("org.test.or", vars).await.unwrap();

    let mut entries = log.lock().clone();
    entries.sort();
    assert_eq!(entries, ["big", "positive"]);
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

// ================================
// Work items
// ================================

#[tokio::test]
async fn test_work_item_completion_resumes_exactly_once() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let process = ProcessBuilder::new("org.test.workitem", "workitem")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::work_item("task", "Task", human_task()))
        .node(NodeDefinition::action("after", "After", push_action(&log, "after")))
        .node(NodeDefinition::end("end"))
        .connect("start", "task")
        .connect("task", "after")
        .connect("after", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.workitem", HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Active
    );
    assert!(log.lock().is_empty());

    let item_id = handler.items.lock()[0].id;
    runtime
        .complete_work_item(&instance_id, item_id, HashMap::new())
        .await
        .unwrap();
    assert_eq!(*log.lock(), ["after"]);
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );

    // A second completion is a not-found condition and never re-executes the
    // downstream nodes.
    let err = runtime
        .complete_work_item(&instance_id, item_id, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::WorkItemNotFound(_)));
    assert_eq!(*log.lock(), ["after"]);
}

#[tokio::test]
async fn test_work_item_bindings_and_result_mappings() {
    let mut parameters = HashMap::new();
    parameters.insert("assignee".to_string(), ParamBinding::Variable("user".into()));
    parameters.insert("priority".to_string(), ParamBinding::Literal(json!("high")));
    let def = WorkItemDef {
        work_name: "Human Task".into(),
        parameters,
        results: vec![ResultMapping {
            result_key: "answer".into(),
            variable: "result".into(),
        }],
    };

    let process = ProcessBuilder::new("org.test.bindings", "bindings")
        .variable("user", json!(null))
        .variable("result", json!(null))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::work_item("task", "Task", def))
        .node(NodeDefinition::end("end"))
        .connect("start", "task")
        .connect("task", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let mut vars = HashMap::new();
    vars.insert("user".to_string(), json!("alice"));
    let instance_id = runtime
        .start_process("org.test.bindings", vars)
        .await
        .unwrap();

    let item = handler.items.lock()[0].clone();
    assert_eq!(item.parameter("assignee"), Some(&json!("alice")));
    assert_eq!(item.parameter("priority"), Some(&json!("high")));

    let mut results = HashMap::new();
    results.insert("answer".to_string(), json!(42));
    runtime
        .complete_work_item(&instance_id, item.id, results)
        .await
        .unwrap();

    assert_eq!(
        runtime.get_variable(&instance_id, "result").await.unwrap(),
        Some(json!(42))
    );
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_unregistered_work_item_type_is_a_configuration_error() {
    let process = ProcessBuilder::new("org.test.nohandler", "nohandler")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::work_item("task", "Task", human_task()))
        .node(NodeDefinition::end("end"))
        .connect("start", "task")
        .connect("task", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();

    let err = runtime
        .start_process("org.test.nohandler", HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::NoWorkItemHandler(_)));
}

// ================================
// Events and timers
// ================================

#[tokio::test]
async fn test_event_node_waits_for_signal() {
    let process = ProcessBuilder::new("org.test.event", "event")
        .variable("payload", json!(null))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::event("wait", "go", Some("payload")))
        .node(NodeDefinition::end("end"))
        .connect("start", "wait")
        .connect("wait", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let instance_id = runtime
        .start_process("org.test.event", HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Active
    );

    // Signals nobody listens to are ignored.
    runtime
        .signal(&instance_id, "unrelated", json!(null))
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Active
    );

    runtime
        .signal(&instance_id, "go", json!("it happened"))
        .await
        .unwrap();
    assert_eq!(
        runtime.get_variable(&instance_id, "payload").await.unwrap(),
        Some(json!("it happened"))
    );
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_timer_node_fires() {
    let process = ProcessBuilder::new("org.test.timer", "timer")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::timer("wait", 10))
        .node(NodeDefinition::end("end"))
        .connect("start", "wait")
        .connect("wait", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let instance_id = runtime
        .start_process("org.test.timer", HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Active
    );

    for _ in 0..100 {
        if runtime.state(&instance_id).await.unwrap() == ProcessState::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

// ================================
// Sub-processes
// ================================

#[tokio::test]
async fn test_sub_process_waits_and_maps_variables() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let child_log = log.clone();
    let child = ProcessBuilder::new("org.test.child", "child")
        .variable("input", json!(null))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::action(
            "work",
            "Work",
            move |ctx: &mut ActionContext| -> NodeResult<()> {
                let input = ctx.get_variable("input").unwrap_or(json!(null));
                child_log.lock().push(format!("child-input={input}"));
                ctx.set_variable("output", json!("done"));
                Ok(())
            },
        ))
        .node(NodeDefinition::end("end"))
        .connect("start", "work")
        .connect("work", "end")
        .build()
        .unwrap();

    let parent = ProcessBuilder::new("org.test.parent", "parent")
        .variable("a", json!(null))
        .variable("result", json!(null))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::sub_process(
            "invoke",
            "Invoke Child",
            SubProcessDef {
                process_id: "org.test.child".into(),
                wait_for_completion: true,
                independent: false,
                in_mappings: vec![("a".into(), "input".into())],
                out_mappings: vec![("output".into(), "result".into())],
            },
        ))
        .node(NodeDefinition::end("end"))
        .connect("start", "invoke")
        .connect("invoke", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(child).unwrap();
    runtime.register_process(parent).unwrap();

    let mut vars = HashMap::new();
    vars.insert("a".to_string(), json!(5));
    let instance_id = runtime
        .start_process("org.test.parent", vars)
        .await
        .unwrap();

    assert_eq!(*log.lock(), ["child-input=5"]);
    assert_eq!(
        runtime.get_variable(&instance_id, "result").await.unwrap(),
        Some(json!("done"))
    );
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_sub_process_fire_and_forget() {
    let child = ProcessBuilder::new("org.test.child2", "child2")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::end("end"))
        .connect("start", "end")
        .build()
        .unwrap();

    let parent = ProcessBuilder::new("org.test.parent2", "parent2")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::sub_process(
            "invoke",
            "Invoke",
            SubProcessDef {
                process_id: "org.test.child2".into(),
                wait_for_completion: false,
                independent: true,
                in_mappings: vec![],
                out_mappings: vec![],
            },
        ))
        .node(NodeDefinition::end("end"))
        .connect("start", "invoke")
        .connect("invoke", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(child).unwrap();
    runtime.register_process(parent).unwrap();

    let instance_id = runtime
        .start_process("org.test.parent2", HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

// ================================
// Termination, boundaries, for-each
// ================================

#[tokio::test]
async fn test_terminating_end_cancels_active_work_items() {
    let process = ProcessBuilder::new("org.test.terminate", "terminate")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::split("split", SplitKind::And, vec![]))
        .node(NodeDefinition::work_item("task", "Task", human_task()))
        .node(NodeDefinition::terminate_end("kill"))
        .connect("start", "split")
        .connect("split", "task")
        .connect("split", "kill")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.terminate", HashMap::new())
        .await
        .unwrap();

    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
    assert_eq!(handler.aborted.lock().len(), 1);
}

#[tokio::test]
async fn test_boundary_event_cancels_attached_activity() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let process = ProcessBuilder::new("org.test.boundary", "boundary")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::work_item("task", "Task", human_task()))
        .node(NodeDefinition::boundary("escalation", "task", "interrupt", true))
        .node(NodeDefinition::action(
            "escalated",
            "Escalated",
            push_action(&log, "interrupted"),
        ))
        .node(NodeDefinition::end("end"))
        .node(NodeDefinition::end("normal-end"))
        .connect("start", "task")
        .connect("task", "normal-end")
        .connect("escalation", "escalated")
        .connect("escalated", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.boundary", HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Active
    );

    runtime
        .signal(&instance_id, "interrupt", json!(null))
        .await
        .unwrap();

    assert_eq!(*log.lock(), ["interrupted"]);
    assert_eq!(handler.aborted.lock().len(), 1);
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_for_each_runs_body_per_item() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let body_log = log.clone();
    let body = ContainerBuilder::new()
        .node(NodeDefinition::start("bstart"))
        .node(NodeDefinition::action(
            "record",
            "Record",
            move |ctx: &mut ActionContext| -> NodeResult<()> {
                let item = ctx.get_variable("item").unwrap_or(json!(null));
                body_log.lock().push(item.to_string());
                Ok(())
            },
        ))
        .node(NodeDefinition::end("bend"))
        .connect("bstart", "record")
        .connect("record", "bend")
        .build();

    let process = ProcessBuilder::new("org.test.foreach", "foreach")
        .variable("items", json!([]))
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::for_each("each", "Each", "items", "item", body))
        .node(NodeDefinition::end("end"))
        .connect("start", "each")
        .connect("each", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();

    let mut vars = HashMap::new();
    vars.insert("items".to_string(), json!(["a", "b", "c"]));
    let instance_id = runtime
        .start_process("org.test.foreach", vars)
        .await
        .unwrap();

    let mut entries = log.lock().clone();
    entries.sort();
    assert_eq!(entries, ["\"a\"", "\"b\"", "\"c\""]);
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

// ================================
// Suspension and persistence
// ================================

#[tokio::test]
async fn test_suspend_blocks_operations_until_resume() {
    let process = ProcessBuilder::new("org.test.suspend", "suspend")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::work_item("task", "Task", human_task()))
        .node(NodeDefinition::end("end"))
        .connect("start", "task")
        .connect("task", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.suspend", HashMap::new())
        .await
        .unwrap();
    let item_id = handler.items.lock()[0].id;

    runtime.suspend(&instance_id).await.unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Suspended
    );
    let err = runtime
        .complete_work_item(&instance_id, item_id, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::InstanceSuspended(_)));

    runtime.resume(&instance_id).await.unwrap();
    runtime
        .complete_work_item(&instance_id, item_id, HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_snapshot_restores_into_fresh_runtime() {
    let build = || {
        ProcessBuilder::new("org.test.marshal", "marshal")
            .variable("result", json!(null))
            .node(NodeDefinition::start("start"))
            .node(NodeDefinition::work_item(
                "task",
                "Task",
                WorkItemDef {
                    work_name: "Human Task".into(),
                    parameters: HashMap::new(),
                    results: vec![ResultMapping {
                        result_key: "answer".into(),
                        variable: "result".into(),
                    }],
                },
            ))
            .node(NodeDefinition::end("end"))
            .connect("start", "task")
            .connect("task", "end")
            .build()
            .unwrap()
    };

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(build()).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.marshal", HashMap::new())
        .await
        .unwrap();
    let item_id = handler.items.lock()[0].id;

    // Capture, push through serde, and restore into a fresh runtime.
    let snapshot = runtime.snapshot(&instance_id).await.unwrap();
    let encoded = serde_json::to_string(&snapshot).unwrap();
    let decoded: procflow::ProcessInstanceSnapshot = serde_json::from_str(&encoded).unwrap();

    let second = Arc::new(ProcessRuntime::new());
    second.register_process(build()).unwrap();
    second.register_work_item_handler("Human Task", Arc::new(RecordingHandler::default()));
    let restored_id = second.restore_instance(decoded).unwrap();
    assert_eq!(restored_id, instance_id);
    assert_eq!(
        second.state(&restored_id).await.unwrap(),
        ProcessState::Active
    );

    // The pending work item survived and resumes exactly as before.
    let mut results = HashMap::new();
    results.insert("answer".to_string(), json!("restored"));
    second
        .complete_work_item(&restored_id, item_id, results)
        .await
        .unwrap();
    assert_eq!(
        second.get_variable(&restored_id, "result").await.unwrap(),
        Some(json!("restored"))
    );
    assert_eq!(
        second.state(&restored_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_abort_is_idempotent_and_cascades() {
    let process = ProcessBuilder::new("org.test.abort", "abort")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::work_item("task", "Task", human_task()))
        .node(NodeDefinition::end("end"))
        .connect("start", "task")
        .connect("task", "end")
        .build()
        .unwrap();

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(process).unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.abort", HashMap::new())
        .await
        .unwrap();

    runtime.abort(&instance_id).await.unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Aborted
    );
    assert_eq!(handler.aborted.lock().len(), 1);

    // Idempotent: a second abort and stale signals are no-ops.
    runtime.abort(&instance_id).await.unwrap();
    runtime
        .signal(&instance_id, "go", json!(null))
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Aborted
    );
}
