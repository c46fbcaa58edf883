//! Dynamic (ad-hoc) container behavior.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use procflow::{
    ActionContext, CompletionCondition, ContainerBuilder, ContainerId, NodeDefinition,
    NodeResult, ProcessBuilder, ProcessDefinition, ProcessRuntime, ProcessState, WorkItem,
    WorkItemHandler, WorkItemManager,
};

#[derive(Default)]
struct RecordingHandler {
    items: Mutex<Vec<WorkItem>>,
}

impl RecordingHandler {
    fn first(&self) -> Option<WorkItem> {
        self.items.lock().first().cloned()
    }
}

#[async_trait]
impl WorkItemHandler for RecordingHandler {
    async fn execute_work_item(&self, item: &WorkItem, _manager: &mut WorkItemManager) {
        self.items.lock().push(item.clone());
    }
}

fn process_with_dynamic(dynamic: ContainerBuilder) -> ProcessDefinition {
    ProcessBuilder::new("org.test.dynamic", "dynamic")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::dynamic("dynamic", "Dynamic", dynamic.build()))
        .node(NodeDefinition::end("end"))
        .connect("start", "dynamic")
        .connect("dynamic", "end")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_autocomplete_without_children_passes_through() {
    let runtime = Arc::new(ProcessRuntime::new());
    runtime
        .register_process(process_with_dynamic(
            ContainerBuilder::new().completion(CompletionCondition::Autocomplete),
        ))
        .unwrap();

    let instance_id = runtime
        .start_process("org.test.dynamic", HashMap::new())
        .await
        .unwrap();

    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_add_dynamic_work_item() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let template_log = log.clone();
    let dynamic = ContainerBuilder::new()
        .node(NodeDefinition::action(
            "template",
            "Template Action",
            move |_: &mut ActionContext| -> NodeResult<()> {
                template_log.lock().push("template".into());
                Ok(())
            },
        ))
        .completion(CompletionCondition::Autocomplete);

    let runtime = Arc::new(ProcessRuntime::new());
    runtime
        .register_process(process_with_dynamic(dynamic))
        .unwrap();
    let handler = Arc::new(RecordingHandler::default());
    runtime.register_work_item_handler("Human Task", handler.clone());

    let instance_id = runtime
        .start_process("org.test.dynamic", HashMap::new())
        .await
        .unwrap();

    // The dynamic container is the only active top-level instance and the
    // template node was not auto-triggered.
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Active
    );
    let arc = runtime.instance(&instance_id).unwrap();
    let container_id = {
        let guard = arc.lock().await;
        let top_level = guard.node_instances(ContainerId::Process);
        assert_eq!(top_level.len(), 1);
        let container_id = top_level[0].id;
        assert_eq!(guard.node_instances(ContainerId::Node(container_id)).len(), 0);
        container_id
    };
    assert!(log.lock().is_empty());
    assert!(handler.first().is_none());

    let mut parameters = HashMap::new();
    parameters.insert("TaskName".to_string(), json!("Dynamic Task"));
    runtime
        .add_dynamic_work_item(&instance_id, container_id, "Human Task", parameters)
        .await
        .unwrap();

    // The handler saw the work item synchronously and the container gained
    // exactly one child.
    let item = handler.first().expect("handler received no work item");
    assert_eq!(item.work_name, "Human Task");
    assert_eq!(item.parameter("TaskName"), Some(&json!("Dynamic Task")));
    {
        let guard = arc.lock().await;
        assert_eq!(guard.node_instances(ContainerId::Node(container_id)).len(), 1);
        assert_eq!(guard.work_items().len(), 1);
    }

    // Completing the dynamic work item drains the container; autocomplete
    // carries the flow to the end node.
    runtime
        .complete_work_item(&instance_id, item.id, HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_add_dynamic_sub_process() {
    let child = ProcessBuilder::new("org.test.child", "child")
        .node(NodeDefinition::start("start"))
        .node(NodeDefinition::end("end"))
        .connect("start", "end")
        .build()
        .unwrap();

    let dynamic = ContainerBuilder::new()
        .node(NodeDefinition::action(
            "template",
            "Template",
            |_: &mut ActionContext| -> NodeResult<()> { Ok(()) },
        ))
        .completion(CompletionCondition::Autocomplete);

    let runtime = Arc::new(ProcessRuntime::new());
    runtime.register_process(child).unwrap();
    runtime
        .register_process(process_with_dynamic(dynamic))
        .unwrap();

    let instance_id = runtime
        .start_process("org.test.dynamic", HashMap::new())
        .await
        .unwrap();
    let container_id = {
        let arc = runtime.instance(&instance_id).unwrap();
        let guard = arc.lock().await;
        guard.node_instances(ContainerId::Process)[0].id
    };

    runtime
        .add_dynamic_sub_process(&instance_id, container_id, "org.test.child", HashMap::new())
        .await
        .unwrap();

    // The child instance ran to completion, resolving the dynamic child node
    // and letting the container autocomplete.
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_statically_wired_dynamic_actions_run_on_entry() {
    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let action_log = log.clone();
    let dynamic = ContainerBuilder::new()
        .node(NodeDefinition::start("dstart"))
        .node(NodeDefinition::action(
            "daction",
            "Wired Action",
            move |_: &mut ActionContext| -> NodeResult<()> {
                action_log.lock().push("action-ran".into());
                Ok(())
            },
        ))
        .node(NodeDefinition::end("dend"))
        .connect("dstart", "daction")
        .connect("daction", "dend")
        .completion(CompletionCondition::Autocomplete);

    let runtime = Arc::new(ProcessRuntime::new());
    runtime
        .register_process(process_with_dynamic(dynamic))
        .unwrap();

    let instance_id = runtime
        .start_process("org.test.dynamic", HashMap::new())
        .await
        .unwrap();

    assert_eq!(*log.lock(), ["action-ran"]);
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );
}

#[tokio::test]
async fn test_add_to_finished_instance_rejected() {
    let runtime = Arc::new(ProcessRuntime::new());
    runtime
        .register_process(process_with_dynamic(
            ContainerBuilder::new().completion(CompletionCondition::Autocomplete),
        ))
        .unwrap();

    let instance_id = runtime
        .start_process("org.test.dynamic", HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        runtime.state(&instance_id).await.unwrap(),
        ProcessState::Completed
    );

    let result = runtime
        .add_dynamic_work_item(&instance_id, 2, "Human Task", HashMap::new())
        .await;
    assert!(result.is_err());
}
