//! Dynamic (ad-hoc) container protocol.
//!
//! Children may be added to an active dynamic container at any time, from
//! outside the normal connection-triggering path. A dynamically added work
//! item is live immediately: the registered handler sees it synchronously
//! within the same call. A dynamically added sub-process becomes a spawn
//! request the owning runtime starts after the call returns.

use std::collections::HashMap;

use serde_json::Value;

use crate::definition::types::NodeKind;
use crate::error::{ProcessError, ProcessResult};
use crate::instance::node_instance::{
    ContainerId, DefRef, NodeInstanceId, NodeInstanceState,
};
use crate::instance::process_instance::{
    resolve_container_def, EngineServices, ProcessInstance, ProcessState,
};

impl ProcessInstance {
    /// Add a work item as a new child of an active dynamic container and
    /// trigger it immediately.
    pub async fn add_dynamic_work_item(
        &mut self,
        services: &EngineServices<'_>,
        container: NodeInstanceId,
        work_name: &str,
        parameters: HashMap<String, Value>,
    ) -> ProcessResult<NodeInstanceId> {
        self.ensure_dynamic_target(container)?;
        let id = self.create_instance(
            ContainerId::Node(container),
            DefRef::DynamicWorkItem {
                work_name: work_name.to_string(),
                parameters,
            },
        );
        self.enqueue_trigger_existing(id);
        self.drive_public(services).await?;
        Ok(id)
    }

    /// Add a sub-process invocation as a new child of an active dynamic
    /// container. The nested instance is started by the runtime once this
    /// call returns.
    pub async fn add_dynamic_sub_process(
        &mut self,
        services: &EngineServices<'_>,
        container: NodeInstanceId,
        process_id: &str,
        parameters: HashMap<String, Value>,
    ) -> ProcessResult<NodeInstanceId> {
        self.ensure_dynamic_target(container)?;
        let id = self.create_instance(
            ContainerId::Node(container),
            DefRef::DynamicSubProcess {
                process_id: process_id.to_string(),
                parameters,
            },
        );
        self.enqueue_trigger_existing(id);
        self.drive_public(services).await?;
        Ok(id)
    }

    fn ensure_dynamic_target(&self, container: NodeInstanceId) -> ProcessResult<()> {
        if self.state != ProcessState::Active {
            return Err(ProcessError::IllegalInstanceState {
                id: self.id.clone(),
                expected: "active".into(),
            });
        }
        let inst = self
            .nodes
            .get(&container)
            .ok_or(ProcessError::NodeInstanceNotFound(container))?;
        if inst.state != NodeInstanceState::Active {
            return Err(ProcessError::IllegalInstanceState {
                id: format!("node instance {container}"),
                expected: "active".into(),
            });
        }
        let Some(node_id) = inst.node_id() else {
            return Err(ProcessError::InternalError(
                "dynamic children may only be added to dynamic containers".into(),
            ));
        };
        let parent_def = resolve_container_def(&self.definition, &self.nodes, inst.container)?;
        let node = parent_def
            .node(node_id)
            .ok_or_else(|| ProcessError::NodeNotFound(node_id.to_string()))?;
        if !matches!(node.kind, NodeKind::Dynamic(_)) {
            return Err(ProcessError::InternalError(format!(
                "node '{node_id}' is not a dynamic container"
            )));
        }
        Ok(())
    }
}
