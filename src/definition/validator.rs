//! Build-time validation of process definitions.
//!
//! Everything that can be rejected before an instance runs is rejected here,
//! so runtime dispatch can assume a well-formed graph: unique node ids per
//! container, connection endpoints that exist, container start rules, split
//! branch wiring, boundary attachments, and the no-nested-compensation rule.

use std::collections::HashSet;

use super::types::{ContainerDef, NodeKind, ProcessDefinition};
use crate::error::{ProcessError, ProcessResult};

/// Validate a full process definition, recursing into nested containers.
pub fn validate(def: &ProcessDefinition) -> ProcessResult<()> {
    validate_container(&def.container, &def.id, true)
}

fn validate_container(container: &ContainerDef, label: &str, is_root: bool) -> ProcessResult<()> {
    let mut seen = HashSet::new();
    for node in &container.nodes {
        if node.id.is_empty() {
            return Err(ProcessError::InvalidDefinition(format!(
                "empty node id in container '{label}'"
            )));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(ProcessError::DuplicateNodeId {
                container: label.to_string(),
                node: node.id.clone(),
            });
        }
    }

    for conn in &container.connections {
        if !seen.contains(conn.from.as_str()) {
            return Err(ProcessError::InvalidConnection(format!(
                "'{}' -> '{}' in container '{label}': unknown source node",
                conn.from, conn.to
            )));
        }
        if !seen.contains(conn.to.as_str()) {
            return Err(ProcessError::InvalidConnection(format!(
                "'{}' -> '{}' in container '{label}': unknown target node",
                conn.from, conn.to
            )));
        }
    }

    if is_root && container.start_nodes().next().is_none() {
        return Err(ProcessError::NoStartNode(label.to_string()));
    }

    for comp in &container.compensation {
        if !seen.contains(comp.for_node.as_str()) {
            return Err(ProcessError::InvalidDefinition(format!(
                "compensation in '{label}' targets unknown node '{}'",
                comp.for_node
            )));
        }
        let handler = container.node(&comp.handler_node).ok_or_else(|| {
            ProcessError::InvalidDefinition(format!(
                "compensation in '{label}' names unknown handler node '{}'",
                comp.handler_node
            ))
        })?;
        if let Some(inner) = handler.kind.container() {
            if !inner.compensation.is_empty() {
                return Err(ProcessError::NestedCompensation(comp.handler_node.clone()));
            }
        }
    }

    for node in &container.nodes {
        validate_node(container, node, label)?;
    }

    Ok(())
}

fn validate_node(
    container: &ContainerDef,
    node: &super::types::NodeDefinition,
    label: &str,
) -> ProcessResult<()> {
    match &node.kind {
        NodeKind::Split { branches, .. } => {
            for branch in branches {
                if container.outgoing(&node.id, &branch.port).next().is_none() {
                    return Err(ProcessError::InvalidDefinition(format!(
                        "split '{}' branch port '{}' has no outgoing connection",
                        node.id, branch.port
                    )));
                }
            }
        }
        NodeKind::Fault { fault_name, .. } => {
            if fault_name.is_empty() {
                return Err(ProcessError::InvalidDefinition(format!(
                    "fault node '{}' has an empty fault name",
                    node.id
                )));
            }
        }
        NodeKind::SubProcess(def) => {
            if def.process_id.is_empty() {
                return Err(ProcessError::InvalidDefinition(format!(
                    "sub-process node '{}' has an empty process id",
                    node.id
                )));
            }
        }
        NodeKind::Boundary(def) => {
            let target = container.node(&def.attached_to).ok_or_else(|| {
                ProcessError::InvalidDefinition(format!(
                    "boundary node '{}' is attached to unknown node '{}'",
                    node.id, def.attached_to
                ))
            })?;
            if matches!(target.kind, NodeKind::Boundary(_)) {
                return Err(ProcessError::InvalidDefinition(format!(
                    "boundary node '{}' may not attach to another boundary node",
                    node.id
                )));
            }
            if container.incoming(&node.id).next().is_some() {
                return Err(ProcessError::InvalidDefinition(format!(
                    "boundary node '{}' may not have incoming connections",
                    node.id
                )));
            }
        }
        NodeKind::Composite(inner) => {
            if inner.start_nodes().next().is_none() {
                return Err(ProcessError::NoStartNode(node.id.clone()));
            }
            validate_container(inner, &node.id, false)?;
        }
        NodeKind::Dynamic(inner) => {
            if inner.completion.is_none() {
                return Err(ProcessError::MissingCompletionCondition(node.id.clone()));
            }
            validate_container(inner, &node.id, false)?;
        }
        NodeKind::ForEach(def) => {
            if def.body.start_nodes().next().is_none() {
                return Err(ProcessError::NoStartNode(node.id.clone()));
            }
            validate_container(&def.body, &node.id, false)?;
        }
        NodeKind::Start
        | NodeKind::End { .. }
        | NodeKind::Action { .. }
        | NodeKind::Join { .. }
        | NodeKind::WorkItem(_)
        | NodeKind::Timer(_)
        | NodeKind::Event(_) => {}
    }
    Ok(())
}
