//! Hierarchical variable scopes.
//!
//! One scope exists per container level: the process root owns the root scope,
//! and every composite/dynamic/for-each-iteration container gets a child scope
//! chained to its parent. Scopes live in an arena keyed by [`ScopeId`] with
//! parent ids instead of references, so the whole arena serializes flat and
//! lookup is an iterative parent walk.
//!
//! Resolution rule: reads and writes prefer the nearest enclosing scope that
//! declares the variable; a write that resolves nowhere lands in the root
//! scope (a process-level variable).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of one scope within the arena.
pub type ScopeId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScopeRecord {
    parent: Option<ScopeId>,
    variables: HashMap<String, Value>,
}

/// Arena of all variable scopes of one process instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableScopes {
    scopes: HashMap<ScopeId, ScopeRecord>,
    next_id: ScopeId,
    root: ScopeId,
}

impl VariableScopes {
    pub fn new() -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(
            0,
            ScopeRecord {
                parent: None,
                variables: HashMap::new(),
            },
        );
        VariableScopes {
            scopes,
            next_id: 1,
            root: 0,
        }
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// Create a child scope chained to `parent`.
    pub fn create_child(&mut self, parent: ScopeId) -> ScopeId {
        let id = self.next_id;
        self.next_id += 1;
        self.scopes.insert(
            id,
            ScopeRecord {
                parent: Some(parent),
                variables: HashMap::new(),
            },
        );
        id
    }

    /// Drop a scope. The root scope is never removed.
    pub fn remove(&mut self, scope: ScopeId) {
        if scope != self.root {
            self.scopes.remove(&scope);
        }
    }

    /// Declare `name` directly in `scope`, shadowing any outer declaration.
    pub fn declare(&mut self, scope: ScopeId, name: &str, value: Value) {
        if let Some(record) = self.scopes.get_mut(&scope) {
            record.variables.insert(name.to_string(), value);
        }
    }

    /// Read a variable, walking outward from `scope` to the root.
    pub fn get(&self, scope: ScopeId, name: &str) -> Option<Value> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let record = self.scopes.get(&id)?;
            if let Some(value) = record.variables.get(name) {
                return Some(value.clone());
            }
            current = record.parent;
        }
        None
    }

    /// Write a variable into the nearest enclosing scope declaring it, or the
    /// root scope when no declaration exists anywhere on the chain.
    pub fn set(&mut self, scope: ScopeId, name: &str, value: Value) {
        let mut current = Some(scope);
        let mut target = None;
        while let Some(id) = current {
            let Some(record) = self.scopes.get(&id) else {
                break;
            };
            if record.variables.contains_key(name) {
                target = Some(id);
                break;
            }
            current = record.parent;
        }
        self.declare(target.unwrap_or(self.root), name, value);
    }

    /// Does any scope on the chain declare `name`?
    pub fn is_declared(&self, scope: ScopeId, name: &str) -> bool {
        self.get(scope, name).is_some()
    }

    /// Snapshot of the variables visible from `scope` (outer shadowed by inner).
    pub fn visible(&self, scope: ScopeId) -> HashMap<String, Value> {
        let mut chain = Vec::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let Some(record) = self.scopes.get(&id) else {
                break;
            };
            chain.push(id);
            current = record.parent;
        }
        let mut out = HashMap::new();
        for id in chain.into_iter().rev() {
            if let Some(record) = self.scopes.get(&id) {
                for (k, v) in &record.variables {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        out
    }

    /// Variables held directly by one scope, without the parent chain.
    pub fn local(&self, scope: ScopeId) -> HashMap<String, Value> {
        self.scopes
            .get(&scope)
            .map(|r| r.variables.clone())
            .unwrap_or_default()
    }
}

impl Default for VariableScopes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_read_write() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        scopes.set(root, "x", json!(1));
        assert_eq!(scopes.get(root, "x"), Some(json!(1)));
        assert_eq!(scopes.get(root, "missing"), None);
    }

    #[test]
    fn test_child_reads_parent() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);
        let grandchild = scopes.create_child(child);

        scopes.declare(root, "x", json!("root value"));
        assert_eq!(scopes.get(grandchild, "x"), Some(json!("root value")));
    }

    #[test]
    fn test_shadowing_is_local_to_child() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);

        scopes.declare(root, "x", json!("outer"));
        scopes.declare(child, "x", json!("inner"));

        assert_eq!(scopes.get(child, "x"), Some(json!("inner")));
        assert_eq!(scopes.get(root, "x"), Some(json!("outer")));
    }

    #[test]
    fn test_set_targets_declaring_scope() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);

        scopes.declare(root, "x", json!(0));
        scopes.set(child, "x", json!(42));

        assert_eq!(scopes.get(root, "x"), Some(json!(42)));
        assert!(scopes.local(child).is_empty());
    }

    #[test]
    fn test_undeclared_set_lands_at_root() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);

        scopes.set(child, "fresh", json!(true));
        assert_eq!(scopes.get(root, "fresh"), Some(json!(true)));
    }

    #[test]
    fn test_remove_scope() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);
        scopes.declare(child, "x", json!(1));
        scopes.remove(child);
        assert_eq!(scopes.get(root, "x"), None);
    }

    #[test]
    fn test_visible_merges_chain() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);
        scopes.declare(root, "a", json!(1));
        scopes.declare(root, "b", json!("outer"));
        scopes.declare(child, "b", json!("inner"));

        let visible = scopes.visible(child);
        assert_eq!(visible.get("a"), Some(&json!(1)));
        assert_eq!(visible.get("b"), Some(&json!("inner")));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut scopes = VariableScopes::new();
        let root = scopes.root();
        let child = scopes.create_child(root);
        scopes.declare(root, "x", json!([1, 2, 3]));
        scopes.declare(child, "y", json!({"k": "v"}));

        let encoded = serde_json::to_string(&scopes).unwrap();
        let restored: VariableScopes = serde_json::from_str(&encoded).unwrap();
        assert_eq!(restored.get(child, "x"), Some(json!([1, 2, 3])));
        assert_eq!(restored.get(child, "y"), Some(json!({"k": "v"})));
    }
}
