//! Condition evaluation for split guards and container completion conditions.
//!
//! A [`ConditionGroup`] is a flat AND/OR combination of [`Condition`]s, each
//! comparing one process variable against a literal value. Variables are
//! resolved through the caller-supplied lookup (normally the variable-scope
//! chain of the evaluating container), so the evaluator itself stays free of
//! instance state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the conditions inside a group combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

/// Comparison applied between the resolved variable and the literal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Is,
    IsNot,
    Contains,
    NotContains,
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Empty,
    NotEmpty,
    Null,
    NotNull,
}

/// A single variable comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
}

/// AND/OR group of conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    /// Single-condition convenience constructor.
    pub fn single(variable: &str, operator: ComparisonOperator, value: Value) -> Self {
        ConditionGroup {
            operator: LogicalOperator::And,
            conditions: vec![Condition {
                variable: variable.to_string(),
                operator,
                value,
            }],
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        ConditionGroup {
            operator: LogicalOperator::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        ConditionGroup {
            operator: LogicalOperator::Or,
            conditions,
        }
    }
}

/// Evaluate a group against the given variable lookup.
pub fn evaluate_group<F>(group: &ConditionGroup, resolve: F) -> bool
where
    F: Fn(&str) -> Option<Value>,
{
    match group.operator {
        LogicalOperator::And => group
            .conditions
            .iter()
            .all(|c| evaluate_condition(c, &resolve)),
        LogicalOperator::Or => group
            .conditions
            .iter()
            .any(|c| evaluate_condition(c, &resolve)),
    }
}

/// Evaluate a single condition against the given variable lookup.
pub fn evaluate_condition<F>(cond: &Condition, resolve: &F) -> bool
where
    F: Fn(&str) -> Option<Value>,
{
    let actual = resolve(&cond.variable).unwrap_or(Value::Null);
    let expected = &cond.value;

    match cond.operator {
        ComparisonOperator::Is => value_to_string(&actual) == value_to_string(expected),
        ComparisonOperator::IsNot => value_to_string(&actual) != value_to_string(expected),

        ComparisonOperator::Contains => eval_contains(&actual, expected),
        ComparisonOperator::NotContains => !eval_contains(&actual, expected),

        ComparisonOperator::Empty => is_empty(&actual),
        ComparisonOperator::NotEmpty => !is_empty(&actual),

        ComparisonOperator::Null => actual.is_null(),
        ComparisonOperator::NotNull => !actual.is_null(),

        ComparisonOperator::Equal => match (value_to_f64(&actual), value_to_f64(expected)) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => false,
        },
        ComparisonOperator::NotEqual => match (value_to_f64(&actual), value_to_f64(expected)) {
            (Some(a), Some(b)) => (a - b).abs() >= f64::EPSILON,
            _ => true,
        },
        ComparisonOperator::GreaterThan => match (value_to_f64(&actual), value_to_f64(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ComparisonOperator::LessThan => match (value_to_f64(&actual), value_to_f64(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        ComparisonOperator::GreaterOrEqual => match (value_to_f64(&actual), value_to_f64(expected))
        {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        },
        ComparisonOperator::LessOrEqual => match (value_to_f64(&actual), value_to_f64(expected)) {
            (Some(a), Some(b)) => a <= b,
            _ => false,
        },
    }
}

// ================================
// Helper functions
// ================================

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        _ => false,
    }
}

fn eval_contains(actual: &Value, expected: &Value) -> bool {
    let e = value_to_string(expected);
    match actual {
        Value::String(s) => s.contains(&e),
        Value::Array(arr) => arr.iter().any(|x| value_to_string(x) == e),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup(vars: &HashMap<String, Value>) -> impl Fn(&str) -> Option<Value> + '_ {
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_is_operator() {
        let mut vars = HashMap::new();
        vars.insert("status".to_string(), json!("approved"));

        let group = ConditionGroup::single("status", ComparisonOperator::Is, json!("approved"));
        assert!(evaluate_group(&group, lookup(&vars)));

        let group = ConditionGroup::single("status", ComparisonOperator::Is, json!("rejected"));
        assert!(!evaluate_group(&group, lookup(&vars)));
    }

    #[test]
    fn test_numeric_operators() {
        let mut vars = HashMap::new();
        vars.insert("amount".to_string(), json!(150));

        let gt = ConditionGroup::single("amount", ComparisonOperator::GreaterThan, json!(100));
        assert!(evaluate_group(&gt, lookup(&vars)));

        let lt = ConditionGroup::single("amount", ComparisonOperator::LessThan, json!(100));
        assert!(!evaluate_group(&lt, lookup(&vars)));

        let ge = ConditionGroup::single("amount", ComparisonOperator::GreaterOrEqual, json!(150));
        assert!(evaluate_group(&ge, lookup(&vars)));
    }

    #[test]
    fn test_numeric_coercion_from_string() {
        let mut vars = HashMap::new();
        vars.insert("amount".to_string(), json!("42"));

        let eq = ConditionGroup::single("amount", ComparisonOperator::Equal, json!(42));
        assert!(evaluate_group(&eq, lookup(&vars)));
    }

    #[test]
    fn test_and_or_groups() {
        let mut vars = HashMap::new();
        vars.insert("a".to_string(), json!(1));
        vars.insert("b".to_string(), json!(2));

        let both = ConditionGroup::all(vec![
            Condition {
                variable: "a".into(),
                operator: ComparisonOperator::Equal,
                value: json!(1),
            },
            Condition {
                variable: "b".into(),
                operator: ComparisonOperator::Equal,
                value: json!(3),
            },
        ]);
        assert!(!evaluate_group(&both, lookup(&vars)));

        let either = ConditionGroup::any(both.conditions.clone());
        assert!(evaluate_group(&either, lookup(&vars)));
    }

    #[test]
    fn test_missing_variable_is_null() {
        let vars = HashMap::new();

        let null = ConditionGroup::single("missing", ComparisonOperator::Null, Value::Null);
        assert!(evaluate_group(&null, lookup(&vars)));

        let empty = ConditionGroup::single("missing", ComparisonOperator::Empty, Value::Null);
        assert!(evaluate_group(&empty, lookup(&vars)));
    }

    #[test]
    fn test_contains() {
        let mut vars = HashMap::new();
        vars.insert("tags".to_string(), json!(["urgent", "review"]));
        vars.insert("note".to_string(), json!("needs review"));

        let in_array = ConditionGroup::single("tags", ComparisonOperator::Contains, json!("urgent"));
        assert!(evaluate_group(&in_array, lookup(&vars)));

        let in_string = ConditionGroup::single("note", ComparisonOperator::Contains, json!("review"));
        assert!(evaluate_group(&in_string, lookup(&vars)));

        let missing = ConditionGroup::single("tags", ComparisonOperator::Contains, json!("low"));
        assert!(!evaluate_group(&missing, lookup(&vars)));
    }
}
