// ── Where clauses ──
//
// Filters use the platform's JSON dialect:
//
//   { "done": false, "priority": { "$gt": 2 }, "$or": [ ... ] }
//
// Three jobs live here: canonicalizing a clause so equivalent filters share
// a cache key, evaluating a clause against a cached object so lists can
// maintain themselves, and translating a clause into the wire object set
// the change feed expects.

use std::cmp::Ordering;

use ontowatch_api::{ObjectInstance, ObjectTypeRef, TypeKind};
use serde_json::{Map, Value, json};

use crate::cache::Canonical;

/// How confidently an object satisfies a clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// Every condition was evaluated and holds.
    Strict,
    /// Some condition can only be decided by the server.
    Sorta,
    No,
}

// ── Canonical form ───────────────────────────────────────────────────

/// Canonicalize a where clause. Object keys are sorted, `{"$eq": v}` is
/// flattened to `v`, single-element `$and`/`$or` are unwrapped, and their
/// members are sorted and deduplicated.
pub fn canonicalize(clause: &Value) -> Canonical {
    match clause {
        Value::Null => Canonical::empty(),
        other => Canonical::new(canonical_value(other)),
    }
}

fn canonical_value(value: &Value) -> Value {
    let Value::Object(map) = value else {
        return value.clone();
    };

    if map.len() == 1 {
        if let Some(Value::Array(members)) = map.get("$and").or_else(|| map.get("$or")) {
            if members.len() == 1 {
                return canonical_value(&members[0]);
            }
        }
    }

    let mut out = Map::new();
    for (field, condition) in map {
        let condition = match field.as_str() {
            "$and" | "$or" => match condition {
                Value::Array(members) => Value::Array(canonical_members(members)),
                other => canonical_value(other),
            },
            "$not" => canonical_value(condition),
            _ => canonical_condition(condition),
        };
        out.insert(field.clone(), condition);
    }
    if let Some(Value::Array(members)) = out.get("$and") {
        if members.is_empty() {
            out.remove("$and");
        }
    }
    Value::Object(out)
}

fn canonical_members(members: &[Value]) -> Vec<Value> {
    let mut members: Vec<(String, Value)> = members
        .iter()
        .map(canonical_value)
        .map(|v| (v.to_string(), v))
        .collect();
    members.sort_by(|a, b| a.0.cmp(&b.0));
    members.dedup_by(|a, b| a.0 == b.0);
    members.into_iter().map(|(_, v)| v).collect()
}

fn canonical_condition(condition: &Value) -> Value {
    match condition {
        Value::Object(ops) if ops.len() == 1 && ops.contains_key("$eq") => {
            ops.get("$eq").cloned().unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

fn is_operator_map(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

// ── Evaluation ───────────────────────────────────────────────────────

/// Three-valued truth: `Unknown` when the clause needs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }

    fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            _ => Self::True,
        }
    }

    fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::True, _) | (_, Self::True) => Self::True,
            (Self::Unknown, _) | (_, Self::Unknown) => Self::Unknown,
            _ => Self::False,
        }
    }

    fn not(self) -> Self {
        match self {
            Self::True => Self::False,
            Self::False => Self::True,
            Self::Unknown => Self::Unknown,
        }
    }
}

/// Evaluate `clause` against `object`.
pub fn matches(clause: &Value, object: &ObjectInstance) -> Match {
    match eval_clause(clause, object) {
        Truth::True => Match::Strict,
        Truth::Unknown => Match::Sorta,
        Truth::False => Match::No,
    }
}

fn eval_clause(clause: &Value, object: &ObjectInstance) -> Truth {
    let Value::Object(map) = clause else {
        return Truth::Unknown;
    };
    map.iter().fold(Truth::True, |acc, (field, condition)| {
        let truth = match field.as_str() {
            "$and" => members(condition)
                .map(|m| eval_clause(m, object))
                .fold(Truth::True, Truth::and),
            "$or" => members(condition)
                .map(|m| eval_clause(m, object))
                .fold(Truth::False, Truth::or),
            "$not" => eval_clause(condition, object).not(),
            _ => eval_field(field, condition, object),
        };
        acc.and(truth)
    })
}

fn members(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

fn eval_field(field: &str, condition: &Value, object: &ObjectInstance) -> Truth {
    let primary_key;
    let actual = if field == "$primaryKey" {
        primary_key = object.primary_key().to_json();
        Some(&primary_key)
    } else {
        object.property(field).filter(|v| !v.is_null())
    };

    match condition {
        Value::Object(ops) if is_operator_map(ops) => ops
            .iter()
            .map(|(op, arg)| eval_op(op, arg, actual))
            .fold(Truth::True, Truth::and),
        expected => Truth::from_bool(actual.is_some_and(|a| values_equal(a, expected))),
    }
}

fn eval_op(op: &str, arg: &Value, actual: Option<&Value>) -> Truth {
    match op {
        "$eq" => Truth::from_bool(actual.is_some_and(|a| values_equal(a, arg))),
        "$ne" => Truth::from_bool(!actual.is_some_and(|a| values_equal(a, arg))),
        "$gt" => compare_op(actual, arg, Ordering::is_gt),
        "$gte" => compare_op(actual, arg, Ordering::is_ge),
        "$lt" => compare_op(actual, arg, Ordering::is_lt),
        "$lte" => compare_op(actual, arg, Ordering::is_le),
        "$in" => Truth::from_bool(
            actual.is_some_and(|a| members(arg).any(|candidate| values_equal(a, candidate))),
        ),
        "$isNull" => match arg.as_bool() {
            Some(expected) => Truth::from_bool(actual.is_none() == expected),
            None => Truth::Unknown,
        },
        "$contains" => match actual {
            Some(Value::Array(items)) => {
                Truth::from_bool(items.iter().any(|item| values_equal(item, arg)))
            }
            None => Truth::False,
            Some(_) => Truth::Unknown,
        },
        // Text search and geo operators are decided by the server.
        _ => Truth::Unknown,
    }
}

fn compare_op(actual: Option<&Value>, arg: &Value, accept: fn(Ordering) -> bool) -> Truth {
    let Some(actual) = actual else {
        return Truth::False;
    };
    match compare_values(actual, arg) {
        Some(ordering) => Truth::from_bool(accept(ordering)),
        None => Truth::Unknown,
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering for comparable scalars; `None` for mixed or structured values.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ── Wire translation ─────────────────────────────────────────────────

/// The object set a feed subscription for `type_ref` filtered by `clause`
/// should cover.
pub fn to_wire(type_ref: &ObjectTypeRef, clause: &Value) -> Value {
    let base = match type_ref.kind {
        TypeKind::Object => json!({ "type": "base", "objectType": type_ref.api_name }),
        TypeKind::Interface => json!({ "type": "interfaceBase", "interfaceType": type_ref.api_name }),
    };
    match clause {
        Value::Object(map) if !map.is_empty() => json!({
            "type": "filter",
            "objectSet": base,
            "where": where_to_wire(map),
        }),
        _ => base,
    }
}

fn where_to_wire(map: &Map<String, Value>) -> Value {
    let mut clauses = Vec::new();
    for (field, condition) in map {
        match field.as_str() {
            "$and" | "$or" => {
                let value: Vec<Value> = members(condition).map(member_to_wire).collect();
                let kind = &field[1..];
                clauses.push(json!({ "type": kind, "value": value }));
            }
            "$not" => clauses.push(json!({ "type": "not", "value": member_to_wire(condition) })),
            _ => match condition {
                Value::Object(ops) if is_operator_map(ops) => {
                    clauses.extend(ops.iter().map(|(op, arg)| op_to_wire(field, op, arg)));
                }
                value => clauses.push(json!({ "type": "eq", "field": field, "value": value })),
            },
        }
    }
    if clauses.len() == 1 {
        clauses.pop().unwrap_or(Value::Null)
    } else {
        json!({ "type": "and", "value": clauses })
    }
}

fn member_to_wire(member: &Value) -> Value {
    match member {
        Value::Object(map) => where_to_wire(map),
        other => other.clone(),
    }
}

fn op_to_wire(field: &str, op: &str, arg: &Value) -> Value {
    match op {
        "$ne" => json!({
            "type": "not",
            "value": { "type": "eq", "field": field, "value": arg },
        }),
        _ => {
            let kind = op.strip_prefix('$').unwrap_or(op);
            json!({ "type": kind, "field": field, "value": arg })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn todo() -> ObjectInstance {
        ObjectInstance::new("Todo", 1)
            .with_property("body", "buy milk")
            .with_property("priority", 3)
            .with_property("tags", json!(["home", "errand"]))
    }

    #[test]
    fn equivalent_clauses_canonicalize_identically() {
        let a = canonicalize(&json!({ "$and": [{ "priority": { "$eq": 3 }, "body": "x" }] }));
        let b = canonicalize(&json!({ "body": "x", "priority": 3 }));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"body":"x","priority":3}"#);

        let c = canonicalize(&json!({ "$or": [{ "a": 1 }, { "b": 2 }, { "a": 1 }] }));
        let d = canonicalize(&json!({ "$or": [{ "b": 2 }, { "a": { "$eq": 1 } }] }));
        assert_eq!(c, d);
    }

    #[test]
    fn null_and_empty_clauses_are_empty() {
        assert!(canonicalize(&Value::Null).is_empty_object());
        assert!(canonicalize(&json!({})).is_empty_object());
        assert!(canonicalize(&json!({ "$and": [] })).is_empty_object());
    }

    #[test]
    fn evaluation_is_three_valued() {
        let obj = todo();
        assert_eq!(matches(&json!({}), &obj), Match::Strict);
        assert_eq!(matches(&json!({ "priority": 3 }), &obj), Match::Strict);
        assert_eq!(matches(&json!({ "priority": 3.0 }), &obj), Match::Strict);
        assert_eq!(matches(&json!({ "priority": { "$gt": 3 } }), &obj), Match::No);
        assert_eq!(
            matches(&json!({ "priority": { "$gte": 1, "$lt": 5 } }), &obj),
            Match::Strict
        );
        assert_eq!(matches(&json!({ "tags": { "$contains": "home" } }), &obj), Match::Strict);
        assert_eq!(matches(&json!({ "missing": { "$isNull": true } }), &obj), Match::Strict);
        assert_eq!(
            matches(&json!({ "body": { "$containsAnyTerm": "milk" } }), &obj),
            Match::Sorta
        );
        // A definite miss wins over an unknown.
        assert_eq!(
            matches(&json!({ "body": { "$containsAnyTerm": "milk" }, "priority": 1 }), &obj),
            Match::No
        );
        assert_eq!(
            matches(&json!({ "$or": [{ "priority": 1 }, { "$not": { "body": "x" } }] }), &obj),
            Match::Strict
        );
        assert_eq!(matches(&json!({ "$primaryKey": { "$in": [1, 2] } }), &obj), Match::Strict);
    }

    #[test]
    fn wire_object_set_wraps_base() {
        let type_ref = ObjectTypeRef::object("Todo");
        assert_eq!(
            to_wire(&type_ref, &json!({})),
            json!({ "type": "base", "objectType": "Todo" })
        );
        assert_eq!(
            to_wire(&type_ref, &json!({ "done": false, "priority": { "$ne": 1 } })),
            json!({
                "type": "filter",
                "objectSet": { "type": "base", "objectType": "Todo" },
                "where": {
                    "type": "and",
                    "value": [
                        { "type": "eq", "field": "done", "value": false },
                        { "type": "not", "value": { "type": "eq", "field": "priority", "value": 1 } },
                    ],
                },
            })
        );
        assert_eq!(
            to_wire(&ObjectTypeRef::interface("Person"), &Value::Null),
            json!({ "type": "interfaceBase", "interfaceType": "Person" })
        );
    }
}
