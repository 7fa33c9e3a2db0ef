//! Query filters evaluated in process against JSON documents.
//!
//! Paths are dotted and fan out through arrays, so `children._id` matches a
//! document if any element of `children` has that id. Native ids compare
//! equal to their plain string form.

use crate::document::codec;
use crate::error::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    #[default]
    All,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Exists(String, bool),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    /// Match a document by `_id`.
    pub fn id(id: &str) -> Self {
        Filter::Eq(crate::document::ID.into(), codec::oid(id))
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(self, other: Filter) -> Self {
        let mut parts = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                f => parts.push(f),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, expected) => {
                let candidates = resolve(document, path);
                if candidates.is_empty() {
                    return expected.is_null();
                }
                candidates.iter().any(|c| eq_or_contains(c, expected))
            }
            Filter::Ne(path, expected) => !Filter::Eq(path.clone(), expected.clone()).matches(document),
            Filter::In(path, values) => values
                .iter()
                .any(|v| Filter::Eq(path.clone(), v.clone()).matches(document)),
            Filter::Gt(path, bound) => compare_any(document, path, bound, |o| o == Ordering::Greater),
            Filter::Gte(path, bound) => compare_any(document, path, bound, |o| o != Ordering::Less),
            Filter::Lt(path, bound) => compare_any(document, path, bound, |o| o == Ordering::Less),
            Filter::Lte(path, bound) => compare_any(document, path, bound, |o| o != Ordering::Greater),
            Filter::Exists(path, wanted) => !resolve(document, path).is_empty() == *wanted,
            Filter::And(parts) => parts.iter().all(|f| f.matches(document)),
            Filter::Or(parts) => parts.iter().any(|f| f.matches(document)),
            Filter::Not(inner) => !inner.matches(document),
        }
    }

    /// Parse a Mongo-style query document (`{"a": 1, "b": {"$gt": 2}, "$or": [..]}`).
    pub fn from_query(query: &Value) -> Result<Self> {
        let map = query
            .as_object()
            .ok_or_else(|| Error::Store(format!("query must be an object, got {query}")))?;
        let mut parts = Vec::with_capacity(map.len());
        for (key, value) in map {
            let part = match key.as_str() {
                "$and" | "$or" => {
                    let items = value
                        .as_array()
                        .ok_or_else(|| Error::Store(format!("{key} expects an array")))?;
                    let filters = items.iter().map(Filter::from_query).collect::<Result<Vec<_>>>()?;
                    if key == "$and" {
                        Filter::And(filters)
                    } else {
                        Filter::Or(filters)
                    }
                }
                "$not" => Filter::Not(Box::new(Filter::from_query(value)?)),
                _ => field_filter(key, value)?,
            };
            parts.push(part);
        }
        Ok(parts.into_iter().fold(Filter::All, Filter::and))
    }
}

fn field_filter(path: &str, condition: &Value) -> Result<Filter> {
    let operators = match condition {
        Value::Object(map) if !codec::is_native(condition) && map.keys().all(|k| k.starts_with('$')) && !map.is_empty() => map,
        _ => return Ok(Filter::Eq(path.to_string(), condition.clone())),
    };
    let mut parts = Vec::with_capacity(operators.len());
    for (op, arg) in operators {
        let p = path.to_string();
        parts.push(match op.as_str() {
            "$eq" => Filter::Eq(p, arg.clone()),
            "$ne" => Filter::Ne(p, arg.clone()),
            "$gt" => Filter::Gt(p, arg.clone()),
            "$gte" => Filter::Gte(p, arg.clone()),
            "$lt" => Filter::Lt(p, arg.clone()),
            "$lte" => Filter::Lte(p, arg.clone()),
            "$exists" => Filter::Exists(p, truthy(arg)),
            "$in" => Filter::In(
                p,
                arg.as_array()
                    .cloned()
                    .ok_or_else(|| Error::Store(format!("$in on {path} expects an array")))?,
            ),
            "$not" => Filter::Not(Box::new(field_filter(path, arg)?)),
            other => return Err(Error::Store(format!("unsupported query operator {other}"))),
        });
    }
    Ok(parts.into_iter().fold(Filter::All, Filter::and))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// All values reachable at `path`, fanning out through arrays.
pub fn resolve<'a>(document: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![document];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(v) = map.get(segment) {
                        next.push(v);
                    }
                }
                Value::Array(items) => match segment.parse::<usize>() {
                    Ok(i) => next.extend(items.get(i)),
                    Err(_) => next.extend(items.iter().filter_map(|item| item.get(segment))),
                },
                _ => {}
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

fn eq_or_contains(candidate: &Value, expected: &Value) -> bool {
    if values_equal(candidate, expected) {
        return true;
    }
    match candidate {
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        _ => false,
    }
}

fn compare_any(document: &Value, path: &str, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    resolve(document, path).into_iter().any(|candidate| {
        let scalars: Vec<&Value> = match candidate {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        scalars
            .into_iter()
            .any(|v| compare_values(v, bound).map_or(false, &accept))
    })
}

/// Equality with native ids matching their string form.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Object(_), _) | (_, Value::Object(_)) if is_id_like(a) && is_id_like(b) => {
            codec::id_string(a) == codec::id_string(b)
        }
        _ => a == b,
    }
}

fn is_id_like(value: &Value) -> bool {
    match value {
        Value::String(_) => true,
        Value::Object(map) => map.len() == 1 && map.contains_key("$oid"),
        _ => false,
    }
}

/// Ordering between comparable values of the same kind.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (codec::date_millis(a), codec::date_millis(b)) {
        return Some(x.cmp(&y));
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ if is_id_like(a) && is_id_like(b) => Some(codec::id_string(a).cmp(&codec::id_string(b))),
        _ => None,
    }
}

/// Total order used for sorting: null, numbers, strings, objects, arrays,
/// booleans, dates.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(v @ Value::Object(_)) if codec::date_millis(v).is_some() => 6,
            Some(v @ Value::Object(_)) if is_id_like(v) => 2,
            Some(Value::Object(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Bool(_)) => 5,
        }
    }
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "_id": {"$oid": "a"},
            "name": "Alpha",
            "order": 3,
            "isDeleted": false,
            "parent": {"_id": {"$oid": "p"}, "_type": "node", "_tree": [{"_id": {"$oid": "r"}, "_type": "node"}]},
            "children": [{"_id": {"$oid": "c1"}}, {"_id": {"$oid": "c2"}}],
            "tags": ["x", "y"],
            "dateCreate": {"$date": 1000}
        })
    }

    #[test]
    fn test_eq_fans_out_through_arrays() {
        let d = doc();
        assert!(Filter::eq("children._id", "c2").matches(&d));
        assert!(Filter::eq("parent._tree._id", json!({"$oid": "r"})).matches(&d));
        assert!(Filter::eq("tags", "y").matches(&d));
        assert!(!Filter::eq("children._id", "c3").matches(&d));
        assert!(Filter::id("a").matches(&d));
    }

    #[test]
    fn test_eq_null_matches_missing() {
        let d = doc();
        assert!(Filter::Eq("missing".into(), Value::Null).matches(&d));
        assert!(!Filter::Eq("name".into(), Value::Null).matches(&d));
    }

    #[test]
    fn test_ranges() {
        let d = doc();
        assert!(Filter::Gt("order".into(), json!(2)).matches(&d));
        assert!(Filter::Lte("order".into(), json!(3)).matches(&d));
        assert!(!Filter::Lt("order".into(), json!(3)).matches(&d));
        assert!(Filter::Gte("dateCreate".into(), json!({"$date": 1000})).matches(&d));
    }

    #[test]
    fn test_from_query() {
        let d = doc();
        let f = Filter::from_query(&json!({
            "$or": [{"isDeleted": false}, {"isDeleted": {"$exists": false}}],
            "order": {"$gte": 1, "$lt": 4},
            "name": {"$in": ["Alpha", "Beta"]}
        }))
        .unwrap();
        assert!(f.matches(&d));

        let f = Filter::from_query(&json!({"name": {"$ne": "Alpha"}})).unwrap();
        assert!(!f.matches(&d));

        assert!(Filter::from_query(&json!({"name": {"$regex": "A"}})).is_err());
        assert!(Filter::from_query(&json!([1])).is_err());
    }

    #[test]
    fn test_and_flattens() {
        let f = Filter::All.and(Filter::eq("a", 1)).and(Filter::eq("b", 2));
        assert_eq!(f, Filter::And(vec![Filter::eq("a", 1), Filter::eq("b", 2)]));
        assert_eq!(Filter::All.and(Filter::All), Filter::All);
    }

    #[test]
    fn test_sort_cmp_ranks() {
        assert_eq!(sort_cmp(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(sort_cmp(Some(&json!(2)), Some(&json!(10))), Ordering::Less);
        assert_eq!(sort_cmp(Some(&json!("b")), Some(&json!("a"))), Ordering::Greater);
        assert_eq!(sort_cmp(Some(&json!(5)), Some(&json!("a"))), Ordering::Less);
    }
}
