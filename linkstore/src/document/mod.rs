// Document helpers - dotted paths, relation stubs, $set flattening

pub mod codec;

use serde_json::{Map, Value};

pub const ID: &str = "_id";
pub const TYPE: &str = "_type";
pub const TREE: &str = "_tree";
pub const KEY: &str = "_key";
pub const ORDER: &str = "order";
pub const SEARCH: &str = "search";
pub const DATE_CREATE: &str = "dateCreate";
pub const DATE_UPDATE: &str = "dateUpdate";
pub const IS_DELETED: &str = "isDeleted";

/// Look up a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Mutable lookup of a dotted path, creating intermediate objects as needed.
/// Scalars found on the way are replaced by empty objects.
pub fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> &'a mut Value {
    let mut current = value;
    for segment in path.split('.') {
        let index = match (&*current, segment.parse::<usize>()) {
            (Value::Array(items), Ok(i)) if i < items.len() => Some(i),
            _ => None,
        };
        if index.is_none() && !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = match (current, index) {
            (Value::Array(items), Some(i)) => &mut items[i],
            (Value::Object(map), _) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => unreachable!("arrays are indexed, everything else is an object"),
        };
    }
    current
}

pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    *get_path_mut(value, path) = new_value;
}

pub fn unset_path(value: &mut Value, path: &str) {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let target = match parent {
        Some(parent) => match get_path_mut_existing(value, parent) {
            Some(target) => target,
            None => return,
        },
        None => value,
    };
    if let Value::Object(map) = target {
        map.remove(last);
    }
}

fn get_path_mut_existing<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// True when the value has the relation shape `{_id, _type, ...}`.
pub fn is_link(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.get(ID).map_or(false, |id| !id.is_null())
                && map.get(TYPE).map_or(false, Value::is_string)
        }
        _ => false,
    }
}

pub fn link_id(value: &Value) -> Option<&Value> {
    value.get(ID).filter(|id| !id.is_null())
}

pub fn link_type(value: &Value) -> Option<&str> {
    value.get(TYPE).and_then(Value::as_str)
}

/// Shallow `Object.assign`: keys of `other` overwrite keys of `base`.
pub fn assign(base: &mut Value, other: Value) {
    if let (Value::Object(base_map), Value::Object(other_map)) = (&mut *base, other) {
        for (k, v) in other_map {
            base_map.insert(k, v);
        }
    }
}

/// Flatten a partial document into dotted `$set` pairs.
///
/// Plain nested objects are descended into so that sibling fields survive;
/// relation values (anything carrying `_id`) and empty objects are written
/// whole, and `{_id: null}` clears the relation to `{}`.
pub fn flatten_for_set(object: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into("", object, &mut out);
    out
}

fn flatten_into(prefix: &str, object: &Map<String, Value>, out: &mut Vec<(String, Value)>) {
    for (key, value) in object {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(map) if codec::is_native(value) => out.push((path, Value::Object(map.clone()))),
            Value::Object(map) if map.contains_key(ID) => {
                if map.get(ID).map_or(true, |id| id.is_null() || id == "null") {
                    out.push((path, Value::Object(Map::new())));
                } else {
                    out.push((path, value.clone()));
                }
            }
            Value::Object(map) if map.is_empty() => out.push((path, Value::Object(Map::new()))),
            Value::Object(map) => flatten_into(&path, map, out),
            _ => out.push((path, value.clone())),
        }
    }
}

/// All non-empty scalar leaves of a value, depth first.
pub fn scalar_values(value: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    collect_scalars(value, &mut out);
    out
}

fn collect_scalars(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Null => {}
        Value::String(s) if s.is_empty() => {}
        Value::Object(map) => map.values().for_each(|v| collect_scalars(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_scalars(v, out)),
        other => out.push(other.clone()),
    }
}

/// Minimal `{_id, _type}` stub of a document.
pub fn stub_of(document: &Value) -> Value {
    let mut stub = Map::new();
    if let Some(id) = document.get(ID) {
        stub.insert(ID.into(), id.clone());
    }
    if let Some(t) = document.get(TYPE) {
        stub.insert(TYPE.into(), t.clone());
    }
    Value::Object(stub)
}

/// Strip array indices from a validation path (`children.2._id` -> `children._id`).
pub fn strip_indices(path: &str) -> String {
    path.split('.')
        .filter(|segment| segment.parse::<usize>().is_err())
        .collect::<Vec<_>>()
        .join(".")
}
