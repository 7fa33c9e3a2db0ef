//! Update operations applied to a single document.

use super::filter::values_equal;
use crate::document::{self, ID};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// `$set` a dotted path.
    Set(String, Value),
    /// `$unset` a dotted path.
    Unset(String),
    /// `$inc` a numeric field; a missing field starts from zero.
    Inc(String, i64),
    /// Push an item into an array, replacing an existing item with the same `_id`.
    PushUnique(String, Value),
    /// Pull the array item whose `_id` equals the given id.
    PullById(String, Value),
    /// Merge fields into the array item with the given `_id`; no-op when absent.
    MergeItemById(String, Value, Map<String, Value>),
    /// Pull every array item whose `_id` is one of the given ids.
    PullIds(String, Vec<Value>),
    /// Insert items at the front of an array, skipping ids already present.
    Prepend(String, Vec<Value>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update(pub Vec<UpdateOp>);

impl Update {
    pub fn new() -> Self {
        Update(Vec::new())
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.0.push(UpdateOp::Set(path.into(), value));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.0.push(UpdateOp::Unset(path.into()));
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.0.push(UpdateOp::Inc(path.into(), by));
        self
    }

    pub fn push(mut self, op: UpdateOp) -> Self {
        self.0.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply every operation in order. Returns true when the document changed.
    pub fn apply(&self, target: &mut Value) -> bool {
        let before = target.clone();
        for op in &self.0 {
            apply_op(op, target);
        }
        *target != before
    }
}

fn apply_op(op: &UpdateOp, target: &mut Value) {
    match op {
        UpdateOp::Set(path, value) => document::set_path(target, path, value.clone()),
        UpdateOp::Unset(path) => document::unset_path(target, path),
        UpdateOp::Inc(path, by) => {
            let slot = document::get_path_mut(target, path);
            let next = match &*slot {
                Value::Number(n) if n.is_i64() => Value::from(n.as_i64().unwrap_or(0) + by),
                Value::Number(n) => Value::from(n.as_f64().unwrap_or(0.0) + *by as f64),
                _ => Value::from(*by),
            };
            *slot = next;
        }
        UpdateOp::PushUnique(path, item) => {
            let items = array_at(target, path);
            let position = item_id(item).and_then(|id| position_of(items, id));
            match position {
                Some(i) => items[i] = item.clone(),
                None => items.push(item.clone()),
            }
        }
        UpdateOp::PullById(path, id) => {
            if let Some(Value::Array(items)) = existing(target, path) {
                items.retain(|item| !item_id(item).map_or(false, |own| values_equal(own, id)));
            }
        }
        UpdateOp::MergeItemById(path, id, fields) => {
            if let Some(Value::Array(items)) = existing(target, path) {
                if let Some(i) = position_of(items, id) {
                    if let Value::Object(entry) = &mut items[i] {
                        for (k, v) in fields {
                            entry.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        UpdateOp::PullIds(path, ids) => {
            if let Some(Value::Array(items)) = existing(target, path) {
                items.retain(|item| {
                    !item_id(item).map_or(false, |own| ids.iter().any(|id| values_equal(own, id)))
                });
            }
        }
        UpdateOp::Prepend(path, new_items) => {
            let items = array_at(target, path);
            let fresh: Vec<Value> = new_items
                .iter()
                .filter(|item| item_id(item).map_or(true, |id| position_of(items, id).is_none()))
                .cloned()
                .collect();
            items.splice(0..0, fresh);
        }
    }
}

fn existing<'a>(target: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    document::get_path(target, path)?;
    Some(document::get_path_mut(target, path))
}

fn array_at<'a>(target: &'a mut Value, path: &str) -> &'a mut Vec<Value> {
    let slot = document::get_path_mut(target, path);
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => items,
        _ => unreachable!("slot was just made an array"),
    }
}

fn item_id(item: &Value) -> Option<&Value> {
    item.get(ID).filter(|id| !id.is_null())
}

fn position_of(items: &[Value], id: &Value) -> Option<usize> {
    items
        .iter()
        .position(|item| item_id(item).map_or(false, |own| values_equal(own, id)))
}
