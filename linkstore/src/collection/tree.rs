//! Breadcrumbs of tree relations.
//!
//! A document's breadcrumb for a tree lives at `<path>._tree`, inside the stub
//! of its tree parent: the parent's own breadcrumb followed by the parent's
//! `{_id, _type}`. Moving a node rewrites the breadcrumbs of everything below it.

use crate::document::{codec, get_path, is_link, link_type, stub_of, ID, TREE, TYPE};
use crate::error::Result;
use crate::schema::SchemaRegistry;
use crate::store::{DocumentStore, Filter, Update, UpdateOp};
use serde_json::Value;

/// Breadcrumb of `document` in `tree`, root first. Empty for roots and for
/// types outside the tree.
pub(crate) fn breadcrumb(registry: &SchemaRegistry, document: &Value, tree: &str) -> Vec<Value> {
    let Some(path) = link_type(document).and_then(|t| registry.tree(tree)?.get(t)) else {
        return Vec::new();
    };
    match get_path(document, path) {
        Some(parent) if is_link(parent) => segment(parent),
        _ => Vec::new(),
    }
}

/// Breadcrumb carried by a parent stub.
pub(crate) fn segment(stub: &Value) -> Vec<Value> {
    stub.get(TREE)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(stub_of).collect())
        .unwrap_or_default()
}

/// Breadcrumb a child of `parent` gets: the parent's own plus the parent.
pub(crate) fn child_breadcrumb(registry: &SchemaRegistry, parent: &Value, tree: &str) -> Value {
    let mut crumbs = breadcrumb(registry, parent, tree);
    crumbs.push(codec::to_native(stub_of(parent)));
    Value::Array(crumbs)
}

fn ids(segment: &[Value]) -> Vec<Value> {
    segment
        .iter()
        .filter_map(|crumb| crumb.get(ID).and_then(codec::native_id))
        .collect()
}

/// Applies breadcrumb rewrites to every type registered in a tree.
pub(crate) struct Propagator<'a> {
    pub store: &'a dyn DocumentStore,
    pub registry: &'a SchemaRegistry,
}

impl Propagator<'_> {
    fn for_descendants(&self, tree: &str, object_id: &str, op: impl Fn(&str) -> UpdateOp) -> Result<u64> {
        let Some(members) = self.registry.tree(tree) else {
            return Ok(0);
        };
        let mut touched = 0;
        for (type_name, path) in members {
            let schema = self.registry.get(type_name)?;
            let filter = Filter::eq(format!("{path}.{TREE}.{ID}"), codec::oid(object_id))
                .and(Filter::eq(TYPE, type_name.as_str()));
            let update = Update::new().push(op(path));
            touched += self.store.update_many(&schema.collection, &filter, &update)?.modified;
        }
        Ok(touched)
    }

    /// Remove `segment` from the breadcrumbs of all descendants of `object_id`.
    pub fn detach(&self, tree: &str, object_id: &str, segment: &[Value]) -> Result<()> {
        let ids = ids(segment);
        if ids.is_empty() {
            return Ok(());
        }
        let touched = self.for_descendants(tree, object_id, |path| UpdateOp::PullIds(format!("{path}.{TREE}"), ids.clone()))?;
        log::debug!("tree {tree}: detached {} ancestors from {touched} descendants of {object_id}", ids.len());
        Ok(())
    }

    /// Put `segment` in front of the breadcrumbs of all descendants of `object_id`.
    pub fn attach(&self, tree: &str, object_id: &str, segment: &[Value]) -> Result<()> {
        if segment.is_empty() {
            return Ok(());
        }
        let crumbs: Vec<Value> = segment.iter().map(|c| codec::to_native(stub_of(c))).collect();
        let touched = self.for_descendants(tree, object_id, |path| UpdateOp::Prepend(format!("{path}.{TREE}"), crumbs.clone()))?;
        log::debug!("tree {tree}: attached {} ancestors to {touched} descendants of {object_id}", crumbs.len());
        Ok(())
    }

    /// Replace the `old` ancestor segment of `object_id`'s subtree with `new`.
    pub fn move_subtree(&self, tree: &str, object_id: &str, old: &[Value], new: &[Value]) -> Result<()> {
        if ids(old) == ids(new) {
            return Ok(());
        }
        self.detach(tree, object_id, old)?;
        self.attach(tree, object_id, new)
    }
}
