//! Relation stubs and their mirrors.
//!
//! A relation is stored as a stub `{_id, _type, ...copied fields}` on the
//! owning document. When the owner changes, the referenced document's
//! inverse path is updated to point back. Mirror writes go straight to the
//! store and never cascade further.

use super::order;
use super::tree::{self, Propagator};
use super::{Collection, LinkContext};
use crate::document::{
    assign, codec, get_path, is_link, link_id, link_type, scalar_values, set_path, stub_of, ID, ORDER, SEARCH, TREE, TYPE,
};
use crate::error::{Error, Issue, Result};
use crate::journal::{LinkFailure, LinkOperation};
use crate::schema::{FieldSchema, FieldType, RelationSpec, Size};
use crate::session::Session;
use crate::store::{Filter, FindOptions, Update, UpdateOp};
use crate::view::{FieldSelector, ViewMode, ViewOptions};
use serde_json::{json, Map, Value};

const NOT_FOUND_MESSAGE: &str = "Not found relation object";

/// Callbacks a collection receives about relations pointing at its documents.
pub trait RelationProtocol {
    /// `object` now references `link` through its relation `path`.
    fn on_foreign_add(&self, object: &Value, path: &str, link: &Value) -> Result<()>;

    /// `object` no longer references `link` through `path`.
    fn on_foreign_delete(&self, object: &Value, path: &str, link: &Value) -> Result<()>;

    /// `object` changed while still referencing `link`; refresh copied fields.
    fn on_foreign_update(&self, object: &Value, path: &str, link: &Value) -> Result<()>;

    /// Stub to store at `path` for a relation to the document `link`.
    fn on_link_prepare(&self, path: &str, link: &Value) -> Result<Value>;
}

fn same_id(a: &Value, b: &Value) -> bool {
    match (link_id(a).and_then(codec::id_string), link_id(b).and_then(codec::id_string)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn id_of(value: &Value) -> Result<String> {
    link_id(value)
        .and_then(codec::id_string)
        .ok_or_else(|| Error::Store(format!("relation value without {ID}: {value}")))
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn snapshot_options(fields: &FieldSelector) -> ViewOptions {
    ViewOptions::raw()
        .mode(ViewMode { types: true, schema: false, fields: true })
        .select(Some(fields.clone()))
}

/// Schema of the field at a relation path; array relations resolve to the
/// array field.
fn field_at<'s>(schema: &'s FieldSchema, path: &str) -> Option<&'s FieldSchema> {
    path.split('.').try_fold(schema, |current, segment| current.properties.get(segment))
}

impl<'a> Collection<'a> {
    fn propagator(&self) -> Propagator<'a> {
        Propagator {
            store: self.storage.store(),
            registry: self.storage.registry(),
        }
    }

    /// Relation specs of this type mirroring `path` of `object`'s type.
    fn inverse_of<'s>(&'s self, path: &'s str, object: &'s Value) -> impl Iterator<Item = (&'a String, &'a RelationSpec)> + 's {
        let object_type = link_type(object).unwrap_or_default();
        self.schema
            .relations
            .iter()
            .filter(move |(_, spec)| spec.inverse.as_deref() == Some(path) && spec.accepts(object_type))
    }

    /// Snapshot of `document` through `fields`, viewed by its own collection.
    fn snapshot(&self, document: &Value, fields: &FieldSelector) -> Result<Value> {
        let type_name = link_type(document).ok_or_else(|| Error::Store(format!("document without {TYPE}")))?;
        self.storage.get(type_name)?.view(document.clone(), &snapshot_options(fields))
    }

    /// Stub written on this collection's side at `key`, pointing back at `object`.
    fn mirror_stub(&self, key: &str, spec: &RelationSpec, object: &Value, with_tree: bool) -> Result<Value> {
        let mut stub = stub_of(object);
        if let Some(copy) = &spec.copy {
            assign(&mut stub, self.snapshot(object, copy)?);
        }
        if let Some(hook) = self.hooks.link_prepare.get(key) {
            let extra = hook(&LinkContext { path: key, object, foreign: true })?;
            assign(&mut stub, Value::Object(extra));
        }
        if let (true, Some(name)) = (with_tree, &spec.tree) {
            stub[TREE] = tree::child_breadcrumb(self.storage.registry(), object, name);
        }
        Ok(codec::to_native(stub))
    }

    /// Keep `order` dense after a mirror write at `key` moved document `id`
    /// out of the scope it had in `before`.
    fn rescope(&self, key: &str, id: &str, before: &Value) -> Result<()> {
        if !self.schema.order_scope().iter().any(|path| path == key) {
            return Ok(());
        }
        let Some(after) = self.raw_one(&Filter::id(id))? else {
            return Ok(());
        };
        if order::scope_key(self.schema, &after) == order::scope_key(self.schema, before) {
            return Ok(());
        }
        let allocator = self.allocator();
        if let Some(old) = before.get(ORDER).and_then(Value::as_i64) {
            allocator.compact(id, before, old)?;
        }
        let placed = allocator.place_new(id, &after, None)?;
        log::debug!("{}/{id}: {key} changed scope, placed at {placed}", self.type_name());
        Ok(())
    }

    /// Replace every relation value in `object` by a prepared stub. Values
    /// `{}` and `{_id: null}` clear the relation; unknown targets are
    /// reported as validation issues.
    pub(crate) fn resolve_links(&self, object: &mut Value, _session: &Session) -> Result<()> {
        let mut issues = Vec::new();
        for (path, spec) in &self.schema.relations {
            let Some(current) = get_path(object, path).filter(|v| !v.is_null()).cloned() else {
                continue;
            };
            let resolved = match (spec.size, current) {
                (Size::Many, Value::Array(items)) => {
                    let mut stubs = Vec::with_capacity(items.len());
                    for (i, item) in items.iter().enumerate() {
                        match self.resolve_stub(spec, item)? {
                            Some(stub) if stub.as_object().map_or(false, Map::is_empty) => {}
                            Some(stub) => stubs.push(stub),
                            None => issues.push(self.relation_issue(path, &format!("{path}.{i}"))),
                        }
                    }
                    Value::Array(stubs)
                }
                (Size::Many, _) => continue,
                (Size::One, value) => match self.resolve_stub(spec, &value)? {
                    Some(stub) => stub,
                    None => {
                        issues.push(self.relation_issue(path, path));
                        continue;
                    }
                },
            };
            set_path(object, path, resolved);
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(issues))
        }
    }

    fn relation_issue(&self, relation: &str, path: &str) -> Issue {
        let key = relation.rsplit('.').next().unwrap_or(relation);
        let message = field_at(&self.schema.definition.model, relation)
            .map(|field| match (field.field_type, &field.items) {
                (FieldType::Array, Some(items)) if items.rel.is_some() => items.as_ref(),
                _ => field,
            })
            .and_then(|field| field.messages.get("rel"))
            .map(|m| m.replace("{key}", key))
            .unwrap_or_else(|| NOT_FOUND_MESSAGE.to_string());
        Issue::new(path, "rel", message)
    }

    /// `Some({})` for a cleared relation, `Some(stub)` when the target
    /// exists, `None` when it does not.
    fn resolve_stub(&self, spec: &RelationSpec, value: &Value) -> Result<Option<Value>> {
        let id = match value {
            Value::Object(map) => map.get(ID).and_then(codec::id_string),
            Value::String(_) => codec::id_string(value),
            _ => None,
        };
        let Some(id) = id.filter(|id| id != "null") else {
            return Ok(Some(json!({})));
        };
        let candidates: Vec<&str> = match link_type(value) {
            Some(t) if spec.accepts(t) => vec![t],
            Some(_) => return Ok(None),
            None => spec.types.iter().map(String::as_str).collect(),
        };
        for type_name in candidates {
            let Ok(target) = self.storage.get(type_name) else {
                continue;
            };
            if let Some(link) = target.raw_one(&Filter::id(&id))? {
                return self.on_link_prepare(&spec.path, &link).map(Some);
            }
        }
        Ok(None)
    }

    /// Sync mirrors after a write and journal whatever failed.
    pub(crate) fn save_links(&self, object: &Value, previous: Option<&Value>) {
        let failures = self.collect_links(object, previous);
        if failures.is_empty() {
            return;
        }
        let journal = self.storage.journal();
        for failure in &failures {
            if let Err(e) = journal.record(failure) {
                log::error!("could not journal link failure {}: {e}", failure.id);
            }
        }
    }

    /// Sync mirrors, returning the notifications that failed.
    pub(crate) fn collect_links(&self, object: &Value, previous: Option<&Value>) -> Vec<LinkFailure> {
        let mut sync = LinkSync {
            owner: self,
            object,
            failures: Vec::new(),
        };
        sync.walk("", object, previous, true);
        sync.failures
    }

    /// Re-run relation sync on every matching document as if each relation
    /// had just been added. Returns the number of documents walked.
    pub fn remake_links(&self, filter: &Filter) -> Result<usize> {
        let documents = self
            .storage
            .store()
            .find(self.name(), &self.scoped(filter), &FindOptions::default())?;
        for document in &documents {
            self.save_links(document, None);
        }
        log::info!("{}: remade links of {} documents", self.type_name(), documents.len());
        Ok(documents.len())
    }
}

struct LinkSync<'c, 'a> {
    owner: &'c Collection<'a>,
    object: &'c Value,
    failures: Vec<LinkFailure>,
}

impl LinkSync<'_, '_> {
    fn walk(&mut self, path: &str, set: &Value, previous: Option<&Value>, can_delete: bool) {
        match set {
            Value::Array(items) => {
                let previous_items = previous.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[]);
                for item in items {
                    let previous_item = previous_items.iter().find(|p| same_id(p, item));
                    self.walk(path, item, previous_item, false);
                }
                for previous_item in previous_items.iter().filter(|p| is_link(p)) {
                    if !items.iter().any(|item| same_id(item, previous_item)) {
                        self.removed(path, previous_item);
                    }
                }
            }
            Value::Object(map) => {
                let previous_link = previous.filter(|p| is_link(p));
                if !path.is_empty() && is_link(set) {
                    match previous_link {
                        None => self.added(path, set),
                        Some(old) if !same_id(old, set) => {
                            if can_delete {
                                self.removed(path, old);
                            }
                            self.added(path, set);
                        }
                        Some(_) => self.notify(LinkOperation::Update, path, set),
                    }
                } else if !path.is_empty() && map.is_empty() {
                    if let Some(old) = previous_link {
                        self.removed(path, old);
                    }
                } else {
                    // stubs are handled above; `search` and `_tree` here are plain fields
                    for (key, value) in map {
                        if matches!(key.as_str(), ID | TYPE) {
                            continue;
                        }
                        self.walk(&join(path, key), value, previous.and_then(|p| p.get(key)), true);
                    }
                }
            }
            _ => {}
        }
    }

    fn tree_of(&self, path: &str) -> Option<&str> {
        self.owner.schema.relations.get(path)?.tree.as_deref()
    }

    fn added(&mut self, path: &str, link: &Value) {
        self.notify(LinkOperation::Add, path, link);
        if let Some(name) = self.tree_of(path) {
            let result = id_of(self.object)
                .and_then(|id| self.owner.propagator().attach(name, &id, &tree::segment(link)));
            if let Err(e) = result {
                self.fail(LinkOperation::Add, path, self.object, &e);
            }
        }
    }

    fn removed(&mut self, path: &str, link: &Value) {
        self.notify(LinkOperation::Delete, path, link);
        if let Some(name) = self.tree_of(path) {
            let result = id_of(self.object)
                .and_then(|id| self.owner.propagator().detach(name, &id, &tree::segment(link)));
            if let Err(e) = result {
                self.fail(LinkOperation::Delete, path, self.object, &e);
            }
        }
    }

    fn notify(&mut self, operation: LinkOperation, path: &str, link: &Value) {
        if !self.owner.schema.relations.contains_key(path) {
            return;
        }
        if let Err(e) = self.dispatch(operation, path, link) {
            self.fail(operation, path, link, &e);
        }
    }

    fn dispatch(&self, operation: LinkOperation, path: &str, link: &Value) -> Result<()> {
        let type_name = link_type(link).ok_or_else(|| Error::Store(format!("relation at {path} without {TYPE}")))?;
        let target = self.owner.storage.get(type_name)?;
        match operation {
            LinkOperation::Add => target.on_foreign_add(self.object, path, link),
            LinkOperation::Update => target.on_foreign_update(self.object, path, link),
            LinkOperation::Delete => target.on_foreign_delete(self.object, path, link),
        }
    }

    fn fail(&mut self, operation: LinkOperation, path: &str, target: &Value, error: &Error) {
        let object_id = link_id(self.object).and_then(codec::id_string).unwrap_or_default();
        let target_id = link_id(target).and_then(codec::id_string).unwrap_or_default();
        let target_type = link_type(target).unwrap_or_default();
        log::warn!(
            "{}/{object_id}: {} of relation {path} on {target_type}/{target_id} failed: {error}",
            self.owner.type_name(),
            operation.as_str()
        );
        self.failures.push(LinkFailure::new(
            operation,
            (self.owner.type_name(), &object_id),
            path,
            (target_type, &target_id),
            error,
        ));
    }
}

impl RelationProtocol for Collection<'_> {
    fn on_foreign_add(&self, object: &Value, path: &str, link: &Value) -> Result<()> {
        let link_id = id_of(link)?;
        let by_id = Filter::id(&link_id);
        let filter = self.scoped(&by_id);
        for (key, spec) in self.inverse_of(path, object) {
            let stub = self.mirror_stub(key, spec, object, true)?;
            match spec.size {
                Size::One => {
                    let current = self.raw_one(&by_id)?.ok_or_else(|| Error::not_found(self.name(), &link_id))?;
                    let occupant = get_path(&current, key).filter(|o| is_link(o)).cloned();
                    if let Some(occupant) = occupant.as_ref().filter(|o| !same_id(o, object)) {
                        let occupant_type = link_type(occupant).unwrap_or_default();
                        self.storage.get(occupant_type)?.on_foreign_delete(&current, key, occupant)?;
                    }
                    self.storage
                        .store()
                        .update_one(self.name(), &filter, &Update::new().set(key.as_str(), stub.clone()))?;
                    if let Some(name) = &spec.tree {
                        let old = occupant.as_ref().map(tree::segment).unwrap_or_default();
                        self.propagator().move_subtree(name, &link_id, &old, &tree::segment(&stub))?;
                    }
                    self.rescope(key, &link_id, &current)?;
                }
                Size::Many => {
                    let update = Update::new().push(UpdateOp::PushUnique(key.clone(), stub));
                    self.storage.store().update_one(self.name(), &filter, &update)?;
                }
            }
            log::debug!("{}/{link_id}: mirrored {key} after {path} add", self.type_name());
        }
        Ok(())
    }

    fn on_foreign_delete(&self, object: &Value, path: &str, link: &Value) -> Result<()> {
        let link_id = id_of(link)?;
        let object_id = codec::oid(&id_of(object)?);
        for (key, spec) in self.inverse_of(path, object) {
            if spec.remember {
                continue;
            }
            match spec.size {
                Size::One => {
                    let pointing = Filter::id(&link_id).and(Filter::Eq(format!("{key}.{ID}"), object_id.clone()));
                    let Some(current) = self.raw_one(&pointing)? else {
                        continue;
                    };
                    if let Some(name) = &spec.tree {
                        let old = get_path(&current, key).map(tree::segment).unwrap_or_default();
                        self.propagator().detach(name, &link_id, &old)?;
                    }
                    self.storage.store().update_one(
                        self.name(),
                        &self.scoped(&pointing),
                        &Update::new().set(key.as_str(), json!({})),
                    )?;
                    self.rescope(key, &link_id, &current)?;
                }
                Size::Many => {
                    let update = Update::new().push(UpdateOp::PullById(key.clone(), object_id.clone()));
                    self.storage
                        .store()
                        .update_one(self.name(), &self.scoped(&Filter::id(&link_id)), &update)?;
                }
            }
            log::debug!("{}/{link_id}: cleared {key} after {path} delete", self.type_name());
        }
        Ok(())
    }

    fn on_foreign_update(&self, object: &Value, path: &str, link: &Value) -> Result<()> {
        let link_id = id_of(link)?;
        let object_id = codec::oid(&id_of(object)?);
        for (key, spec) in self.inverse_of(path, object) {
            let Value::Object(mut fields) = self.mirror_stub(key, spec, object, false)? else {
                continue;
            };
            fields.remove(ID);
            fields.remove(TYPE);
            if fields.is_empty() {
                continue;
            }
            match spec.size {
                Size::One => {
                    let filter = self
                        .scoped(&Filter::id(&link_id))
                        .and(Filter::Eq(format!("{key}.{ID}"), object_id.clone()));
                    let update = fields
                        .into_iter()
                        .fold(Update::new(), |update, (field, value)| update.set(format!("{key}.{field}"), value));
                    self.storage.store().update_one(self.name(), &filter, &update)?;
                }
                Size::Many => {
                    let update = Update::new().push(UpdateOp::MergeItemById(key.clone(), object_id.clone(), fields));
                    self.storage
                        .store()
                        .update_one(self.name(), &self.scoped(&Filter::id(&link_id)), &update)?;
                }
            }
        }
        Ok(())
    }

    fn on_link_prepare(&self, path: &str, link: &Value) -> Result<Value> {
        let mut stub = stub_of(link);
        let Some(spec) = self.schema.relations.get(path) else {
            return Ok(codec::to_native(stub));
        };
        if let Some(copy) = &spec.copy {
            assign(&mut stub, self.snapshot(link, copy)?);
        }
        if let Some(hook) = self.hooks.link_prepare.get(path) {
            let extra = hook(&LinkContext { path, object: link, foreign: false })?;
            assign(&mut stub, Value::Object(extra));
        }
        if let Some(search) = &spec.search {
            let mut found = self.snapshot(link, search)?;
            if let Value::Object(map) = &mut found {
                map.remove(ID);
            }
            stub[SEARCH] = Value::Array(scalar_values(&found));
        }
        if let Some(name) = &spec.tree {
            stub[TREE] = tree::child_breadcrumb(self.storage.registry(), link, name);
        }
        Ok(codec::to_native(stub))
    }
}
