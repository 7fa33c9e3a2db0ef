//! Read-side projection: type reconversion, view-schema filtering and
//! field selection with relation hydration.

pub mod fields;

pub use fields::{parse_fields, FieldSelector, Selection, ALL};

use crate::document::{assign, codec, link_type, ID};
use crate::error::Result;
use crate::session::Session;
use crate::storage::Storage;
use crate::store::Filter;
use serde_json::{Map, Value};

/// Which projection stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewMode {
    /// Native ids and dates back to strings.
    pub types: bool,
    /// Filter through the type's view schema.
    pub schema: bool,
    /// Apply the field selector, hydrating relations.
    pub fields: bool,
}

impl ViewMode {
    pub const FULL: ViewMode = ViewMode { types: true, schema: true, fields: true };
    pub const RAW: ViewMode = ViewMode { types: false, schema: false, fields: false };

    pub fn is_on(&self) -> bool {
        self.types || self.schema || self.fields
    }
}

impl Default for ViewMode {
    fn default() -> Self {
        ViewMode::FULL
    }
}

/// How a read result is shaped.
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    pub mode: ViewMode,
    /// `None` means no projection.
    pub fields: Option<FieldSelector>,
    pub session: Session,
}

impl ViewOptions {
    pub fn new(session: &Session) -> Self {
        ViewOptions {
            session: session.clone(),
            ..Default::default()
        }
    }

    pub fn raw() -> Self {
        ViewOptions {
            mode: ViewMode::RAW,
            ..Default::default()
        }
    }

    pub fn select(mut self, fields: Option<FieldSelector>) -> Self {
        self.fields = fields;
        self
    }

    /// Parse and set a selection expression such as `"name, parent(name)"`.
    pub fn fields(self, expression: &str) -> Result<Self> {
        Ok(self.select(parse_fields(expression)?))
    }

    pub fn mode(mut self, mode: ViewMode) -> Self {
        self.mode = mode;
        self
    }

    /// True when the selector names `key` at the top level.
    pub fn selects(&self, key: &str) -> bool {
        self.fields.as_ref().map_or(false, |f| f.contains(key))
    }
}

enum Part {
    Ready(Value),
    /// Waiting for relation load `n`; the projected stub is merged over it.
    Pending(usize, Value),
}

enum Slot {
    One(Part),
    Many(Vec<Part>),
}

/// Applies field selectors to canonical documents, loading related
/// documents through their own collections.
pub struct Projector<'a> {
    storage: &'a Storage,
}

impl<'a> Projector<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Projector { storage }
    }

    /// Project `object` through `selector`. Missing top-level keys come back
    /// as `null`; `_id` is always kept.
    pub fn load_by_fields(&self, object: &Value, selector: Option<&FieldSelector>, session: &Session) -> Value {
        self.project(object, selector, true, session)
    }

    fn project(&self, object: &Value, selector: Option<&FieldSelector>, top: bool, session: &Session) -> Value {
        let (Some(selector), Value::Object(source)) = (selector, object) else {
            return object.clone();
        };
        let mut result = if selector.is_wildcard() { source.clone() } else { Map::new() };

        let mut jobs: Vec<(&Value, &FieldSelector)> = Vec::new();
        let mut slots: Vec<(String, Slot)> = Vec::new();
        for (key, selection) in selector.iter() {
            if key == ALL {
                continue;
            }
            match (source.get(key), selection) {
                (None, _) => {
                    if top {
                        result.insert(key.clone(), Value::Null);
                    }
                }
                (Some(Value::Array(items)), Selection::Nested(sub)) => {
                    let parts = items
                        .iter()
                        .map(|item| {
                            let link = self.project(item, Some(sub), false, session);
                            if is_loadable(item, sub) {
                                jobs.push((item, sub));
                                Part::Pending(jobs.len() - 1, link)
                            } else {
                                Part::Ready(link)
                            }
                        })
                        .collect();
                    slots.push((key.clone(), Slot::Many(parts)));
                }
                (Some(Value::Array(items)), Selection::All) => {
                    let collapsed = items.iter().map(collapse).collect();
                    result.insert(key.clone(), Value::Array(collapsed));
                }
                (Some(value @ Value::Object(_)), Selection::Nested(sub)) => {
                    let link = self.project(value, Some(sub), false, session);
                    let part = if is_loadable(value, sub) {
                        jobs.push((value, sub));
                        Part::Pending(jobs.len() - 1, link)
                    } else {
                        Part::Ready(link)
                    };
                    slots.push((key.clone(), Slot::One(part)));
                }
                (Some(value), _) => {
                    result.insert(key.clone(), collapse(value));
                }
            }
        }

        let mut loaded = self.fetch_all(&jobs, session);
        let mut settle = |part: Part, keep_unloaded: bool| -> Option<Value> {
            match part {
                Part::Ready(value) => Some(value),
                Part::Pending(n, link) => match loaded[n].take() {
                    Some(mut document) => {
                        assign(&mut document, link);
                        Some(document)
                    }
                    None if keep_unloaded => Some(link),
                    None => None,
                },
            }
        };
        for (key, slot) in slots {
            let value = match slot {
                Slot::One(part) => settle(part, true).unwrap_or(Value::Null),
                Slot::Many(parts) => Value::Array(parts.into_iter().filter_map(|p| settle(p, false)).collect()),
            };
            result.insert(key, value);
        }

        if let Some(id) = source.get(ID) {
            result.insert(ID.into(), id.clone());
        }
        Value::Object(result)
    }

    /// Load every job, `max_fanout` at a time, keeping job order.
    fn fetch_all(&self, jobs: &[(&Value, &FieldSelector)], session: &Session) -> Vec<Option<Value>> {
        if jobs.len() < 2 {
            return jobs
                .iter()
                .map(|(rel, fields)| self.load_rel(rel, fields, session))
                .collect();
        }
        let fanout = self.storage.config().max_fanout.max(1);
        let mut out = Vec::with_capacity(jobs.len());
        for chunk in jobs.chunks(fanout) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|(rel, fields)| scope.spawn(move || self.load_rel(rel, fields, session)))
                    .collect();
                for handle in handles {
                    out.push(handle.join().unwrap_or(None));
                }
            });
        }
        out
    }

    /// Fetch and view the document a stub points at. Any failure, including
    /// a soft-deleted or missing target, yields `None`.
    pub fn load_rel(&self, rel: &Value, fields: &FieldSelector, session: &Session) -> Option<Value> {
        let id = rel.get(ID).and_then(codec::id_string)?;
        let type_name = link_type(rel)?;
        let options = ViewOptions::new(session).select(Some(fields.clone()));
        let loaded = self
            .storage
            .get(type_name)
            .and_then(|collection| collection.get_one(&Filter::id(&id), &options));
        match loaded {
            Ok(document) => Some(document),
            Err(e) => {
                log::debug!("relation {type_name}/{id} not loaded: {e}");
                None
            }
        }
    }
}

/// Relation stubs worth loading: carrying an id, with more than `_id` asked.
fn is_loadable(value: &Value, sub: &FieldSelector) -> bool {
    value.get(ID).map_or(false, |id| !id.is_null()) && link_type(value).is_some() && !sub.is_empty() && !sub.only_id()
}

/// Selected without a sub-selector: relation objects shrink to `{_id}`.
fn collapse(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.get(ID).map_or(false, |id| !id.is_null()) => {
            let mut stub = Map::new();
            stub.insert(ID.into(), map[ID].clone());
            Value::Object(stub)
        }
        Value::Array(items) => Value::Array(items.iter().map(collapse).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{memory_storage, session};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn create(storage: &Storage, type_name: &str, body: Value) -> String {
        let created = storage.get(type_name).unwrap().create_one(body, &session(), None).unwrap();
        created["_id"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_hydrates_nested_relations() {
        let storage = memory_storage();
        let user = create(&storage, "user", json!({"name": "Ann", "email": "ann@example.com", "password": "x"}));
        let tags: Vec<String> = ["Rust", "Go", "Zig"]
            .iter()
            .map(|title| create(&storage, "tag", json!({ "title": title })))
            .collect();
        let links: Vec<Value> = tags.iter().map(|id| json!({ "_id": id })).collect();
        let post = create(&storage, "post", json!({"title": "Hello", "author": {"_id": user}, "tags": links}));
        storage.get("tag").unwrap().destroy_one(&tags[1], &session()).unwrap();

        let options = ViewOptions::new(&session()).fields("title, body, author(name, email), tags(title)").unwrap();
        let view = storage.get("post").unwrap().get_one(&Filter::id(&post), &options).unwrap();
        assert_eq!(
            view,
            json!({
                "_id": post,
                "title": "Hello",
                "body": null,
                "author": {"_id": user, "name": "Ann", "email": "ann@example.com"},
                "tags": [{"_id": tags[0], "title": "Rust"}, {"_id": tags[2], "title": "Zig"}],
            })
        );

        // projecting an already projected document loads nothing more
        let again = Projector::new(&storage).load_by_fields(&view, options.fields.as_ref(), &session());
        assert_eq!(again, view);
    }

    #[test]
    fn test_selection_without_nesting_collapses_relations() {
        let storage = memory_storage();
        let user = create(&storage, "user", json!({"name": "Ann", "email": "ann@example.com"}));
        let post = create(&storage, "post", json!({"title": "Hello", "author": {"_id": user}}));

        let options = ViewOptions::new(&session()).fields("author").unwrap();
        let view = storage.get("post").unwrap().get_one(&Filter::id(&post), &options).unwrap();
        assert_eq!(view, json!({"_id": post, "author": {"_id": user}}));

        let options = ViewOptions::new(&session()).fields("author(_id)").unwrap();
        let view = storage.get("post").unwrap().get_one(&Filter::id(&post), &options).unwrap();
        assert_eq!(view["author"], json!({"_id": user}));
    }

    #[test]
    fn test_soft_deleted_target_keeps_stub() {
        let storage = memory_storage();
        let user = create(&storage, "user", json!({"name": "Ann", "email": "ann@example.com"}));
        let post = create(&storage, "post", json!({"title": "Hello", "author": {"_id": user}}));
        storage.get("user").unwrap().delete_one(&user, &session()).unwrap();

        let options = ViewOptions::new(&session()).fields("author(name, email)").unwrap();
        let view = storage.get("post").unwrap().get_one(&Filter::id(&post), &options).unwrap();
        assert_eq!(view["author"], json!({"_id": user, "name": "Ann"}));
    }

    #[test]
    fn test_view_schema_hides_fields() {
        let storage = memory_storage();
        let user = create(&storage, "user", json!({"name": "Ann", "email": "ann@example.com", "password": "x"}));
        let users = storage.get("user").unwrap();

        let view = users.get_one(&Filter::id(&user), &ViewOptions::new(&session())).unwrap();
        assert!(view.get("password").is_none());

        let raw = users.get_one(&Filter::id(&user), &ViewOptions::raw()).unwrap();
        assert_eq!(raw["password"], json!("x"));
        assert_eq!(raw["_id"], codec::oid(&user));
    }
}
