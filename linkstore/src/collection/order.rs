//! Dense `order` maintenance within an order scope.

use crate::document::{codec, get_path, ID, ORDER};
use crate::error::Result;
use crate::schema::TypeSchema;
use crate::store::{DocumentStore, Filter, FindOptions, SortKey, Update};
use serde_json::{Map, Value};

/// Filter selecting the documents sharing `document`'s scope.
pub(crate) fn scope_filter(schema: &TypeSchema, document: &Value) -> Filter {
    schema
        .order_scope()
        .iter()
        .map(|path| match get_path(document, path) {
            Some(Value::Object(map)) if map.get(ID).map_or(false, |id| !id.is_null()) => {
                Filter::Eq(format!("{path}.{ID}"), map[ID].clone())
            }
            Some(v) if !v.is_null() && !v.is_object() => Filter::Eq(path.clone(), v.clone()),
            _ => Filter::Or(vec![
                Filter::Eq(path.clone(), Value::Null),
                Filter::Eq(path.clone(), Value::Object(Map::new())),
            ]),
        })
        .fold(Filter::All, Filter::and)
}

/// Comparable scope identity of a document.
pub(crate) fn scope_key(schema: &TypeSchema, document: &Value) -> Vec<Option<String>> {
    schema
        .order_scope()
        .iter()
        .map(|path| match get_path(document, path) {
            Some(Value::Object(map)) => map.get(ID).and_then(codec::id_string),
            Some(Value::Null) | None => None,
            Some(v) => Some(v.to_string()),
        })
        .collect()
}

fn order_of(document: &Value) -> Option<i64> {
    document.get(ORDER).and_then(Value::as_i64)
}

pub(crate) struct Allocator<'a> {
    pub store: &'a dyn DocumentStore,
    pub collection: &'a str,
    pub schema: &'a TypeSchema,
}

impl Allocator<'_> {
    fn siblings(&self, document: &Value, id: &str) -> Filter {
        scope_filter(self.schema, document)
            .and(Filter::Ne(ID.into(), codec::oid(id)))
            .and(Filter::Eq(crate::document::TYPE.into(), Value::from(self.schema.name.as_str())))
    }

    fn shift(&self, scope: Filter, by: i64) -> Result<()> {
        let result = self
            .store
            .update_many(self.collection, &scope, &Update::new().inc(ORDER, by))?;
        log::debug!(
            "{}: shifted {} documents by {by}",
            self.collection,
            result.modified
        );
        Ok(())
    }

    fn assign(&self, id: &str, order: i64) -> Result<()> {
        self.store
            .update_one(self.collection, &Filter::id(id), &Update::new().set(ORDER, Value::from(order)))?;
        Ok(())
    }

    /// Place a newly created (or newly scoped) document. Without a target it
    /// is appended; a target is clamped to `1..=N+1` and later siblings move
    /// down by one.
    pub fn place_new(&self, id: &str, document: &Value, requested: Option<i64>) -> Result<i64> {
        let siblings = self.siblings(document, id);
        let count = self.store.count(self.collection, &siblings)? as i64;
        let max = self
            .store
            .find(
                self.collection,
                &siblings,
                &FindOptions {
                    sort: vec![SortKey::desc(ORDER)],
                    limit: Some(1),
                    ..Default::default()
                },
            )?
            .first()
            .and_then(order_of)
            .unwrap_or(0);
        let order = match requested {
            None => max + 1,
            Some(target) => {
                let target = target.clamp(1, count + 1);
                self.shift(siblings.and(Filter::Gte(ORDER.into(), Value::from(target))), 1)?;
                target
            }
        };
        self.assign(id, order)?;
        Ok(order)
    }

    /// Move a document within its scope from its previous order to `requested`.
    pub fn reorder(&self, id: &str, document: &Value, previous: &Value, requested: Option<i64>) -> Result<Option<i64>> {
        if scope_key(self.schema, document) != scope_key(self.schema, previous) {
            if let Some(old) = order_of(previous) {
                self.compact(id, previous, old)?;
            }
            return self.place_new(id, document, requested).map(Some);
        }
        let Some(requested) = requested else {
            if order_of(document).is_none() {
                return self.place_new(id, document, None).map(Some);
            }
            return Ok(None);
        };
        let Some(old) = order_of(previous) else {
            return self.place_new(id, document, Some(requested)).map(Some);
        };

        let siblings = self.siblings(document, id);
        let count = self.store.count(self.collection, &siblings)? as i64 + 1;
        let target = requested.clamp(1, count);
        if target > old {
            let range = Filter::Gt(ORDER.into(), Value::from(old)).and(Filter::Lte(ORDER.into(), Value::from(target)));
            self.shift(siblings.and(range), -1)?;
        } else if target < old {
            let range = Filter::Gte(ORDER.into(), Value::from(target)).and(Filter::Lt(ORDER.into(), Value::from(old)));
            self.shift(siblings.and(range), 1)?;
        }
        self.assign(id, target)?;
        Ok(Some(target))
    }

    /// Close the gap left by a document leaving its scope.
    pub fn compact(&self, id: &str, document: &Value, old: i64) -> Result<()> {
        let siblings = self.siblings(document, id);
        self.shift(siblings.and(Filter::Gt(ORDER.into(), Value::from(old))), -1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{parse_schema_str, SchemaRegistry};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn setup(n: i64) -> (MemoryStore, SchemaRegistry) {
        let yaml = "types:\n  item:\n    order:\n      scope: [group]\n    model:\n      type: object\n      properties:\n        group: { type: string }\n";
        let registry = SchemaRegistry::from_definition(&parse_schema_str(yaml).unwrap()).unwrap();
        let store = MemoryStore::new();
        for i in 1..=n {
            store
                .insert_one("item", json!({"_id": {"$oid": format!("i{i}")}, "_type": "item", "group": "a", "order": i}))
                .unwrap();
        }
        (store, registry)
    }

    fn orders(store: &MemoryStore) -> Vec<(String, i64)> {
        let mut out: Vec<(String, i64)> = store
            .find("item", &Filter::eq("group", "a"), &FindOptions::sorted(vec![SortKey::asc(ORDER)]))
            .unwrap()
            .into_iter()
            .map(|d| (codec::id_string(&d[ID]).unwrap(), d[ORDER].as_i64().unwrap()))
            .collect();
        out.sort_by_key(|(_, o)| *o);
        out
    }

    #[test]
    fn test_move_up_shifts_between() {
        let (store, registry) = setup(5);
        let allocator = Allocator { store: &store, collection: "item", schema: registry.get("item").unwrap() };
        let prev = store.find_one("item", &Filter::id("i4")).unwrap().unwrap();
        allocator.reorder("i4", &prev, &prev, Some(2)).unwrap();
        let ids: Vec<String> = orders(&store).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["i1", "i4", "i2", "i3", "i5"]);
        let values: Vec<i64> = orders(&store).into_iter().map(|(_, o)| o).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_move_down_and_clamp() {
        let (store, registry) = setup(4);
        let allocator = Allocator { store: &store, collection: "item", schema: registry.get("item").unwrap() };
        let prev = store.find_one("item", &Filter::id("i1")).unwrap().unwrap();
        let placed = allocator.reorder("i1", &prev, &prev, Some(99)).unwrap();
        assert_eq!(placed, Some(4));
        let ids: Vec<String> = orders(&store).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["i2", "i3", "i4", "i1"]);
    }

    #[test]
    fn test_place_new_append_and_insert() {
        let (store, registry) = setup(3);
        let allocator = Allocator { store: &store, collection: "item", schema: registry.get("item").unwrap() };
        let doc = json!({"_id": {"$oid": "n"}, "_type": "item", "group": "a"});
        store.insert_one("item", doc.clone()).unwrap();
        assert_eq!(allocator.place_new("n", &doc, None).unwrap(), 4);

        let doc = json!({"_id": {"$oid": "m"}, "_type": "item", "group": "a"});
        store.insert_one("item", doc.clone()).unwrap();
        assert_eq!(allocator.place_new("m", &doc, Some(0)).unwrap(), 1);
        let values: Vec<i64> = orders(&store).into_iter().map(|(_, o)| o).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(orders(&store)[0].0, "m");
    }

    #[test]
    fn test_scope_filter_for_missing_relation() {
        let yaml = "types:\n  item:\n    order:\n      scope: [parent]\n    model:\n      type: object\n      properties:\n        parent: { type: object }\n";
        let registry = SchemaRegistry::from_definition(&parse_schema_str(yaml).unwrap()).unwrap();
        let schema = registry.get("item").unwrap();
        let filter = scope_filter(schema, &json!({"parent": {}}));
        assert!(filter.matches(&json!({"parent": {}})));
        assert!(filter.matches(&json!({})));
        assert!(!filter.matches(&json!({"parent": {"_id": {"$oid": "p"}}})));

        let filter = scope_filter(schema, &json!({"parent": {"_id": {"$oid": "p"}, "_type": "item"}}));
        assert!(filter.matches(&json!({"parent": {"_id": {"$oid": "p"}, "name": "x"}})));
    }

    fn node_orders(storage: &crate::storage::Storage, ids: &[&String]) -> Vec<i64> {
        let nodes = storage.get("node").unwrap();
        ids.iter()
            .map(|id| nodes.raw_one(&Filter::id(id)).unwrap().unwrap()[ORDER].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_orders_stay_dense_through_writes() {
        use crate::fixtures::{memory_storage, session};

        let storage = memory_storage();
        let nodes = storage.get("node").unwrap();
        let create = |body: Value| nodes.create_one(body, &session(), None).unwrap()["_id"].as_str().unwrap().to_string();
        let p = create(json!({"name": "p"}));
        let a = create(json!({"name": "a", "parent": {"_id": p}}));
        let b = create(json!({"name": "b", "parent": {"_id": p}}));
        let c = create(json!({"name": "c", "parent": {"_id": p}}));
        assert_eq!(node_orders(&storage, &[&p, &a, &b, &c]), vec![1, 1, 2, 3]);

        let d = create(json!({"name": "d", "parent": {"_id": p}, "order": 2}));
        assert_eq!(node_orders(&storage, &[&a, &d, &b, &c]), vec![1, 2, 3, 4]);

        let moved = nodes.update_one(&c, json!({"order": 1}), &session(), None).unwrap();
        assert_eq!(moved["order"], json!(1));
        assert_eq!(node_orders(&storage, &[&c, &a, &d, &b]), vec![1, 2, 3, 4]);

        // leaving the scope closes the gap and appends among the roots
        nodes.update_one(&a, json!({"parent": {}}), &session(), None).unwrap();
        assert_eq!(node_orders(&storage, &[&c, &d, &b]), vec![1, 2, 3]);
        assert_eq!(node_orders(&storage, &[&p, &a]), vec![1, 2]);

        nodes.destroy_one(&d, &session()).unwrap();
        assert_eq!(node_orders(&storage, &[&c, &b]), vec![1, 2]);
    }

    #[test]
    fn test_mirrored_parent_keeps_scopes_dense() {
        use crate::fixtures::{memory_storage, session};

        let storage = memory_storage();
        let nodes = storage.get("node").unwrap();
        let create = |body: Value| nodes.create_one(body, &session(), None).unwrap()["_id"].as_str().unwrap().to_string();
        let p1 = create(json!({"name": "p1"}));
        let p2 = create(json!({"name": "p2"}));
        let a = create(json!({"name": "a", "parent": {"_id": p1}}));
        let b = create(json!({"name": "b", "parent": {"_id": p1}}));
        let c = create(json!({"name": "c", "parent": {"_id": p2}}));
        assert_eq!(node_orders(&storage, &[&a, &b, &c]), vec![1, 2, 1]);

        // a moves to p2 through the parent's side of the relation
        nodes
            .update_one(&p2, json!({"children": [{"_id": c}, {"_id": a}]}), &session(), None)
            .unwrap();
        let parent_of = |id: &str| {
            let document = codec::to_canonical(nodes.raw_one(&Filter::id(id)).unwrap().unwrap());
            document["parent"]["_id"].clone()
        };
        assert_eq!(parent_of(&a), json!(p2));
        assert_eq!(node_orders(&storage, &[&c, &a]), vec![1, 2]);
        assert_eq!(node_orders(&storage, &[&b]), vec![1]);

        // dropped from the array, a becomes a root and is appended there
        nodes.update_one(&p2, json!({"children": [{"_id": c}]}), &session(), None).unwrap();
        assert_eq!(parent_of(&a), json!({}));
        assert_eq!(node_orders(&storage, &[&p1, &p2, &a]), vec![1, 2, 3]);
        assert_eq!(node_orders(&storage, &[&c]), vec![1]);
    }
}
