use super::{check_unique, document_id, select, DocumentStore, Filter, FindOptions, IndexSpec, Update, UpdateResult};
use crate::error::Result;
use serde_json::Value;
use std::collections::HashMap;
use parking_lot::RwLock;

/// In-process store keeping every collection as a vector of documents in
/// insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: Vec<Value>,
    indexes: Vec<IndexSpec>,
}

impl MemoryCollection {
    /// Apply `update` to the document at `position`, enforcing unique indexes.
    fn apply_at(&mut self, collection: &str, position: usize, update: &Update) -> Result<bool> {
        let mut next = self.documents[position].clone();
        if !update.apply(&mut next) {
            return Ok(false);
        }
        let others = self
            .documents
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != position)
            .map(|(_, d)| d);
        check_unique(collection, &self.indexes, others, &next)?;
        self.documents[position] = next;
        Ok(true)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn define(&self, collection: &str, indexes: &[IndexSpec]) -> Result<()> {
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        for index in indexes {
            entry.indexes.retain(|existing| existing.name != index.name);
            entry.indexes.push(index.clone());
        }
        Ok(())
    }

    fn find(&self, collection: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Value>> {
        let collections = self.collections.read();
        Ok(match collections.get(collection) {
            Some(c) => select(c.documents.iter(), filter, options),
            None => Vec::new(),
        })
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let collections = self.collections.read();
        Ok(collections.get(collection).map_or(0, |c| {
            c.documents.iter().filter(|d| filter.matches(d)).count() as u64
        }))
    }

    fn insert_one(&self, collection: &str, document: Value) -> Result<()> {
        document_id(&document)?;
        let mut collections = self.collections.write();
        let entry = collections.entry(collection.to_string()).or_default();
        check_unique(collection, &entry.indexes, entry.documents.iter(), &document)?;
        entry.documents.push(document);
        Ok(())
    }

    fn update_one(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut collections = self.collections.write();
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(UpdateResult::default());
        };
        let Some(position) = entry.documents.iter().position(|d| filter.matches(d)) else {
            return Ok(UpdateResult::default());
        };
        let modified = entry.apply_at(collection, position, update)?;
        Ok(UpdateResult {
            matched: 1,
            modified: modified as u64,
        })
    }

    fn update_many(&self, collection: &str, filter: &Filter, update: &Update) -> Result<UpdateResult> {
        let mut collections = self.collections.write();
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(UpdateResult::default());
        };
        let positions: Vec<usize> = entry
            .documents
            .iter()
            .enumerate()
            .filter(|(_, d)| filter.matches(d))
            .map(|(i, _)| i)
            .collect();
        let mut result = UpdateResult::default();
        for position in positions {
            result.matched += 1;
            if entry.apply_at(collection, position, update)? {
                result.modified += 1;
            }
        }
        Ok(result)
    }

    fn delete_one(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut collections = self.collections.write();
        let Some(entry) = collections.get_mut(collection) else {
            return Ok(0);
        };
        match entry.documents.iter().position(|d| filter.matches(d)) {
            Some(position) => {
                entry.documents.remove(position);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn clear(&self, collection: &str) -> Result<()> {
        if let Some(entry) = self.collections.write().get_mut(collection) {
            entry.documents.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::{SortKey, UpdateOp};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.define("user", &[IndexSpec::unique(&["email"])]).unwrap();
        store
            .insert_one("user", json!({"_id": {"$oid": "1"}, "email": "a@x.io", "order": 2}))
            .unwrap();
        store
            .insert_one("user", json!({"_id": {"$oid": "2"}, "email": "b@x.io", "order": 1}))
            .unwrap();
        store
    }

    #[test]
    fn test_insert_find_count() {
        let store = store();
        let found = store
            .find("user", &Filter::All, &FindOptions::sorted(vec![SortKey::asc("order")]))
            .unwrap();
        assert_eq!(found[0]["email"], json!("b@x.io"));
        assert_eq!(store.count("user", &Filter::eq("email", "a@x.io")).unwrap(), 1);
        assert_eq!(store.count("missing", &Filter::All).unwrap(), 0);
        assert!(store.find_one("user", &Filter::id("2")).unwrap().is_some());
    }

    #[test]
    fn test_insert_duplicate_email() {
        let store = store();
        let err = store
            .insert_one("user", json!({"_id": {"$oid": "3"}, "email": "a@x.io"}))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(store.count("user", &Filter::All).unwrap(), 2);
    }

    #[test]
    fn test_update_rejects_duplicate_and_keeps_document() {
        let store = store();
        let err = store
            .update_one("user", &Filter::id("2"), &Update::new().set("email", json!("a@x.io")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        let doc = store.find_one("user", &Filter::id("2")).unwrap().unwrap();
        assert_eq!(doc["email"], json!("b@x.io"));
    }

    #[test]
    fn test_update_many_and_delete() {
        let store = store();
        let result = store
            .update_many("user", &Filter::Gte("order".into(), json!(1)), &Update::new().inc("order", 1))
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 2, modified: 2 });

        let unchanged = store
            .update_one(
                "user",
                &Filter::id("1"),
                &Update::new().push(UpdateOp::PullById("children".into(), json!("x"))),
            )
            .unwrap();
        assert_eq!(unchanged, UpdateResult { matched: 1, modified: 0 });

        assert_eq!(store.delete_one("user", &Filter::id("1")).unwrap(), 1);
        assert_eq!(store.delete_one("user", &Filter::id("1")).unwrap(), 0);
        store.clear("user").unwrap();
        assert_eq!(store.count("user", &Filter::All).unwrap(), 0);
    }

    #[test]
    fn test_shared_across_threads() {
        let store = store();
        std::thread::scope(|scope| {
            for i in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    let email = format!("t{i}@x.io");
                    store
                        .insert_one("user", json!({"_id": {"$oid": format!("t{i}")}, "email": email, "order": 3}))
                        .unwrap();
                    store.count("user", &Filter::eq("email", email.as_str())).unwrap()
                });
            }
        });
        assert_eq!(store.count("user", &Filter::Eq("order".into(), json!(3))).unwrap(), 8);
        assert_eq!(store.count("user", &Filter::All).unwrap(), 10);
    }
}
